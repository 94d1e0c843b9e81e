//! Monotonic millisecond clock shared by expiry and access tracking.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds elapsed since the clock was first read in this process.
///
/// Starts at 1 so that 0 can never be mistaken for a real timestamp.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64 + 1
}
