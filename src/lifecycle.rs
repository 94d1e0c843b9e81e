/*!
 * Lifecycle Coordination
 *
 * Every engine thread (an IOHandler, a Worker, or the single-threaded loop)
 * owns a `Lifecycle`: a three-state machine moved only by compare-and-swap.
 *
 * ```text
 *   Idle ──begin()──▶ Busy ──(guard dropped)──▶ Idle
 *    │
 *    └──try_shutdown()──▶ ShuttingDown   (terminal)
 * ```
 *
 * The engine brackets each unit of work with `begin()` and the returned
 * guard. A shutdown requester can only claim an engine while it is idle, so
 * teardown never overlaps a request or an expiration sweep. A pending
 * request also makes `begin()` refuse new work, which bounds the wait to a
 * single in-flight unit.
 */

use crossbeam::utils::Backoff;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle = 0,
    Busy = 1,
    ShuttingDown = 2,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Idle,
            1 => Status::Busy,
            _ => Status::ShuttingDown,
        }
    }

    /// The transition table. `ShuttingDown` has no way out.
    pub fn can_transition(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::Idle, Status::Busy)
                | (Status::Busy, Status::Idle)
                | (Status::Idle, Status::ShuttingDown)
        )
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    status: AtomicU8,
    drain: AtomicBool,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AtomicU8::new(Status::Idle as u8),
            drain: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`; on failure returns the status actually observed
    fn transition(&self, from: Status, to: Status) -> Result<(), Status> {
        debug_assert!(from.can_transition(to), "illegal transition {from:?} -> {to:?}");
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Status::from_u8)
    }

    /// Enter `Busy` for one unit of work
    ///
    /// Returns `None` once shutdown is pending or complete; the caller must
    /// then stop its loop. Dropping the guard returns to `Idle`.
    pub fn begin(&self) -> Option<BusyGuard<'_>> {
        let backoff = Backoff::new();
        loop {
            if self.drain.load(Ordering::Acquire) {
                return None;
            }
            match self.transition(Status::Idle, Status::Busy) {
                Ok(()) => return Some(BusyGuard { lifecycle: self }),
                Err(Status::ShuttingDown) => return None,
                // only reachable if two threads share one lifecycle
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Claim `Idle -> ShuttingDown`. Fails while the engine is busy.
    pub fn try_shutdown(&self) -> bool {
        match self.transition(Status::Idle, Status::ShuttingDown) {
            Ok(()) => true,
            Err(status) => status == Status::ShuttingDown,
        }
    }

    /// Ask the engine to stop taking new work
    pub fn request_drain(&self) {
        self.drain.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.status() == Status::ShuttingDown
    }
}

/// Held while the engine is `Busy`
#[must_use = "dropping the guard immediately ends the busy section"]
pub struct BusyGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        // Busy -> Idle cannot fail: nobody else moves a busy lifecycle
        let _ = self.lifecycle.transition(Status::Busy, Status::Idle);
    }
}

/// Drives every registered lifecycle to `ShuttingDown`, stage by stage
///
/// Stages are claimed in order. Front-end stages (IOHandlers) go first, so
/// by the time back-end stages (Workers) are claimed no request is in flight.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    stages: Vec<Vec<Arc<Lifecycle>>>,
    requested: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, stage: Vec<Arc<Lifecycle>>) {
        self.stages.push(stage);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Block until every engine has been claimed
    ///
    /// Returns `false` without waiting if a shutdown was already requested.
    pub fn shutdown(&self) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            info!("shutdown already in progress");
            return false;
        }
        for stage in &self.stages {
            for lifecycle in stage {
                lifecycle.request_drain();
            }
            for lifecycle in stage {
                claim(lifecycle);
            }
        }
        info!("all engines idle, shutdown complete");
        true
    }
}

fn claim(lifecycle: &Lifecycle) {
    let backoff = Backoff::new();
    while !lifecycle.try_shutdown() {
        if backoff.is_completed() {
            std::thread::sleep(Duration::from_millis(1));
        } else {
            backoff.snooze();
        }
    }
    debug!("{} claimed for shutdown", lifecycle.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn transition_table() {
        use Status::*;
        assert!(Idle.can_transition(Busy));
        assert!(Busy.can_transition(Idle));
        assert!(Idle.can_transition(ShuttingDown));
        assert!(!Busy.can_transition(ShuttingDown));
        assert!(!ShuttingDown.can_transition(Idle));
        assert!(!ShuttingDown.can_transition(Busy));
    }

    #[test]
    fn guard_returns_to_idle() {
        let lc = Lifecycle::new("t");
        {
            let _busy = lc.begin().unwrap();
            assert_eq!(lc.status(), Status::Busy);
            assert!(!lc.try_shutdown());
        }
        assert_eq!(lc.status(), Status::Idle);
    }

    #[test]
    fn shutting_down_is_terminal() {
        let lc = Lifecycle::new("t");
        assert!(lc.try_shutdown());
        assert!(lc.is_shutting_down());
        assert!(lc.begin().is_none());
        // claiming twice is harmless
        assert!(lc.try_shutdown());
        assert_eq!(lc.status(), Status::ShuttingDown);
    }

    #[test]
    fn drain_refuses_new_work() {
        let lc = Lifecycle::new("t");
        lc.request_drain();
        assert!(lc.begin().is_none());
        assert_eq!(lc.status(), Status::Idle);
    }

    #[test]
    fn shutdown_waits_for_in_flight_work() {
        let lc = Arc::new(Lifecycle::new("engine"));
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.add_stage(vec![lc.clone()]);

        let engine = {
            let lc = lc.clone();
            thread::spawn(move || {
                let mut units = 0;
                while let Some(_busy) = lc.begin() {
                    thread::sleep(Duration::from_millis(20));
                    units += 1;
                }
                units
            })
        };

        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        assert!(coordinator.shutdown());
        assert!(lc.is_shutting_down());
        // at most the unit already running had to finish
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(engine.join().unwrap() >= 1);

        assert!(!coordinator.shutdown());
    }

    #[test]
    fn stages_are_claimed_in_order() {
        let front = Arc::new(Lifecycle::new("front"));
        let back = Arc::new(Lifecycle::new("back"));
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.add_stage(vec![front.clone()]);
        coordinator.add_stage(vec![back.clone()]);

        let busy = front.begin().unwrap();
        let c = Arc::new(coordinator);
        let waiter = {
            let c = c.clone();
            thread::spawn(move || c.shutdown())
        };
        thread::sleep(Duration::from_millis(30));
        // the back stage keeps working while the front stage is busy
        assert!(back.begin().is_some());
        assert_eq!(back.status(), Status::Idle);
        drop(busy);
        assert!(waiter.join().unwrap());
        assert!(front.is_shutting_down());
        assert!(back.is_shutting_down());
    }
}
