// Core modules for the Nietzsche key-value server
pub mod clock; // monotonic millisecond clock for TTLs and LRU stamps
pub mod commands; // CommandRegistry + built-in command handlers
pub mod config; // Config loaded from NIETZSCHE_* environment variables
pub mod dispatch; // key hash -> worker routing
pub mod eviction; // LRU candidate pool
pub mod io_handler; // per-thread connection event loops
pub mod lifecycle; // Idle/Busy/ShuttingDown state machine + shutdown coordinator
pub mod multiplexer; // readiness notification over mio
pub mod net; // bind_reuseport + listener pool + Server
pub mod protocol; // RESP parser + encoders
pub mod shard; // Shard::exec + worker threads
pub mod signal; // SIGINT/SIGTERM self-pipe
pub mod storage; // Store with TTLs and eviction

// Re-export the items most callers need
pub use commands::{CommandHandler, CommandRegistry};
pub use config::{Config, ConfigError, EvictionPolicy, Mode, StoreConfig};
pub use lifecycle::{Lifecycle, ShutdownCoordinator, Status};
pub use net::{bind_reuseport, Server};
pub use protocol::*;
pub use shard::*;
pub use storage::*;

/// Default server port
pub const DEFAULT_PORT: u16 = 3000;
/// Default server address
pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";
