//! Locker background tasks
//!
//! Long-running filter work (blocklist imports, rule archive parsing,
//! index save/load) runs here instead of on the dispatch thread:
//! - Fixed pool of named worker threads with panic isolation
//! - Bounded job queue, submission fails fast when full
//! - Per-task cancellation tokens so a session stop can abandon work
//! - Event stream back to the dispatch side

mod cancel;
mod message;
mod pool;

pub use cancel::{CancelToken, Cancelled};
pub use message::{TaskEvent, TaskId};
pub use pool::{PoolConfig, PoolError, TaskContext, TaskError, TaskPool, TaskResult};
