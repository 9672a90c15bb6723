//! In-process task queues for proofbot.
//!
//! - **Dispatch**: FIFO calls to the chat platform, capped per rolling second
//! - **CPU**: blocking analysis on dedicated threads, bounded by worker count
//! - **Durable**: relational and blob writes, sharded by entity key and gated
//!   below the backing store's connection limit
//!
//! Every `submit` returns immediately with a [`TaskHandle`] that resolves
//! exactly once.

pub mod cpu;
pub mod dispatch;
pub mod durable;
mod envelope;
mod signal;
pub mod stats;

pub use cpu::{CPU_QUEUE, CpuQueue};
pub use dispatch::{DISPATCH_QUEUE, DispatchQueue};
pub use durable::{BLOB_QUEUE, DurableQueue, RELATIONAL_QUEUE, connection_gate};
pub use envelope::{TaskError, TaskHandle};
pub use stats::{QueueStats, QueueStatsSnapshot};
