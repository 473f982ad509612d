//! Session-level queue operations layered over a backend.
//!
//! Every operation runs once without the advisory lock and is re-run under it
//! when the backend reports contention or a stale read; transient database
//! failures are retried with jittered backoff.

mod context;
mod dequeue;
mod heartbeat;
mod lease;
mod lock;
mod registry;
mod retry;
mod session;
mod stats;
mod status;

pub use context::QueueContext;
pub use dequeue::DequeueRequest;
pub use heartbeat::{RevertSweeperTask, spawn_revert_sweeper};
pub use lock::AdvisoryLock;
pub use registry::WorkflowSelector;
pub use retry::{BackoffPolicy, LockScope, RetryPolicy};
pub use session::QueueSession;
pub use status::{EnqueueRequest, SetStatusRequest};
