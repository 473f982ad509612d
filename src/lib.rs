//! docqueue - distributed file-processing queue and workflow engine on Postgres.

pub mod backends;
pub mod config;
pub mod db;
pub mod ledger;
pub mod model;
pub mod observability;
pub mod queue;
pub mod worker;

pub use backends::{
    ErrorKind, MemoryBackend, PostgresBackend, QueueBackend, QueueError, QueueResult,
};
pub use config::{LeaseConfig, LockConfig, QueueConfig};
pub use model::{
    Action, ActionId, AggregateStats, DequeueOrder, FileId, FileRecord, LeaseId, Outcome,
    Priority, QueueMode, QueueRecord, QueueStatus, QueuedFile, RevertReport, RevertSummary,
    StatusCounters, WorkerLease, Workflow, WorkflowId, WorkflowType,
};
pub use observability::obs;
pub use queue::{
    AdvisoryLock, BackoffPolicy, DequeueRequest, EnqueueRequest, LockScope, QueueContext,
    QueueSession, RetryPolicy, SetStatusRequest, WorkflowSelector, spawn_revert_sweeper,
};
pub use worker::{FileProcessor, WorkerLoop, WorkerLoopConfig, WorkerStats};
