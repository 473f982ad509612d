//! Storage backends for the queue.

mod base;
#[cfg(any(test, feature = "testing"))]
mod fault_injection;
mod memory;
mod postgres;

pub use base::{
    ActionScope, BulkStatusChange, DequeueBackend, DequeueClaim, EnqueueFile, EnqueueOutcome,
    ErrorKind, LeaseBackend, LedgerBackend, LockAttempt, LockBackend, LockMode, NewAction,
    NewLease, NewWorkflow, QueueBackend, QueueError, QueueResult, RegistryBackend, StatsBackend,
    StatusTransition, TransitionOutcome,
};
#[cfg(any(test, feature = "testing"))]
pub use fault_injection::{Fault, FaultInjectingBackend};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
