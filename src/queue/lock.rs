//! Polling acquisition of named advisory locks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::{LockAttempt, QueueBackend, QueueError, QueueResult};
use crate::config::LockConfig;

/// Named lock held on behalf of one owner (a queue session).
#[derive(Clone)]
pub struct AdvisoryLock {
    backend: Arc<dyn QueueBackend>,
    owner: Uuid,
    config: LockConfig,
}

impl AdvisoryLock {
    pub fn new(backend: Arc<dyn QueueBackend>, owner: Uuid, config: LockConfig) -> Self {
        Self {
            backend,
            owner,
            config,
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub async fn acquire(&self, name: &str) -> QueueResult<()> {
        self.acquire_within(name, self.config.timeout).await
    }

    /// Polls until the lock is ours, re-entrantly for the same owner. A holder
    /// older than the configured expiry is displaced.
    pub async fn acquire_within(&self, name: &str, timeout: Duration) -> QueueResult<()> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .backend
                .try_acquire_lock(name, self.owner, self.config.expiry)
                .await?
            {
                LockAttempt::Acquired => {
                    debug!(lock = name, owner = %self.owner, attempt, "advisory lock acquired");
                    return Ok(());
                }
                LockAttempt::Stolen { previous_owner } => {
                    warn!(
                        lock = name,
                        owner = %self.owner,
                        %previous_owner,
                        "took over expired advisory lock"
                    );
                    return Ok(());
                }
                LockAttempt::Busy { owner } => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(QueueError::LockTimeout {
                            name: name.to_string(),
                            holder: owner
                                .map(|owner| owner.to_string())
                                .unwrap_or_else(|| "unknown".to_string()),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    let delay = self
                        .config
                        .poll_backoff
                        .jittered_delay(attempt)
                        .min(timeout - waited);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Releasing a lock held by someone else is a no-op and returns false.
    pub async fn release(&self, name: &str) -> QueueResult<bool> {
        let released = self.backend.release_lock(name, self.owner).await?;
        if !released {
            debug!(lock = name, owner = %self.owner, "advisory lock was not held at release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::config::QueueConfig;

    fn lock_for(backend: &MemoryBackend, owner: Uuid) -> AdvisoryLock {
        let config = QueueConfig::test_config("memory://").lock;
        AdvisoryLock::new(Arc::new(backend.clone()), owner, config)
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_is_reentrant() {
        let backend = MemoryBackend::new();
        let lock = lock_for(&backend, Uuid::new_v4());
        lock.acquire("docqueue.main").await.expect("first");
        lock.acquire("docqueue.main").await.expect("second");
        assert_eq!(backend.lock_holder("docqueue.main"), Some(lock.owner()));
        assert!(lock.release("docqueue.main").await.expect("release"));
        assert_eq!(backend.lock_holder("docqueue.main"), None);
    }

    #[tokio::test]
    async fn test_foreign_holder_times_out() {
        let backend = MemoryBackend::new();
        let holder = lock_for(&backend, Uuid::new_v4());
        let waiter = lock_for(&backend, Uuid::new_v4());
        holder.acquire("docqueue.main").await.expect("holder");

        let err = waiter
            .acquire_within("docqueue.main", Duration::from_millis(30))
            .await
            .expect_err("busy lock");
        match err {
            QueueError::LockTimeout { name, holder: who, .. } => {
                assert_eq!(name, "docqueue.main");
                assert_eq!(who, holder.owner().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!waiter.release("docqueue.main").await.expect("foreign release"));
        assert_eq!(backend.lock_holder("docqueue.main"), Some(holder.owner()));
    }

    #[tokio::test]
    async fn test_expired_holder_is_displaced() {
        let backend = MemoryBackend::new();
        let crashed = lock_for(&backend, Uuid::new_v4());
        let next = lock_for(&backend, Uuid::new_v4());
        crashed.acquire("docqueue.main").await.expect("crashed");
        assert!(backend.set_lock_acquired_at("docqueue.main", Utc::now() - TimeDelta::minutes(5)));

        next.acquire("docqueue.main").await.expect("steal");
        assert_eq!(backend.lock_holder("docqueue.main"), Some(next.owner()));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let backend = MemoryBackend::new();
        let holder = lock_for(&backend, Uuid::new_v4());
        let waiter = lock_for(&backend, Uuid::new_v4());
        holder.acquire("docqueue.statistics").await.expect("holder");

        let release = {
            let holder = holder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                holder.release("docqueue.statistics").await
            })
        };
        waiter.acquire("docqueue.statistics").await.expect("waiter");
        assert!(release.await.expect("join").expect("release"));
        assert_eq!(backend.lock_holder("docqueue.statistics"), Some(waiter.owner()));
    }
}
