//! Per-worker queue session and the retry-with-escalation combinator.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::context::QueueContext;
use super::lock::AdvisoryLock;
use super::retry::LockScope;
use crate::backends::{LockMode, QueueBackend, QueueResult};
use crate::model::{WorkerLease, Workflow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Escalation {
    /// Run unlocked first; take the lock only after contention or a stale read.
    OnContention,
    /// Hold the lock for every attempt.
    Always,
}

pub(super) struct ActiveLease {
    pub(super) lease: WorkerLease,
    pub(super) cancel: CancellationToken,
    pub(super) heartbeat: JoinHandle<()>,
}

/// One worker's view of the queue.
///
/// The session id doubles as the advisory lock owner, so two sessions in the
/// same process contend for locks like two processes would. Dropping a
/// registered session stops its heartbeat; its lease is then reverted by the
/// next stale sweep unless `unregister_worker` ran first.
pub struct QueueSession {
    pub(super) ctx: Arc<QueueContext>,
    pub(super) session_id: Uuid,
    pub(super) user: String,
    pub(super) active_workflow: Option<Workflow>,
    pub(super) lease: Option<ActiveLease>,
}

impl QueueSession {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        let user = ctx.config().user_name.clone();
        Self {
            ctx,
            session_id: Uuid::new_v4(),
            user,
            active_workflow: None,
            lease: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn context(&self) -> &Arc<QueueContext> {
        &self.ctx
    }

    /// User recorded when this session skips files.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = user.into();
    }

    pub fn lease(&self) -> Option<&WorkerLease> {
        self.lease.as_ref().map(|active| &active.lease)
    }

    pub(super) fn backend(&self) -> &dyn QueueBackend {
        self.ctx.backend().as_ref()
    }

    pub(super) fn advisory_lock(&self) -> AdvisoryLock {
        AdvisoryLock::new(
            Arc::clone(self.ctx.backend()),
            self.session_id,
            self.ctx.config().lock.clone(),
        )
    }

    /// Triggers the throttled stale-lease revert; failures only get logged.
    pub(super) async fn revert_stale_if_due(&self) {
        match self.ctx.revert_stale_if_due().await {
            Ok(Some(report)) if report.leases_reverted > 0 => {
                debug!(
                    leases = report.leases_reverted,
                    records = report.records_reverted,
                    "lazy stale-lease revert"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "stale-lease revert check failed"),
        }
    }

    /// Runs `attempt` unlocked, re-runs it once under `scope`'s advisory lock
    /// on contention or an invariant violation, and retries transient failures
    /// within the configured budget.
    pub(super) async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        scope: LockScope,
        attempt: F,
    ) -> QueueResult<T>
    where
        F: FnMut(LockMode) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        self.run_with(op, scope, Escalation::OnContention, attempt)
            .await
    }

    /// Like `run`, but every attempt holds the lock.
    pub(super) async fn run_locked<T, F, Fut>(
        &self,
        op: &'static str,
        scope: LockScope,
        attempt: F,
    ) -> QueueResult<T>
    where
        F: FnMut(LockMode) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        self.run_with(op, scope, Escalation::Always, attempt).await
    }

    async fn run_with<T, F, Fut>(
        &self,
        op: &'static str,
        scope: LockScope,
        escalation: Escalation,
        mut attempt: F,
    ) -> QueueResult<T>
    where
        F: FnMut(LockMode) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let retry = self.ctx.config().retry;
        let started = Instant::now();
        let mut tries = 0;
        loop {
            tries += 1;
            let result = match escalation {
                Escalation::Always => self.locked_attempt(op, &scope, &mut attempt).await,
                Escalation::OnContention => match attempt(LockMode::Unlocked).await {
                    Err(err) if err.escalates() => {
                        debug!(op, lock = scope.name(), error = %err, "retrying under advisory lock");
                        self.locked_attempt(op, &scope, &mut attempt).await
                    }
                    other => other,
                },
            };
            match result {
                Err(err)
                    if err.is_transient()
                        && tries < retry.max_attempts
                        && started.elapsed() < retry.budget =>
                {
                    let delay = retry.backoff.jittered_delay(tries);
                    warn!(
                        op,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient queue failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn locked_attempt<T, F, Fut>(
        &self,
        op: &'static str,
        scope: &LockScope,
        attempt: &mut F,
    ) -> QueueResult<T>
    where
        F: FnMut(LockMode) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let lock = self.advisory_lock();
        lock.acquire(scope.name()).await?;
        let result = attempt(LockMode::Locked).await;
        if let Err(err) = lock.release(scope.name()).await {
            warn!(op, lock = scope.name(), error = %err, "failed to release advisory lock");
        }
        result
    }
}

impl Drop for QueueSession {
    fn drop(&mut self) {
        if let Some(active) = &self.lease {
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backends::{Fault, FaultInjectingBackend, MemoryBackend, QueueError};
    use crate::config::QueueConfig;
    use crate::model::{Outcome, QueueStatus, WorkflowType};
    use crate::queue::{DequeueRequest, EnqueueRequest};

    fn session() -> (MemoryBackend, QueueSession) {
        let backend = MemoryBackend::new();
        let ctx = QueueContext::new(
            Arc::new(backend.clone()),
            QueueConfig::test_config("memory://"),
        );
        (backend, ctx.session())
    }

    async fn faulty_session() -> (FaultInjectingBackend, QueueSession) {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        let ctx = QueueContext::new(
            Arc::new(backend.clone()),
            QueueConfig::test_config("memory://"),
        );
        let mut session = ctx.session();
        session
            .get_or_create_workflow("W1", WorkflowType::Extraction)
            .await
            .expect("workflow");
        session.set_active_workflow("W1").await.expect("pin");
        (backend, session)
    }

    #[tokio::test]
    async fn contention_escalates_once_under_lock() {
        let (backend, session) = session();
        let modes = Mutex::new(Vec::new());
        let observed = &modes;
        let backend_ref = &backend;
        let session_id = session.session_id();
        let result = session
            .run("sample_op", LockScope::Main, move |mode| async move {
                observed.lock().expect("modes poisoned").push(mode);
                match mode {
                    LockMode::Unlocked => Err(QueueError::Contention("duplicate".into())),
                    LockMode::Locked => {
                        assert_eq!(backend_ref.lock_holder("docqueue.main"), Some(session_id));
                        Ok(7)
                    }
                }
            })
            .await
            .expect("escalated run");
        assert_eq!(result, 7);
        assert_eq!(
            *modes.lock().expect("modes poisoned"),
            vec![LockMode::Unlocked, LockMode::Locked]
        );
        assert_eq!(backend.lock_holder("docqueue.main"), None);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_attempts_run_out() {
        let (_backend, session) = session();
        let calls = Mutex::new(0);
        let counter = &calls;
        let err = session
            .run("sample_op", LockScope::Main, move |_| async move {
                *counter.lock().expect("calls poisoned") += 1;
                Err::<(), _>(QueueError::Sqlx(sqlx::Error::PoolTimedOut))
            })
            .await
            .expect_err("always transient");
        assert!(err.is_transient());
        assert_eq!(*calls.lock().expect("calls poisoned"), 3);
    }

    #[tokio::test]
    async fn configuration_errors_surface_immediately() {
        let (backend, session) = session();
        let calls = Mutex::new(0);
        let counter = &calls;
        let err = session
            .run("sample_op", LockScope::Statistics, move |_| async move {
                *counter.lock().expect("calls poisoned") += 1;
                Err::<(), _>(QueueError::Configuration("no workflow".into()))
            })
            .await
            .expect_err("configuration");
        assert!(matches!(err, QueueError::Configuration(_)));
        assert_eq!(*calls.lock().expect("calls poisoned"), 1);
        assert_eq!(backend.lock_holder("docqueue.statistics"), None);
    }

    #[tokio::test]
    async fn locked_runs_hold_the_lock_from_the_first_attempt() {
        let (backend, session) = session();
        let backend_ref = &backend;
        let session_id = session.session_id();
        session
            .run_locked("sample_op", LockScope::Statistics, move |mode| async move {
                assert_eq!(mode, LockMode::Locked);
                assert_eq!(
                    backend_ref.lock_holder("docqueue.statistics"),
                    Some(session_id)
                );
                Ok(())
            })
            .await
            .expect("locked run");
    }

    #[tokio::test]
    async fn enqueue_contention_is_retried_under_the_advisory_lock() {
        let (backend, session) = faulty_session().await;
        backend.inject("enqueue_file", Fault::Contention, 1);
        let outcome = session
            .enqueue(&EnqueueRequest::new("/in/race.pdf", "Extract"))
            .await
            .expect("enqueue");
        assert_eq!(outcome.status, QueueStatus::Pending);
        assert_eq!(
            backend.calls("enqueue_file"),
            vec![LockMode::Unlocked, LockMode::Locked]
        );
        assert_eq!(backend.lock_acquisitions(), 1);
        assert_eq!(backend.inner().lock_holder("docqueue.main"), None);
    }

    #[tokio::test]
    async fn backend_transient_failures_are_retried_then_surface() {
        let (backend, mut session) = faulty_session().await;
        session
            .enqueue(&EnqueueRequest::new("/in/flaky.pdf", "Extract"))
            .await
            .expect("enqueue");
        session.register_worker().await.expect("register");

        backend.inject("dequeue", Fault::Transient, 2);
        let files = session
            .dequeue(&DequeueRequest::new("Extract", 1))
            .await
            .expect("dequeue");
        assert_eq!(files.len(), 1);
        assert_eq!(backend.calls("dequeue").len(), 3);

        backend.inject("transition", Fault::Transient, 3);
        let err = session
            .report_outcome(&files[0], &Outcome::Completed)
            .await
            .expect_err("retry budget exhausted");
        assert!(err.is_transient());

        backend.inject("transition", Fault::Fatal, 1);
        let before = backend.calls("transition").len();
        let err = session
            .report_outcome(&files[0], &Outcome::Completed)
            .await
            .expect_err("fatal");
        assert!(matches!(err, QueueError::Message(_)));
        assert_eq!(backend.calls("transition").len(), before + 1);
    }
}
