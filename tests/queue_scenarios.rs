//! End-to-end queue scenarios against the in-memory backend.
//!
//! Covers priority ordering, crash recovery through stale leases, racing
//! get-or-create, random ordering, statistics rebuilds and history tracking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeDelta, Utc};

use docqueue::{
    DequeueOrder, DequeueRequest, EnqueueRequest, MemoryBackend, Outcome, Priority, QueueConfig,
    QueueContext, QueueError, QueueMode, QueueSession, QueueStatus, WorkflowSelector,
    WorkflowType,
};

fn memory_context(config: QueueConfig) -> (MemoryBackend, Arc<QueueContext>) {
    let backend = MemoryBackend::new();
    let ctx = QueueContext::new(Arc::new(backend.clone()), config);
    (backend, ctx)
}

fn test_config() -> QueueConfig {
    QueueConfig::test_config("memory://")
}

/// Heartbeats slow enough that a backdated lease stays stale for the whole test.
fn quiet_heartbeat_config() -> QueueConfig {
    let mut config = test_config();
    config.lease.heartbeat_interval = Duration::from_secs(3600);
    config
}

async fn session_in(ctx: &Arc<QueueContext>, workflow: &str) -> Result<QueueSession> {
    let mut session = ctx.session();
    session
        .get_or_create_workflow(workflow, WorkflowType::Extraction)
        .await?;
    session.set_active_workflow(workflow).await?;
    Ok(session)
}

#[tokio::test]
async fn dequeue_returns_high_then_normal_and_leaves_low_pending() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let mut session = session_in(&ctx, "W1").await?;
    for (path, priority) in [
        ("/in/low.pdf", Priority::Low),
        ("/in/high.pdf", Priority::High),
        ("/in/normal.pdf", Priority::Normal),
    ] {
        session
            .enqueue(&EnqueueRequest::new(path, "Extract").with_priority(priority))
            .await?;
    }

    session.register_worker().await?;
    let files = session.dequeue(&DequeueRequest::new("Extract", 2)).await?;
    let priorities: Vec<Priority> = files.iter().map(|file| file.priority).collect();
    assert_eq!(priorities, vec![Priority::High, Priority::Normal]);

    let action = &session
        .resolve_actions("Extract", &WorkflowSelector::Active)
        .await?[0];
    assert_eq!(
        session.status_of("/in/low.pdf", action).await?,
        QueueStatus::Pending
    );
    assert_eq!(
        session.status_of("/in/high.pdf", action).await?,
        QueueStatus::Processing
    );
    session.unregister_worker().await?;
    Ok(())
}

#[tokio::test]
async fn crashed_worker_files_return_to_pending_on_next_stats_call() -> Result<()> {
    let (backend, ctx) = memory_context(test_config());
    let mut crashed = session_in(&ctx, "W1").await?;
    crashed
        .enqueue(&EnqueueRequest::new("/in/f.pdf", "Extract").with_size(4096, 3))
        .await?;
    let lease_id = crashed.register_worker().await?.id;
    let claimed = crashed.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    assert_eq!(claimed.len(), 1);

    // The worker dies without unregistering and its heartbeat stops.
    drop(crashed);
    assert!(backend.set_last_heartbeat(lease_id, Utc::now() - TimeDelta::minutes(10)));

    let observer = session_in(&ctx, "W1").await?;
    let stats = observer
        .get_aggregate_stats("Extract", &WorkflowSelector::Active)
        .await?;
    assert_eq!(stats.counters(QueueStatus::Pending).files, 1);
    assert_eq!(stats.counters(QueueStatus::Pending).bytes, 4096);
    assert_eq!(stats.counters(QueueStatus::Processing).files, 0);

    let record = &backend.records()[0];
    assert_eq!(record.status, QueueStatus::Pending);
    assert_eq!(record.lease_id, None);
    Ok(())
}

#[tokio::test]
async fn explicit_revert_sweep_reports_counts() -> Result<()> {
    let (backend, ctx) = memory_context(test_config());
    let mut worker = session_in(&ctx, "W1").await?;
    for index in 0..3 {
        worker
            .enqueue(&EnqueueRequest::new(format!("/sweep/{index}.pdf"), "Extract"))
            .await?;
    }
    let lease_id = worker.register_worker().await?.id;
    worker.dequeue(&DequeueRequest::new("Extract", 3)).await?;
    assert!(backend.set_last_heartbeat(lease_id, Utc::now() - TimeDelta::hours(1)));

    let report = ctx.revert_stale_leases().await?;
    assert_eq!(report.leases_reverted, 1);
    assert_eq!(report.records_reverted, 3);
    assert_eq!(report.failures, 0);

    // The lease is gone, so unregistering afterwards finds nothing to revert.
    assert_eq!(worker.unregister_worker().await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_or_create_action_yields_one_row() -> Result<()> {
    let (backend, ctx) = memory_context(test_config());
    ctx.session()
        .get_or_create_workflow("W1", WorkflowType::Classification)
        .await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            ctx.session()
                .get_or_create_action("Validate", &WorkflowSelector::named("W1"))
                .await
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await??.id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(
        backend
            .actions()
            .iter()
            .filter(|action| action.name == "Validate")
            .count(),
        1
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_claim_the_same_file() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let setup = session_in(&ctx, "W1").await?;
    for index in 0..30 {
        setup
            .enqueue(&EnqueueRequest::new(format!("/many/{index}.pdf"), "Extract"))
            .await?;
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            let mut session = ctx.session();
            session.register_worker().await?;
            let request =
                DequeueRequest::new("Extract", 4).in_workflow(WorkflowSelector::named("W1"));
            let mut mine = Vec::new();
            loop {
                let files = session.dequeue(&request).await?;
                if files.is_empty() {
                    break;
                }
                for file in files {
                    session.report_outcome(&file, &Outcome::Completed).await?;
                    mine.push(file.file_id);
                }
            }
            session.unregister_worker().await?;
            Ok::<_, QueueError>(mine)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for file_id in handle.await?? {
            assert!(seen.insert(file_id), "file {file_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 30);
    Ok(())
}

#[tokio::test]
async fn unregister_worker_twice_is_a_no_op() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let mut session = session_in(&ctx, "W1").await?;
    session
        .enqueue(&EnqueueRequest::new("/in/a.pdf", "Extract"))
        .await?;
    session.register_worker().await?;
    session.dequeue(&DequeueRequest::new("Extract", 1)).await?;

    let first = session.unregister_worker().await?;
    assert_eq!(first.map(|summary| summary.records_reverted), Some(1));
    assert_eq!(session.unregister_worker().await?, None);

    let err = session
        .dequeue(&DequeueRequest::new("Extract", 1))
        .await
        .expect_err("dequeue after unregister");
    assert!(matches!(err, QueueError::Configuration(_)));
    Ok(())
}

#[tokio::test]
async fn reports_from_a_reverted_lease_are_rejected() -> Result<()> {
    let (backend, ctx) = memory_context(test_config());
    let mut slow = session_in(&ctx, "W1").await?;
    slow.enqueue(&EnqueueRequest::new("/in/slow.pdf", "Extract"))
        .await?;
    let slow_lease = slow.register_worker().await?.id;
    let stale_claim = slow.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    assert!(backend.set_last_heartbeat(slow_lease, Utc::now() - TimeDelta::hours(1)));

    let mut fast = session_in(&ctx, "W1").await?;
    fast.register_worker().await?;
    let fresh_claim = fast.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    assert_eq!(fresh_claim.len(), 1);

    let err = slow
        .report_outcome(&stale_claim[0], &Outcome::Completed)
        .await
        .expect_err("lease was reverted");
    assert!(matches!(err, QueueError::LeaseMismatch { .. }));
    fast.report_outcome(&fresh_claim[0], &Outcome::Completed)
        .await?;
    Ok(())
}

#[tokio::test]
async fn skipped_files_are_claimed_per_user() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let mut alice = session_in(&ctx, "W1").await?;
    alice.set_user("alice");
    alice
        .enqueue(&EnqueueRequest::new("/in/hard.pdf", "Extract"))
        .await?;
    alice.register_worker().await?;
    let claimed = alice.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    alice.report_outcome(&claimed[0], &Outcome::Skipped).await?;

    let bob_mode = QueueMode::SkippedForUser("bob".into());
    let none = alice
        .dequeue(&DequeueRequest::new("Extract", 1).with_mode(bob_mode))
        .await?;
    assert!(none.is_empty());

    let alice_mode = QueueMode::SkippedForUser("alice".into());
    let again = alice
        .dequeue(&DequeueRequest::new("Extract", 1).with_mode(alice_mode))
        .await?;
    assert_eq!(again.len(), 1);
    alice.unregister_worker().await?;
    Ok(())
}

#[tokio::test]
async fn recalculated_counters_match_incremental_ones() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let mut session = session_in(&ctx, "W1").await?;
    for index in 0..6 {
        session
            .enqueue(
                &EnqueueRequest::new(format!("/stats/{index}.pdf"), "Extract")
                    .with_size(1000 + index, 2),
            )
            .await?;
    }
    session.register_worker().await?;
    let files = session.dequeue(&DequeueRequest::new("Extract", 4)).await?;
    session
        .report_outcome(&files[0], &Outcome::Completed)
        .await?;
    session
        .report_outcome(
            &files[1],
            &Outcome::Failed {
                comment: Some("corrupt".into()),
            },
        )
        .await?;
    session.report_outcome(&files[2], &Outcome::Skipped).await?;
    session.purge_file(&files[3].path).await?;

    let incremental = session
        .get_aggregate_stats("Extract", &WorkflowSelector::Active)
        .await?;
    session
        .recalc_statistics(Some("Extract"), &WorkflowSelector::Active)
        .await?;
    let rebuilt = session
        .get_aggregate_stats("Extract", &WorkflowSelector::Active)
        .await?;
    assert_eq!(incremental, rebuilt);
    assert_eq!(rebuilt.total().files, 5);
    assert_eq!(rebuilt.counters(QueueStatus::Pending).files, 2);
    session.unregister_worker().await?;
    Ok(())
}

#[tokio::test]
async fn history_is_recorded_for_tracked_workflows() -> Result<()> {
    let mut config = test_config();
    config.track_history = true;
    let (_backend, ctx) = memory_context(config);
    let mut session = session_in(&ctx, "Audited").await?;
    let enqueued = session
        .enqueue(&EnqueueRequest::new("/in/audit.pdf", "Extract"))
        .await?;
    session.register_worker().await?;
    let files = session.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    session
        .report_outcome(&files[0], &Outcome::Completed)
        .await?;

    let history = session
        .status_history(enqueued.file_id, files[0].action_id)
        .await?;
    let steps: Vec<(QueueStatus, QueueStatus)> =
        history.iter().map(|change| (change.from, change.to)).collect();
    assert_eq!(
        steps,
        vec![
            (QueueStatus::Unattempted, QueueStatus::Pending),
            (QueueStatus::Pending, QueueStatus::Processing),
            (QueueStatus::Processing, QueueStatus::Completed),
        ]
    );
    session.unregister_worker().await?;
    Ok(())
}

#[tokio::test]
async fn reenqueue_with_new_size_keeps_counters_consistent() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let mut session = session_in(&ctx, "W1").await?;
    session
        .enqueue(&EnqueueRequest::new("/resize/a.pdf", "Extract"))
        .await?;
    session
        .enqueue(&EnqueueRequest::new("/resize/a.pdf", "OCR"))
        .await?;
    session.register_worker().await?;
    let ocr = session.dequeue(&DequeueRequest::new("OCR", 1)).await?;
    session.report_outcome(&ocr[0], &Outcome::Completed).await?;

    // The size arrives later, while one action is Pending and the other Completed.
    session
        .enqueue(&EnqueueRequest::new("/resize/a.pdf", "Extract").with_size(5000, 7))
        .await?;
    let ocr_stats = session
        .get_aggregate_stats("OCR", &WorkflowSelector::Active)
        .await?;
    assert_eq!(ocr_stats.counters(QueueStatus::Completed).bytes, 5000);
    assert_eq!(ocr_stats.counters(QueueStatus::Completed).pages, 7);

    let files = session.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    assert_eq!(files[0].size_bytes, 5000);
    session
        .report_outcome(&files[0], &Outcome::Completed)
        .await?;

    for action in ["Extract", "OCR"] {
        let incremental = session
            .get_aggregate_stats(action, &WorkflowSelector::Active)
            .await?;
        assert_eq!(incremental.counters(QueueStatus::Pending).bytes, 0);
        assert_eq!(incremental.counters(QueueStatus::Pending).pages, 0);
        assert_eq!(incremental.counters(QueueStatus::Completed).bytes, 5000);
        session
            .recalc_statistics(Some(action), &WorkflowSelector::Active)
            .await?;
        let rebuilt = session
            .get_aggregate_stats(action, &WorkflowSelector::Active)
            .await?;
        assert_eq!(incremental, rebuilt, "counters drifted for {action}");
    }
    session.unregister_worker().await?;
    Ok(())
}

#[tokio::test]
async fn dequeue_after_stale_sweep_requires_registering_again() -> Result<()> {
    let (backend, ctx) = memory_context(quiet_heartbeat_config());
    let mut worker = session_in(&ctx, "W1").await?;
    for index in 0..2 {
        worker
            .enqueue(&EnqueueRequest::new(format!("/swept/{index}.pdf"), "Extract"))
            .await?;
    }
    let first_lease = worker.register_worker().await?.id;
    let held = worker.dequeue(&DequeueRequest::new("Extract", 1)).await?;
    assert_eq!(held.len(), 1);
    assert!(backend.set_last_heartbeat(first_lease, Utc::now() - TimeDelta::hours(1)));
    assert_eq!(ctx.revert_stale_leases().await?.leases_reverted, 1);

    let err = worker
        .dequeue(&DequeueRequest::new("Extract", 2))
        .await
        .expect_err("lease was swept");
    assert!(matches!(err, QueueError::LeaseLost(id) if id == first_lease));
    assert!(worker.lease().is_none());
    assert!(
        backend
            .records()
            .iter()
            .all(|record| record.status == QueueStatus::Pending && record.lease_id.is_none())
    );

    let second_lease = worker.register_worker().await?.id;
    assert_ne!(second_lease, first_lease);
    let files = worker.dequeue(&DequeueRequest::new("Extract", 2)).await?;
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].file_id, held[0].file_id);

    // Nothing is stranded under a lease that no longer exists.
    assert_eq!(ctx.revert_stale_leases().await?.leases_reverted, 0);
    assert!(
        backend
            .records()
            .iter()
            .all(|record| record.lease_id == Some(second_lease))
    );
    assert_eq!(
        worker.unregister_worker().await?.map(|summary| summary.records_reverted),
        Some(2)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_order_respects_priority_and_never_double_claims() -> Result<()> {
    let (_backend, ctx) = memory_context(test_config());
    let setup = session_in(&ctx, "W1").await?;
    for index in 0..24 {
        let priority = match index % 3 {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        setup
            .enqueue(
                &EnqueueRequest::new(format!("/random/{index}.pdf"), "Extract")
                    .with_priority(priority),
            )
            .await?;
    }

    let mut first = session_in(&ctx, "W1").await?;
    first.register_worker().await?;
    let request = DequeueRequest::new("Extract", 10)
        .in_workflow(WorkflowSelector::named("W1"))
        .with_order(DequeueOrder::Random);
    let batch = first.dequeue(&request).await?;
    let priorities: Vec<Priority> = batch.iter().map(|file| file.priority).collect();
    assert_eq!(&priorities[..8], &[Priority::High; 8]);
    assert_eq!(&priorities[8..], &[Priority::Normal; 2]);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let ctx = Arc::clone(&ctx);
        let request = DequeueRequest::new("Extract", 3)
            .in_workflow(WorkflowSelector::named("W1"))
            .with_order(DequeueOrder::Random);
        handles.push(tokio::spawn(async move {
            let mut session = ctx.session();
            session.register_worker().await?;
            let mut mine = Vec::new();
            loop {
                let files = session.dequeue(&request).await?;
                if files.is_empty() {
                    break;
                }
                assert!(
                    files
                        .windows(2)
                        .all(|pair| pair[0].priority >= pair[1].priority)
                );
                for file in files {
                    session.report_outcome(&file, &Outcome::Completed).await?;
                    mine.push(file.file_id);
                }
            }
            session.unregister_worker().await?;
            Ok::<_, QueueError>(mine)
        }));
    }

    let mut seen: HashSet<_> = batch.iter().map(|file| file.file_id).collect();
    for handle in handles {
        for file_id in handle.await?? {
            assert!(seen.insert(file_id), "file {file_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 24);
    first.unregister_worker().await?;
    Ok(())
}
