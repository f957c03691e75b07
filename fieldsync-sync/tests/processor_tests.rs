mod common;

use common::{CountingAggregate, FailingHandler, build, build_with_store, harness, remote, visit_payload};
use fieldsync_storage::LocalStore;
use fieldsync_sync::handlers::{DELETE_RECORD, RECORD_VISIT};
use fieldsync_sync::reconcile::{Reconciler, VisitOutcomeReconciler};
use fieldsync_sync::{
    DrainOutcome, DrainReport, DrainTrigger, ProcessorState, RemoteError, SyncConfig, SyncEvent,
};
use fieldsync_types::time::now_millis;
use fieldsync_types::{DiscardReason, NewQueueItem, Record, RecordId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        other => panic!("expected a completed drain, got {other:?}"),
    }
}

// ── Idempotent replay ───────────────────────────────────────────

#[tokio::test]
async fn same_idempotency_key_twice_yields_one_remote_record() {
    let h = harness();
    let mut payload = visit_payload("c1", "u1", "2026-10-16");
    payload["idempotency_key"] = json!("visit-key-1");

    h.processor.enqueue(RECORD_VISIT, payload.clone()).await.unwrap();
    h.processor.enqueue(RECORD_VISIT, payload.clone()).await.unwrap();
    let first = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(first.succeeded, 2);

    h.processor.enqueue(RECORD_VISIT, payload).await.unwrap();
    let second = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(second.succeeded, 1);

    assert_eq!(h.remote.rows("visits").len(), 1);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
}

// ── Retry bound ─────────────────────────────────────────────────

#[tokio::test]
async fn always_failing_item_is_dropped_after_fifth_failed_drain() {
    let failing = FailingHandler::new("flaky", RemoteError::Transient("503".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(failing.clone()));
    h.processor.enqueue("flaky", json!({})).await.unwrap();

    for k in 1..5u32 {
        let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
        assert_eq!(r.failed, 1);
        let items = h.store.queue_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, k);
        assert!(items[0].last_error.as_deref().unwrap().starts_with("transient"));
    }

    let fifth = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(fifth.discarded_exhausted, 1);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
    assert_eq!(failing.calls(), 5);

    let dead = h.store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DiscardReason::RetriesExhausted);
    assert_eq!(dead[0].item.retry_count, 5);
}

#[tokio::test]
async fn validation_errors_follow_the_same_bound() {
    let failing = FailingHandler::new("rejected", RemoteError::Validation("bad column".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(failing.clone()));
    h.processor.enqueue("rejected", json!({})).await.unwrap();

    for _ in 0..5 {
        h.processor.drain(DrainTrigger::Manual).await.unwrap();
    }

    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
    let dead = h.store.dead_letters().await.unwrap();
    assert!(dead[0].item.last_error.as_deref().unwrap().starts_with("validation"));
}

#[tokio::test]
async fn exhausted_item_is_discarded_without_replay() {
    let failing = FailingHandler::new("flaky", RemoteError::Transient("503".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(failing.clone()));
    let mut item = h.processor.enqueue("flaky", json!({})).await.unwrap();
    item.retry_count = 5;
    h.store.update_queue_item(&item).await.unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.discarded_exhausted, 1);
    assert_eq!(failing.calls(), 0);
}

#[tokio::test]
async fn failing_local_visit_is_not_requeued_after_exhaustion() {
    let h = harness();
    h.remote.fail_collection("visits", RemoteError::Validation("bad outcome".into()));
    h.store
        .save("visits", &Record::new_local(visit_payload("c1", "u1", "2026-10-16")))
        .await
        .unwrap();

    let first = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(first.reconciled, 1);
    for _ in 1..16 {
        h.processor.drain(DrainTrigger::Manual).await.unwrap();
    }

    assert_eq!(h.remote.call_count(), 5);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
    let dead = h.store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DiscardReason::RetriesExhausted);
}

// ── Staleness ───────────────────────────────────────────────────

#[tokio::test]
async fn stale_item_is_removed_without_replay() {
    let h = harness();
    let two_hours_ago = now_millis() - 2 * 60 * 60 * 1000;
    h.store
        .enqueue(NewQueueItem::new(RECORD_VISIT, visit_payload("c1", "u1", "2026-10-16")).at(two_hours_ago))
        .await
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.discarded_stale, 1);
    assert_eq!(r.succeeded, 0);
    assert_eq!(h.remote.call_count(), 0);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
    assert_eq!(h.store.dead_letters().await.unwrap()[0].reason, DiscardReason::Stale);
}

#[tokio::test]
async fn stale_visit_with_pending_local_record_is_not_replayed() {
    let h = harness();
    let local = Record::new_local(visit_payload("c1", "u1", "2026-10-16"));
    h.store.save("visits", &local).await.unwrap();
    let mut payload = visit_payload("c1", "u1", "2026-10-16");
    payload["local_id"] = json!(local.id.to_string());
    let two_hours_ago = now_millis() - 2 * 60 * 60 * 1000;
    h.store
        .enqueue(NewQueueItem::new(RECORD_VISIT, payload).at(two_hours_ago))
        .await
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(r.discarded_stale, 1);
    assert_eq!(r.reconciled, 0);
    assert_eq!(r.succeeded, 0);

    // Nor on a later drain.
    let again = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(again, DrainReport::default());
    assert_eq!(h.remote.call_count(), 0);
    assert!(h.store.get_by_id::<serde_json::Value>("visits", &local.id).await.unwrap().is_some());
}

// ── Failure isolation ───────────────────────────────────────────

#[tokio::test]
async fn one_failure_does_not_block_later_items() {
    let failing = FailingHandler::new("flaky", RemoteError::Transient("timeout".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(failing.clone()));
    h.processor.enqueue("flaky", json!({})).await.unwrap();
    h.processor
        .enqueue(RECORD_VISIT, visit_payload("c1", "u1", "2026-10-16"))
        .await
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.succeeded, 1);
    assert_eq!(r.failed, 1);
    assert_eq!(h.remote.rows("visits").len(), 1);
}

#[tokio::test]
async fn conflict_counts_as_success() {
    let conflicting = FailingHandler::new("dup", RemoteError::Conflict("23505".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(conflicting));
    h.processor.enqueue("dup", json!({})).await.unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.succeeded, 1);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_action_is_a_failure() {
    let h = harness();
    h.processor.enqueue("mystery", json!({})).await.unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.failed, 1);
    let items = h.store.queue_items().await.unwrap();
    assert!(items[0].last_error.as_deref().unwrap().starts_with("unknown_action"));
}

// ── Reconciliation ──────────────────────────────────────────────

#[tokio::test]
async fn reconciliation_twice_over_same_state_adds_nothing_new() {
    let h = harness();
    h.store
        .save("visits", &Record::new_local(visit_payload("c1", "u1", "2026-10-16")))
        .await
        .unwrap();
    // Same natural key, recorded twice locally.
    h.store
        .save("visits", &Record::new_local(visit_payload("c1", "u1", "2026-10-16")))
        .await
        .unwrap();
    h.store
        .save("visits", &Record::new_local(visit_payload("c2", "u1", "2026-10-16")))
        .await
        .unwrap();

    let reconciler = VisitOutcomeReconciler;
    let queue = h.store.queue_items().await.unwrap();
    let first = reconciler.missing_items(&h.store, &queue).await.unwrap();
    assert_eq!(first.len(), 2);
    for item in first {
        h.store.enqueue(item).await.unwrap();
    }

    let queue = h.store.queue_items().await.unwrap();
    let second = reconciler.missing_items(&h.store, &queue).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(h.processor.queue_len().await.unwrap(), 2);
}

#[tokio::test]
async fn reconciliation_skips_synced_and_outcome_less_records() {
    let h = harness();
    let mut synced = visit_payload("c1", "u1", "2026-10-16");
    synced["synced"] = json!(true);
    h.store.save("visits", &Record::new_local(synced)).await.unwrap();
    h.store
        .save("visits", &Record::new_local(json!({"customer_id": "c2", "user_id": "u1", "visit_date": "2026-10-16"})))
        .await
        .unwrap();

    let missing = VisitOutcomeReconciler.missing_items(&h.store, &[]).await.unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn drain_replays_reconciled_items() {
    let h = harness();
    let local = Record::new_local(visit_payload("c1", "u1", "2026-10-16"));
    h.store.save("visits", &local).await.unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.reconciled, 1);
    assert_eq!(r.succeeded, 1);
    assert_eq!(h.remote.rows("visits").len(), 1);

    let again = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());
    assert_eq!(again.reconciled, 0);
    assert_eq!(h.remote.rows("visits").len(), 1);
}

#[tokio::test]
async fn reconciliation_enqueue_failure_does_not_abort_drain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.db");
    let store = LocalStore::open(&path).unwrap();
    let h = build_with_store(store, remote(), SyncConfig::default(), |p| p);
    h.store
        .save("visits", &Record::new_local(visit_payload("c1", "u1", "2026-10-16")))
        .await
        .unwrap();
    h.processor
        .enqueue(DELETE_RECORD, json!({"collection": "visits", "id": RecordId::mint().to_string()}))
        .await
        .unwrap();
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_visits BEFORE INSERT ON sync_queue
             WHEN NEW.action = 'record_visit'
             BEGIN SELECT RAISE(ABORT, 'queue rejected'); END;",
        )
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.reconciled, 0);
    assert_eq!(r.succeeded, 1);
    assert_eq!(h.processor.queue_len().await.unwrap(), 0);
}

// ── Dependencies ────────────────────────────────────────────────

#[tokio::test]
async fn delete_waits_while_create_of_its_target_is_queued() {
    let failing = FailingHandler::new("create_thing", RemoteError::Transient("503".into()));
    let h = build(remote(), SyncConfig::default(), |p| p.with_handler(failing.clone()));
    let target = RecordId::mint();
    h.processor
        .enqueue("create_thing", json!({"local_id": target.to_string()}))
        .await
        .unwrap();
    h.processor
        .enqueue(DELETE_RECORD, json!({"collection": "things", "id": target.to_string()}))
        .await
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.succeeded, 0);
    assert_eq!(r.failed, 2);
    let items = h.store.queue_items().await.unwrap();
    let actions: Vec<&str> = items.iter().map(|i| i.action.as_str()).collect();
    assert_eq!(actions, vec!["create_thing", DELETE_RECORD]);
    assert!(items[1].last_error.as_deref().unwrap().starts_with("dependency_pending"));
}

// ── Guard & connectivity ────────────────────────────────────────

#[tokio::test]
async fn simultaneous_triggers_run_one_drain() {
    let slow = remote().with_latency(Duration::from_millis(20));
    let h = build(slow, SyncConfig::default(), |p| p.without_reconcilers());
    for customer in ["c1", "c2", "c3"] {
        h.processor
            .enqueue(RECORD_VISIT, visit_payload(customer, "u1", "2026-10-16"))
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        h.processor.drain(DrainTrigger::ConnectivityRestored),
        h.processor.drain(DrainTrigger::VisibilityChanged),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes.iter().filter(|o| matches!(o, DrainOutcome::Completed(_))).count();
    let skipped = outcomes.iter().filter(|o| **o == DrainOutcome::AlreadyRunning).count();
    assert_eq!(completed, 1);
    assert_eq!(skipped, 1);
    assert_eq!(h.remote.insert_count(), 3);
    assert_eq!(h.processor.state(), ProcessorState::Idle);
}

#[tokio::test]
async fn drain_while_offline_does_nothing() {
    let h = harness();
    h.set_online(false);
    h.processor
        .enqueue(RECORD_VISIT, visit_payload("c1", "u1", "2026-10-16"))
        .await
        .unwrap();

    let outcome = h.processor.drain(DrainTrigger::Manual).await.unwrap();

    assert_eq!(outcome, DrainOutcome::Offline);
    assert_eq!(h.remote.call_count(), 0);
    assert_eq!(h.processor.queue_len().await.unwrap(), 1);
}

#[tokio::test]
async fn connectivity_restored_kicks_a_drain() {
    let h = harness();
    h.set_online(false);
    h.processor
        .enqueue(RECORD_VISIT, visit_payload("c1", "u1", "2026-10-16"))
        .await
        .unwrap();
    let mut events = h.events.subscribe();
    let triggers = h.processor.spawn_triggers();

    h.set_online(true);
    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::SyncCompleted(report)) = events.recv().await {
                return report;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completed.succeeded, 1);
    triggers.abort();
}

// ── Events & aggregates ─────────────────────────────────────────

#[tokio::test]
async fn successful_drain_emits_completed_then_follow_up() {
    let config = SyncConfig {
        follow_up_delay_ms: 10,
        ..SyncConfig::default()
    };
    let h = build(remote(), config, |p| p);
    let mut events = h.events.subscribe();
    h.processor
        .enqueue(RECORD_VISIT, visit_payload("c1", "u1", "2026-10-16"))
        .await
        .unwrap();

    h.processor.drain(DrainTrigger::Manual).await.unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::SyncCompleted(r) => seen.push(format!("completed:{}", r.succeeded)),
                SyncEvent::SyncCompletedFollowUp => {
                    seen.push("follow_up".to_string());
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec!["completed:1".to_string(), "follow_up".to_string()]);
}

#[tokio::test]
async fn drain_without_success_emits_nothing() {
    let h = harness();
    let mut events = h.events.subscribe();

    h.processor.drain(DrainTrigger::Manual).await.unwrap();

    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn aggregate_recomputed_once_per_drain() {
    let aggregate = Arc::new(CountingAggregate::default());
    let h = build(remote(), SyncConfig::default(), |p| p.with_aggregate(aggregate.clone()));
    for customer in ["c1", "c2", "c3"] {
        h.processor
            .enqueue(RECORD_VISIT, visit_payload(customer, "u1", "2026-10-16"))
            .await
            .unwrap();
    }

    h.processor.drain(DrainTrigger::Manual).await.unwrap();
    assert_eq!(aggregate.runs(), 1);

    h.processor.drain(DrainTrigger::Manual).await.unwrap();
    assert_eq!(aggregate.runs(), 1);
}

#[tokio::test]
async fn non_transactional_success_skips_aggregates() {
    let aggregate = Arc::new(CountingAggregate::default());
    let h = build(remote(), SyncConfig::default(), |p| p.with_aggregate(aggregate.clone()));
    h.processor
        .enqueue(
            "delete_record",
            json!({"collection": "visits", "id": "local:0192b3a4-5c6d-7e8f-9a0b-1c2d3e4f5a6b"}),
        )
        .await
        .unwrap();

    let r = report(h.processor.drain(DrainTrigger::Manual).await.unwrap());

    assert_eq!(r.succeeded, 1);
    assert_eq!(aggregate.runs(), 0);
}
