use fieldsync_types::{DiscardReason, NewQueueItem, QueueItem};
use serde_json::json;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn item(timestamp: i64, retry_count: u32) -> QueueItem {
    QueueItem {
        id: 1,
        action: "record_visit".into(),
        payload: json!({}),
        timestamp,
        retry_count,
        last_error: None,
    }
}

#[test]
fn fresh_item_is_kept() {
    let now = 10 * 3_600_000;
    assert_eq!(item(now - 1_000, 0).discard_reason(now, HOUR, 5), None);
}

#[test]
fn old_item_is_stale_regardless_of_retries() {
    let now = 10 * 3_600_000;
    let old = item(now - 3_600_001, 0);
    assert_eq!(old.discard_reason(now, HOUR, 5), Some(DiscardReason::Stale));
}

#[test]
fn exhausted_item_is_discarded() {
    let now = 10 * 3_600_000;
    let spent = item(now, 5);
    assert_eq!(
        spent.discard_reason(now, HOUR, 5),
        Some(DiscardReason::RetriesExhausted)
    );
}

#[test]
fn record_failure_increments_and_keeps_error() {
    let mut it = item(0, 0);
    it.record_failure("transient: 503");
    it.record_failure("transient: 502");
    assert_eq!(it.retry_count, 2);
    assert_eq!(it.last_error.as_deref(), Some("transient: 502"));
}

#[test]
fn age_never_negative() {
    let it = item(5_000, 0);
    assert_eq!(it.age(1_000), Duration::ZERO);
}

#[test]
fn new_queue_item_timestamp_override() {
    let it = NewQueueItem::new("create_order", json!({"a": 1})).at(42);
    assert_eq!(it.timestamp, 42);
    assert_eq!(it.action, "create_order");
}

#[test]
fn discard_reason_display() {
    assert_eq!(DiscardReason::Stale.to_string(), "stale");
    assert_eq!(DiscardReason::RetriesExhausted.to_string(), "retries_exhausted");
}
