use std::{sync::Arc, time::Duration};

use crate::{AtomicScript, ManualClock, MemoryStore, QuotaGuardError, StoreClient};

use super::support::START_MS;

fn store() -> (Arc<ManualClock>, MemoryStore) {
    let clock = Arc::new(ManualClock::new(START_MS));
    (clock.clone(), MemoryStore::with_clock(clock))
}

#[tokio::test]
async fn increment_creates_and_counts() {
    let (_, store) = store();

    assert_eq!(store.increment("c").await.unwrap(), 1);
    assert_eq!(store.increment("c").await.unwrap(), 2);
    assert_eq!(store.get("c").await.unwrap().as_deref(), Some("2"));
    assert_eq!(store.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn expire_applies_ttl_and_key_disappears() {
    let (clock, store) = store();

    assert!(!store.expire("c", 5).await.unwrap());

    store.increment("c").await.unwrap();
    assert!(store.expire("c", 5).await.unwrap());
    assert_eq!(store.ttl_ms("c"), Some(5000));

    clock.advance(Duration::from_millis(4999));
    assert_eq!(store.ttl_ms("c"), Some(1));
    assert_eq!(store.len(), 1);

    clock.advance(Duration::from_millis(1));
    assert_eq!(store.get("c").await.unwrap(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn delete_reports_whether_key_existed() {
    let (_, store) = store();

    store.increment("c").await.unwrap();
    assert!(store.delete("c").await.unwrap());
    assert!(!store.delete("c").await.unwrap());
}

#[tokio::test]
async fn commands_on_wrong_type_fail() {
    let (_, store) = store();

    store.increment("c").await.unwrap();

    let err = store.zcard("c").await.unwrap_err();
    assert!(matches!(err, QuotaGuardError::WrongType(ref k) if k == "c"));
    assert!(err.is_store_error());

    let script = AtomicScript::SlidingWindow {
        key: Arc::from("c"),
        now_ms: START_MS,
        window_ms: 1000,
        limit: 1,
        ttl_seconds: 1,
        member: "m".to_string(),
    };
    assert!(matches!(
        store.atomic_script(&script).await.unwrap_err(),
        QuotaGuardError::WrongType(_)
    ));
}

#[tokio::test]
async fn sliding_window_script_evicts_counts_and_records() {
    let (_, store) = store();

    let script = |now_ms: u64, member: &str| AtomicScript::SlidingWindow {
        key: Arc::from("s"),
        now_ms,
        window_ms: 1000,
        limit: 2,
        ttl_seconds: 1,
        member: member.to_string(),
    };

    assert_eq!(store.atomic_script(&script(START_MS, "a")).await.unwrap(), 1);
    assert_eq!(store.atomic_script(&script(START_MS, "b")).await.unwrap(), 1);
    assert_eq!(store.atomic_script(&script(START_MS, "c")).await.unwrap(), 0);
    assert_eq!(store.zcard("s").await.unwrap(), 2);

    // events at START_MS are on the boundary and leave the window
    assert_eq!(
        store
            .atomic_script(&script(START_MS + 1000, "d"))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.zcard("s").await.unwrap(), 1);
}

#[tokio::test]
async fn token_bucket_script_stores_hash_fields() {
    let (_, store) = store();

    let script = AtomicScript::TokenBucket {
        key: Arc::from("t"),
        now_ms: START_MS,
        capacity: 2,
        rate_per_second: 1.0,
        ttl_seconds: 60,
    };

    assert_eq!(store.atomic_script(&script).await.unwrap(), 1);
    assert_eq!(
        store.hash_get("t", "tokens").await.unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(
        store
            .hash_get("t", "last_refill_ms")
            .await
            .unwrap()
            .and_then(|v| v.parse::<f64>().ok()),
        Some(START_MS as f64)
    );
    assert_eq!(store.hash_get("t", "missing").await.unwrap(), None);
    assert_eq!(store.ttl_ms("t"), Some(60_000));
}

#[tokio::test]
async fn fixed_window_script_arms_ttl_once() {
    let (clock, store) = store();

    let script = AtomicScript::FixedWindow {
        key: Arc::from("f"),
        now_ms: START_MS,
        ttl_seconds: 10,
    };

    assert_eq!(store.atomic_script(&script).await.unwrap(), 1);
    clock.advance(Duration::from_secs(4));
    assert_eq!(store.atomic_script(&script).await.unwrap(), 2);
    assert_eq!(store.ttl_ms("f"), Some(6000));
}

#[tokio::test]
async fn fixed_window_script_arms_ttl_at_the_evaluation_instant() {
    let (_, store) = store();

    // the caller's clock runs 5s ahead of the store's
    let script = AtomicScript::FixedWindow {
        key: Arc::from("f"),
        now_ms: START_MS + 5000,
        ttl_seconds: 10,
    };

    assert_eq!(store.atomic_script(&script).await.unwrap(), 1);
    assert_eq!(store.ttl_ms("f"), Some(15_000));
}

#[tokio::test]
async fn clones_share_state() {
    let (_, store) = store();
    let other = store.clone();

    store.increment("shared").await.unwrap();
    assert_eq!(other.increment("shared").await.unwrap(), 2);
}
