//! Both stores must honour the same contract:
//! - `create` is a check-and-set on the fingerprint
//! - `amend` never downgrades a unit value
//! - `release` only removes provisional records

use cardrelay_core::{
    CardEvent, Completeness, Confidence, Fingerprint, ForwardStore, ForwardedRecord, ProviderTag,
    StoreError, UnitValue,
};
use cardrelay_store::{MemoryStore, SqlStore};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0)
        .single()
        .unwrap_or_default()
}

fn event(card: &str, unit: Option<UnitValue>) -> CardEvent {
    let provider = ProviderTag::new("vodafone");
    let first_seen = at();
    CardEvent {
        fingerprint: Fingerprint::for_card(&provider, card),
        card_number: Some(card.to_string()),
        completeness: Completeness::classify(true, true, unit.is_some()),
        provider,
        unit,
        card_date: first_seen.date_naive(),
        source_channel: -1001,
        message_ids: vec![10],
        first_seen,
    }
}

#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn sql_store() -> SqlStore {
    SqlStore::connect("sqlite::memory:")
        .await
        .expect("in-memory database should open")
}

#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn create_then_conflict(store: &dyn ForwardStore) {
    let record = ForwardedRecord::provisional(&event("4102550427511", None), at());
    store.create(&record).await.expect("first create succeeds");

    let again = store.create(&record).await;
    assert!(matches!(again, Err(StoreError::Conflict(fp)) if fp == record.fingerprint));

    let stored = store
        .lookup(&record.fingerprint)
        .await
        .expect("lookup succeeds")
        .expect("record exists");
    assert_eq!(stored, record);
}

#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn amend_is_monotonic(store: &dyn ForwardStore) {
    let record = ForwardedRecord::provisional(&event("4102550427512", None), at());
    store.create(&record).await.expect("create succeeds");

    let low = store
        .amend(&record.fingerprint, UnitValue::low(100), Completeness::Complete, at())
        .await
        .expect("amend succeeds");
    assert!(low.is_applied());
    assert_eq!(low.record().completeness, Completeness::Complete);

    let high = store
        .amend(&record.fingerprint, UnitValue::high(50), Completeness::Complete, at())
        .await
        .expect("amend succeeds");
    assert!(high.is_applied());
    assert_eq!(high.record().unit, Some(UnitValue::high(50)));

    let stale = store
        .amend(&record.fingerprint, UnitValue::low(300), Completeness::Partial, at())
        .await
        .expect("amend succeeds");
    assert!(!stale.is_applied());
    assert_eq!(stale.record().unit, Some(UnitValue::high(50)));
    assert_eq!(stale.record().completeness, Completeness::Complete);

    let equal = store
        .amend(&record.fingerprint, UnitValue::high(70), Completeness::Complete, at())
        .await
        .expect("amend succeeds");
    assert!(!equal.is_applied());
    assert_eq!(equal.record().unit.map(|u| u.confidence), Some(Confidence::High));
}

async fn amend_missing_is_not_found(store: &dyn ForwardStore) {
    let missing = Fingerprint::for_card(&ProviderTag::new("we"), "123456789012345");
    let result = store
        .amend(&missing, UnitValue::high(20), Completeness::Complete, at())
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
    assert!(matches!(store.confirm(&missing, 5).await, Err(StoreError::NotFound(_))));
}

#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn release_only_drops_provisional(store: &dyn ForwardStore) {
    let pending = ForwardedRecord::provisional(&event("1111111111111", None), at());
    let confirmed = ForwardedRecord::provisional(&event("2222222222222", Some(UnitValue::high(50))), at());
    store.create(&pending).await.expect("create succeeds");
    store.create(&confirmed).await.expect("create succeeds");
    store.confirm(&confirmed.fingerprint, 900).await.expect("confirm succeeds");

    store.release(&pending.fingerprint).await.expect("release succeeds");
    store.release(&confirmed.fingerprint).await.expect("release succeeds");

    assert!(store.lookup(&pending.fingerprint).await.expect("lookup succeeds").is_none());
    let kept = store
        .lookup(&confirmed.fingerprint)
        .await
        .expect("lookup succeeds")
        .expect("confirmed record kept");
    assert_eq!(kept.forwarded_message_id, Some(900));

    let stats = store.stats().await.expect("stats succeed");
    assert_eq!(stats.total, 1);
    assert_eq!(stats.complete, 1);
    assert_eq!(stats.provisional, 0);
}

#[tokio::test]
async fn memory_store_contract() {
    let store = MemoryStore::new();
    create_then_conflict(&store).await;
    amend_is_monotonic(&store).await;
    amend_missing_is_not_found(&store).await;
}

#[tokio::test]
async fn memory_store_release() {
    release_only_drops_provisional(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sql_store_contract() {
    let store = sql_store().await;
    create_then_conflict(&store).await;
    amend_is_monotonic(&store).await;
    amend_missing_is_not_found(&store).await;
}

#[tokio::test]
async fn sql_store_release() {
    release_only_drops_provisional(&sql_store().await).await;
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn concurrent_creates_yield_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let record = ForwardedRecord::provisional(&event("3333333333333", None), at());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let record = record.clone();
            tokio::spawn(async move { store.create(&record).await })
        })
        .collect();

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task should not panic") {
            Ok(()) => created += 1,
            Err(StoreError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
}
