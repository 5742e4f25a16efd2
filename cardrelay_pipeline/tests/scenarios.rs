//! End-to-end dispatcher scenarios against the in-memory store, a recording
//! publisher and a manual clock.

use async_trait::async_trait;
use cardrelay_core::{
    AmendAction, AmendOutcome, CandidateExtraction, ChannelId, Clock, Completeness, FallbackExtractor,
    Fingerprint, ForwardAction, ForwardStore, ForwardedRecord, ManualClock, MessageId,
    ProviderTag, Publisher, RawMessage, StoreError, StoreStats, UnitValue,
};
use cardrelay_extract::PatternExtractor;
use cardrelay_pipeline::{
    DispatchOutcome, Dispatcher, Fallback, PartialPolicy, PipelineConfig, SuppressReason,
    ValidationOutcome,
};
use cardrelay_store::MemoryStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const CHANNEL: ChannelId = -1_001_234;

#[derive(Default)]
struct RecordingPublisher {
    forwards: Mutex<Vec<ForwardAction>>,
    amends: Mutex<Vec<AmendAction>>,
    fail_forwards: AtomicBool,
    next_id: AtomicI32,
}

impl RecordingPublisher {
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn forwards(&self) -> Vec<ForwardAction> {
        self.forwards.lock().expect("publisher lock").clone()
    }

    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn amends(&self) -> Vec<AmendAction> {
        self.amends.lock().expect("publisher lock").clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn forward(&self, action: &ForwardAction) -> anyhow::Result<MessageId> {
        if self.fail_forwards.load(Ordering::SeqCst) {
            anyhow::bail!("destination unavailable");
        }
        self.forwards
            .lock()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .push(action.clone());
        Ok(500 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn amend(&self, action: &AmendAction) -> anyhow::Result<()> {
        self.amends
            .lock()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .push(action.clone());
        Ok(())
    }
}

/// Hands out scripted unit amounts, then nothing.
struct ScriptedFallback {
    answers: Mutex<VecDeque<Option<u32>>>,
    calls: AtomicUsize,
}

#[async_trait]
impl FallbackExtractor for ScriptedFallback {
    async fn extract(
        &self,
        _text: &str,
        _context: Option<&str>,
    ) -> anyhow::Result<Option<CandidateExtraction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .pop_front()
            .flatten();
        Ok(answer.map(|n| CandidateExtraction::unit_only("scripted", UnitValue::low(n))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Fails the first `failures` lookups and the first `confirm_failures`
/// confirms with a transient error.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
    confirm_failures: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ForwardStore for FlakyStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<ForwardedRecord>, StoreError> {
        if take_failure(&self.failures) {
            return Err(StoreError::Transient(anyhow::anyhow!("database is locked")));
        }
        self.inner.lookup(fingerprint).await
    }

    async fn create(&self, record: &ForwardedRecord) -> Result<(), StoreError> {
        self.inner.create(record).await
    }

    async fn amend(
        &self,
        fingerprint: &Fingerprint,
        unit: UnitValue,
        completeness: Completeness,
        at: DateTime<Utc>,
    ) -> Result<AmendOutcome, StoreError> {
        self.inner.amend(fingerprint, unit, completeness, at).await
    }

    async fn confirm(&self, fingerprint: &Fingerprint, id: MessageId) -> Result<(), StoreError> {
        if take_failure(&self.confirm_failures) {
            return Err(StoreError::Transient(anyhow::anyhow!("disk I/O error")));
        }
        self.inner.confirm(fingerprint, id).await
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        self.inner.release(fingerprint).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }
}

struct Harness {
    dispatcher: Dispatcher,
    clock: Arc<ManualClock>,
    publisher: Arc<RecordingPublisher>,
    store: Arc<dyn ForwardStore>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0)
        .single()
        .unwrap_or_default()
}

#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
fn build(policy: PartialPolicy, store: Arc<dyn ForwardStore>, fallback: Fallback) -> Harness {
    let mut config = PipelineConfig::default();
    config.policy.partial = policy;
    config.policy.store_retry_millis = vec![1, 1];

    let clock = Arc::new(ManualClock::new(start()));
    let publisher = Arc::new(RecordingPublisher::default());
    let extractor = PatternExtractor::with_defaults().expect("default rules should compile");
    let dispatcher = Dispatcher::new(config, extractor, store.clone(), publisher.clone())
        .with_clock(clock.clone())
        .with_fallback(fallback);

    Harness {
        dispatcher,
        clock,
        publisher,
        store,
    }
}

fn harness(policy: PartialPolicy) -> Harness {
    build(policy, Arc::new(MemoryStore::new()), Fallback::Disabled)
}

impl Harness {
    fn message(&self, id: MessageId, text: &str) -> RawMessage {
        RawMessage::new(CHANNEL, id, text, self.clock.now())
    }

    async fn send(&self, id: MessageId, text: &str) -> Vec<DispatchOutcome> {
        self.dispatcher.ingest(&self.message(id, text)).await
    }

    /// Advance `secs` the way the validation loop does: the window is pruned
    /// on the tick before the due tasks fire.
    async fn tick_forward(&self, secs: i64) -> Vec<ValidationOutcome> {
        self.clock.advance(Duration::seconds(secs - 1));
        self.dispatcher.correlator().prune(self.clock.now());
        self.clock.advance(Duration::seconds(1));
        self.dispatcher.run_due_validations().await
    }

    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    async fn record(&self, fingerprint: &Fingerprint) -> ForwardedRecord {
        self.store
            .lookup(fingerprint)
            .await
            .expect("lookup succeeds")
            .expect("record exists")
    }

    /// The provisional record a forward of `text` would create.
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn record_for(&self, text: &str) -> ForwardedRecord {
        let extractor = PatternExtractor::with_defaults().expect("default rules should compile");
        let candidate = extractor.extract(text).remove(0);
        let event = cardrelay_extract::normalize(&candidate, &self.message(99, text), &[])
            .expect("card candidate should normalize");
        ForwardedRecord::provisional(&event, self.clock.now())
    }
}

fn card(provider: &str, number: &str) -> Fingerprint {
    Fingerprint::for_card(&ProviderTag::new(provider), number)
}

#[tokio::test]
async fn scenario_a_complete_card_forwards_once() {
    let h = harness(PartialPolicy::Forward);
    let outcomes = h.send(1, "Vodafone card 1234-5678-9012, 50 units").await;

    assert!(matches!(
        outcomes.as_slice(),
        [DispatchOutcome::Forwarded { completeness: Completeness::Complete, message_ids, .. }]
            if message_ids == &vec![1]
    ));
    let forwards = h.publisher.forwards();
    assert_eq!(forwards.len(), 1);
    let event = &forwards[0].event;
    assert_eq!(event.provider, ProviderTag::new("vodafone"));
    assert_eq!(event.unit, Some(UnitValue::high(50)));
    assert_eq!(event.card_date, start().date_naive());
    assert_eq!(h.dispatcher.scheduler().pending(), 0);
}

#[tokio::test]
async fn scenario_b_partial_then_units_amends() {
    let h = harness(PartialPolicy::Forward);
    let first = h.send(1, "WE card 1111-2222-3333").await;
    assert!(matches!(
        first.as_slice(),
        [DispatchOutcome::Forwarded { completeness: Completeness::Partial, .. }]
    ));
    assert_eq!(h.dispatcher.scheduler().pending(), 1);

    h.clock.advance(Duration::minutes(2));
    let second = h.send(2, "units: 20").await;
    assert!(matches!(
        second.as_slice(),
        [DispatchOutcome::Amended { unit, .. }] if *unit == UnitValue::high(20)
    ));

    assert_eq!(h.publisher.forwards().len(), 1);
    let amends = h.publisher.amends();
    assert_eq!(amends.len(), 1);
    assert_eq!(amends[0].forwarded_message_id, 500);
    assert_eq!(amends[0].card_number.as_deref(), Some("111122223333"));
    assert_eq!(h.dispatcher.scheduler().pending(), 0);

    let record = h.record(&card("we", "111122223333")).await;
    assert_eq!(record.completeness, Completeness::Complete);
    assert!(record.is_settled());
}

#[tokio::test]
async fn scenario_b_suppress_policy_forwards_merged_event() {
    let h = harness(PartialPolicy::Suppress);
    let first = h.send(1, "WE card 1111-2222-3333").await;
    assert!(matches!(
        first.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::Partial, .. }]
    ));
    assert!(h.publisher.forwards().is_empty());

    h.clock.advance(Duration::minutes(2));
    let second = h.send(2, "units: 20").await;
    assert!(matches!(
        second.as_slice(),
        [DispatchOutcome::Forwarded { completeness: Completeness::Complete, .. }]
    ));

    let forwards = h.publisher.forwards();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].event.message_ids, vec![1, 2]);
    assert_eq!(forwards[0].event.unit, Some(UnitValue::high(20)));
}

#[tokio::test]
async fn scenario_c_validation_exhausts_without_amend() {
    let h = harness(PartialPolicy::Forward);
    h.send(1, "Orange card 9999-8888-7777").await;
    assert_eq!(h.dispatcher.scheduler().pending(), 1);

    h.clock.advance(Duration::seconds(29));
    assert!(h.dispatcher.run_due_validations().await.is_empty());

    let mut outcomes = Vec::new();
    for step in [1, 120, 600] {
        h.clock.advance(Duration::seconds(step));
        outcomes.extend(h.dispatcher.run_due_validations().await);
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], ValidationOutcome::Rearmed { .. }));
    assert!(matches!(outcomes[1], ValidationOutcome::Rearmed { .. }));
    assert!(matches!(outcomes[2], ValidationOutcome::Exhausted { .. }));

    assert!(h.publisher.amends().is_empty());
    assert_eq!(h.dispatcher.scheduler().pending(), 0);
    let record = h.record(&card("orange", "999988887777")).await;
    assert_eq!(record.completeness, Completeness::Partial);
}

#[tokio::test]
async fn scenario_d_replay_is_idempotent() {
    let h = harness(PartialPolicy::Forward);
    let text = "*858*4102550427511#\nvalue: 100";
    h.send(7, text).await;
    let replay = h.send(7, text).await;

    assert!(matches!(
        replay.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::Duplicate, .. }]
    ));
    let repost = h.send(8, "*858*4102550427511#").await;
    assert!(matches!(
        repost.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::Duplicate, .. }]
    ));
    assert_eq!(h.publisher.forwards().len(), 1);
}

#[tokio::test]
async fn scenario_e_manual_completion_cancels_validation() {
    let h = harness(PartialPolicy::Forward);
    h.send(1, "Orange card 9999-8888-7777").await;
    assert_eq!(h.dispatcher.scheduler().pending(), 1);

    h.clock.advance(Duration::seconds(10));
    let outcomes = h.send(2, "Orange card 9999-8888-7777\nunits: 100").await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Amended { .. }]));
    assert_eq!(h.dispatcher.scheduler().pending(), 0);

    h.clock.advance(Duration::hours(1));
    assert!(h.dispatcher.run_due_validations().await.is_empty());
    assert_eq!(h.publisher.amends().len(), 1);
}

#[tokio::test]
async fn chatter_is_ignored() {
    let h = harness(PartialPolicy::Forward);
    for (id, text) in [(1, "good morning"), (2, "see you at 10:30"), (3, "")] {
        assert_eq!(h.send(id, text).await, vec![DispatchOutcome::Ignored]);
    }
    assert!(h.publisher.forwards().is_empty());
}

#[tokio::test]
async fn unit_value_never_downgrades() {
    let h = harness(PartialPolicy::Forward);
    h.send(1, "*858*4102550427511#\nunits: 300").await;
    let lower = h.send(2, "*858*4102550427511# 150").await;
    assert!(matches!(
        lower.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::Duplicate, .. }]
    ));
    let record = h.record(&card("vodafone", "4102550427511")).await;
    assert_eq!(record.unit, Some(UnitValue::high(300)));
}

#[tokio::test]
async fn failed_forward_releases_and_retries() {
    let h = harness(PartialPolicy::Forward);
    h.publisher.fail_forwards.store(true, Ordering::SeqCst);
    let failed = h.send(1, "Vodafone card 1234-5678-9012, 50 units").await;
    assert!(matches!(failed.as_slice(), [DispatchOutcome::Failed { .. }]));
    assert_eq!(h.store.stats().await.map(|s| s.total).ok(), Some(0));

    h.publisher.fail_forwards.store(false, Ordering::SeqCst);
    let retried = h.send(1, "Vodafone card 1234-5678-9012, 50 units").await;
    assert!(matches!(retried.as_slice(), [DispatchOutcome::Forwarded { .. }]));
    assert_eq!(h.publisher.forwards().len(), 1);
}

#[tokio::test]
#[expect(clippy::expect_used, reason = "Test failure should panic with context")]
async fn provisional_records_gate_by_age() {
    let h = harness(PartialPolicy::Forward);
    let text = "Vodafone card 1234-5678-9012, 50 units";
    let fingerprint = card("vodafone", "123456789012");

    let mut pending = h.record_for(text);
    h.store.create(&pending).await.expect("create succeeds");
    let fresh = h.send(1, text).await;
    assert!(matches!(
        fresh.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::InFlight, .. }]
    ));

    h.store.release(&fingerprint).await.expect("release succeeds");
    pending.created_at = start() - Duration::minutes(10);
    h.store.create(&pending).await.expect("create succeeds");
    let stale = h.send(1, text).await;
    assert!(matches!(stale.as_slice(), [DispatchOutcome::Forwarded { .. }]));
    assert_eq!(h.record(&fingerprint).await.forwarded_message_id, Some(500));
}

#[tokio::test]
async fn transient_lookup_failures_are_retried() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures: AtomicUsize::new(2),
        confirm_failures: AtomicUsize::new(0),
    });
    let h = build(PartialPolicy::Forward, store, Fallback::Disabled);
    let outcomes = h.send(1, "Vodafone card 1234-5678-9012, 50 units").await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Forwarded { .. }]));
}

#[tokio::test]
async fn same_card_on_two_channels_forwards_once() {
    let h = harness(PartialPolicy::Forward);
    let text = "Vodafone card 1234-5678-9012, 50 units";
    let a = RawMessage::new(CHANNEL, 1, text, h.clock.now());
    let b = RawMessage::new(CHANNEL - 1, 1, text, h.clock.now());

    let (first, second) = tokio::join!(h.dispatcher.ingest(&a), h.dispatcher.ingest(&b));
    let forwarded = first
        .iter()
        .chain(second.iter())
        .filter(|o| matches!(o, DispatchOutcome::Forwarded { .. }))
        .count();
    assert_eq!(forwarded, 1);
    assert_eq!(h.publisher.forwards().len(), 1);
}

#[tokio::test]
async fn validation_uses_fallback_result() {
    let fallback = Arc::new(ScriptedFallback {
        answers: Mutex::new(VecDeque::from([None, Some(100)])),
        calls: AtomicUsize::new(0),
    });
    let h = build(
        PartialPolicy::Forward,
        Arc::new(MemoryStore::new()),
        Fallback::enabled(
            fallback.clone(),
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(60),
        ),
    );

    let first = h.send(1, "Orange card 9999-8888-7777").await;
    assert!(matches!(
        first.as_slice(),
        [DispatchOutcome::Forwarded { completeness: Completeness::Partial, .. }]
    ));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

    h.clock.advance(Duration::seconds(30));
    let outcomes = h.dispatcher.run_due_validations().await;
    assert!(matches!(
        outcomes.as_slice(),
        [ValidationOutcome::Amended { settled: false, unit, .. }] if *unit == UnitValue::low(100)
    ));

    // Low confidence keeps the task alive.
    assert_eq!(h.dispatcher.scheduler().pending(), 1);
    let record = h.record(&card("orange", "999988887777")).await;
    assert_eq!(record.completeness, Completeness::Complete);
    assert_eq!(h.publisher.amends().len(), 1);
}

#[tokio::test]
async fn reply_with_units_completes_the_right_card() {
    let h = harness(PartialPolicy::Forward);
    h.send(1, "WE card 1111-2222-3333").await;
    h.clock.advance(Duration::seconds(20));
    h.send(2, "WE card 4444-5555-6666").await;
    h.clock.advance(Duration::seconds(20));

    let reply = h.message(3, "units: 40").replying_to(1);
    let outcomes = h.dispatcher.ingest(&reply).await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Amended { .. }]));

    let amends = h.publisher.amends();
    assert_eq!(amends[0].card_number.as_deref(), Some("111122223333"));
    assert_eq!(h.dispatcher.scheduler().pending(), 1);
}

fn scripted(answers: &[Option<u32>]) -> Arc<ScriptedFallback> {
    Arc::new(ScriptedFallback {
        answers: Mutex::new(answers.iter().copied().collect()),
        calls: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn last_attempt_still_checks_after_window_is_pruned() {
    let fallback = scripted(&[None, None, None, Some(100)]);
    let h = build(
        PartialPolicy::Forward,
        Arc::new(MemoryStore::new()),
        Fallback::enabled(
            fallback.clone(),
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(60),
        ),
    );
    h.send(1, "Orange card 9999-8888-7777").await;

    let mut outcomes = Vec::new();
    for step in [30, 120, 600] {
        outcomes.extend(h.tick_forward(step).await);
    }
    assert_eq!(h.dispatcher.correlator().len(CHANNEL), 0);

    assert!(matches!(outcomes[0], ValidationOutcome::Rearmed { .. }));
    assert!(matches!(outcomes[1], ValidationOutcome::Rearmed { .. }));
    assert!(matches!(
        &outcomes[2],
        ValidationOutcome::Amended { settled: false, unit, .. } if *unit == UnitValue::low(100)
    ));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.publisher.amends().len(), 1);
    // The low-confidence amend used up the last attempt.
    assert_eq!(h.dispatcher.scheduler().pending(), 0);
}

#[tokio::test]
async fn reply_after_the_span_is_found_by_validation() {
    let h = harness(PartialPolicy::Forward);
    h.send(1, "WE card 1111-2222-3333").await;

    let mut outcomes = h.tick_forward(30).await;
    outcomes.extend(h.tick_forward(120).await);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, ValidationOutcome::Rearmed { .. })));

    // Eleven minutes in: too late to merge on arrival.
    h.clock.advance(Duration::seconds(510));
    let reply = h.message(2, "units: 40").replying_to(1);
    assert_eq!(h.dispatcher.ingest(&reply).await, vec![DispatchOutcome::Ignored]);

    let last = h.tick_forward(90).await;
    assert!(matches!(
        last.as_slice(),
        [ValidationOutcome::Amended { settled: true, unit, .. }] if *unit == UnitValue::high(40)
    ));
    let record = h.record(&card("we", "111122223333")).await;
    assert_eq!(record.completeness, Completeness::Complete);
}

#[tokio::test]
async fn unconfirmed_forward_is_confirmed_not_repeated() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures: AtomicUsize::new(0),
        confirm_failures: AtomicUsize::new(3),
    });
    let h = build(PartialPolicy::Forward, store, Fallback::Disabled);
    let text = "Vodafone card 1234-5678-9012, 50 units";
    let fingerprint = card("vodafone", "123456789012");

    let first = h.send(1, text).await;
    assert!(matches!(first.as_slice(), [DispatchOutcome::Forwarded { .. }]));
    assert!(h.record(&fingerprint).await.is_provisional());

    h.clock.advance(Duration::minutes(10));
    let replay = h.send(1, text).await;
    assert!(matches!(
        replay.as_slice(),
        [DispatchOutcome::Suppressed { reason: SuppressReason::Duplicate, .. }]
    ));
    assert_eq!(h.publisher.forwards().len(), 1);
    assert_eq!(h.record(&fingerprint).await.forwarded_message_id, Some(500));
}
