//! Per-message orchestration: extract, correlate, normalize, dedup, publish.

use cardrelay_core::{
    AmendAction, AmendOutcome, CandidateExtraction, CardEvent, Clock, Completeness, Fingerprint,
    ForwardAction, ForwardStore, ForwardedRecord, MessageId, Publisher, RawMessage, StoreError,
    SystemClock, UnitValue, retry_if,
};
use cardrelay_extract::{PatternExtractor, normalize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::correlator::{ContextConfig, ContextCorrelator};
use crate::fallback::Fallback;
use crate::scheduler::{ArmOutcome, RetryOutcome, ValidationConfig, ValidationScheduler, ValidationTask};

/// What to do with an event that is still partial after correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Forward now and let validation amend it later.
    #[default]
    Forward,
    /// Hold it back; a later message may still complete it.
    Suppress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub partial: PartialPolicy,
    /// A provisional record younger than this suppresses duplicates; an older
    /// one is assumed lost and the forward is retried.
    #[serde(default = "PolicyConfig::default_provisional_ttl_secs")]
    pub provisional_ttl_secs: i64,
    /// Delays between retries of transient store failures.
    #[serde(default = "PolicyConfig::default_store_retry_millis")]
    pub store_retry_millis: Vec<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            partial: PartialPolicy::default(),
            provisional_ttl_secs: Self::default_provisional_ttl_secs(),
            store_retry_millis: Self::default_store_retry_millis(),
        }
    }
}

impl PolicyConfig {
    const fn default_provisional_ttl_secs() -> i64 {
        300
    }

    fn default_store_retry_millis() -> Vec<u64> {
        vec![100, 500, 2000]
    }
}

/// Everything the dispatcher needs besides its collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Already forwarded and nothing new.
    Duplicate,
    /// Another forward of the same card is in progress.
    InFlight,
    /// Partial event held back by [`PartialPolicy::Suppress`].
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded {
        fingerprint: Fingerprint,
        forwarded_message_id: MessageId,
        completeness: Completeness,
        message_ids: Vec<MessageId>,
    },
    Amended {
        fingerprint: Fingerprint,
        forwarded_message_id: MessageId,
        unit: UnitValue,
    },
    Suppressed {
        fingerprint: Fingerprint,
        reason: SuppressReason,
    },
    /// Nothing card-like in the message (or only an orphan fragment).
    Ignored,
    Failed {
        fingerprint: Option<Fingerprint>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Amended {
        fingerprint: Fingerprint,
        unit: UnitValue,
        settled: bool,
    },
    Rearmed {
        fingerprint: Fingerprint,
        fire_at: DateTime<Utc>,
    },
    /// Out of attempts; the record stays as it is.
    Exhausted { fingerprint: Fingerprint },
    /// Already settled by something else.
    Resolved { fingerprint: Fingerprint },
    /// Canceled while firing.
    Canceled { fingerprint: Fingerprint },
    /// The record is gone.
    Discarded { fingerprint: Fingerprint },
    Failed {
        fingerprint: Fingerprint,
        reason: String,
    },
}

pub struct Dispatcher {
    extractor: PatternExtractor,
    correlator: ContextCorrelator,
    scheduler: ValidationScheduler,
    fallback: Fallback,
    store: Arc<dyn ForwardStore>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    policy: PolicyConfig,
    store_retry: Vec<Duration>,
    /// Forwards that went out but could not be confirmed in the store.
    unconfirmed: Mutex<HashMap<Fingerprint, MessageId>>,
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        extractor: PatternExtractor,
        store: Arc<dyn ForwardStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let store_retry = config
            .policy
            .store_retry_millis
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        Self {
            extractor,
            correlator: ContextCorrelator::new(config.context),
            scheduler: ValidationScheduler::new(config.validation),
            fallback: Fallback::Disabled,
            store,
            publisher,
            clock: Arc::new(SystemClock),
            policy: config.policy,
            store_retry,
            unconfirmed: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn correlator(&self) -> &ContextCorrelator {
        &self.correlator
    }

    #[must_use]
    pub const fn scheduler(&self) -> &ValidationScheduler {
        &self.scheduler
    }

    fn unconfirmed(&self) -> MutexGuard<'_, HashMap<Fingerprint, MessageId>> {
        self.unconfirmed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn store_call<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_if(op, &self.store_retry, StoreError::is_transient).await
    }

    /// Process one inbound message. Safe to call again with the same message.
    pub async fn ingest(&self, message: &RawMessage) -> Vec<DispatchOutcome> {
        let candidates = self.extractor.extract(&message.text);
        self.correlator.record(message, &candidates);

        if candidates.is_empty() {
            return vec![DispatchOutcome::Ignored];
        }
        debug!(
            "Message {}/{}: {} candidate(s)",
            message.channel_id,
            message.message_id,
            candidates.len()
        );

        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let (candidate, related) = self.complete(message, candidate).await;
            let Some(event) = normalize(&candidate, message, &related) else {
                outcomes.push(DispatchOutcome::Ignored);
                continue;
            };
            let origin = self.origin_of(&event, message);
            outcomes.push(self.dispatch(event, &origin).await);
        }
        outcomes
    }

    /// Fill missing fields from the context window, then from the fallback.
    async fn complete(
        &self,
        message: &RawMessage,
        mut candidate: CandidateExtraction,
    ) -> (CandidateExtraction, Vec<MessageId>) {
        let mut related = Vec::new();
        let channel = message.channel_id;

        if candidate.is_missing_unit() || candidate.is_missing_card() {
            if let Some(found) = self.correlator.find_complement(message, &candidate) {
                debug!(
                    "Merged message {} ({}) into {}",
                    found.message_id, found.candidate.rule_id, message.message_id
                );
                candidate.absorb(&found.candidate);
                related.push(found.message_id);
                self.correlator.mark_consumed(channel, found.message_id);
                self.correlator.mark_consumed(channel, message.message_id);
            }
        }

        if candidate.card_number.is_some() && candidate.is_missing_unit() && self.fallback.is_enabled()
        {
            let context = self.correlator.context_text(message);
            if let Some(extra) = self
                .fallback
                .extract(&message.text, context.as_deref(), self.clock.now())
                .await
                .filter(|extra| !candidate.conflicts_with(extra))
            {
                candidate.absorb(&extra);
            }
        }

        (candidate, related)
    }

    /// The message that carried the card: `message` itself, or the earlier
    /// one it was merged with.
    fn origin_of(&self, event: &CardEvent, message: &RawMessage) -> RawMessage {
        event
            .origin_message()
            .filter(|id| *id != message.message_id)
            .and_then(|id| self.correlator.message(message.channel_id, id))
            .unwrap_or_else(|| message.clone())
    }

    async fn dispatch(&self, event: CardEvent, origin: &RawMessage) -> DispatchOutcome {
        let now = self.clock.now();
        let fingerprint = event.fingerprint.clone();

        // A lost create race re-resolves through lookup once more.
        for _ in 0..3 {
            let existing = match self.store_call(|| self.store.lookup(&fingerprint)).await {
                Ok(existing) => existing,
                Err(e) => return store_failure(Some(&fingerprint), &e),
            };

            match existing {
                None => {
                    if event.completeness == Completeness::Partial
                        && self.policy.partial == PartialPolicy::Suppress
                    {
                        debug!("Holding partial event {}", fingerprint.short());
                        return DispatchOutcome::Suppressed {
                            fingerprint,
                            reason: SuppressReason::Partial,
                        };
                    }
                    let record = ForwardedRecord::provisional(&event, now);
                    match self.store_call(|| self.store.create(&record)).await {
                        Ok(()) => return self.publish_new(event, origin, now).await,
                        Err(StoreError::Conflict(_)) => {
                            debug!("Create conflict on {}, re-resolving", fingerprint.short());
                        }
                        Err(e) => return store_failure(Some(&fingerprint), &e),
                    }
                }
                Some(record) if record.is_provisional() => {
                    let known = self.unconfirmed().get(&fingerprint).copied();
                    if let Some(forwarded_message_id) = known {
                        return match self.reconfirm(&record, forwarded_message_id).await {
                            Some(confirmed) => self.amend_existing(&event, &confirmed, now).await,
                            None => DispatchOutcome::Suppressed {
                                fingerprint,
                                reason: SuppressReason::InFlight,
                            },
                        };
                    }
                    let age = now - record.created_at;
                    if age < chrono::Duration::seconds(self.policy.provisional_ttl_secs) {
                        return DispatchOutcome::Suppressed {
                            fingerprint,
                            reason: SuppressReason::InFlight,
                        };
                    }
                    warn!(
                        "Provisional record {} unconfirmed for {}s, retrying forward",
                        fingerprint.short(),
                        age.num_seconds()
                    );
                    if let Err(e) = self.store_call(|| self.store.release(&fingerprint)).await {
                        return store_failure(Some(&fingerprint), &e);
                    }
                }
                Some(record) => return self.amend_existing(&event, &record, now).await,
            }
        }

        DispatchOutcome::Suppressed {
            fingerprint,
            reason: SuppressReason::InFlight,
        }
    }

    /// Confirm a provisional record whose forward is known to have gone out.
    async fn reconfirm(
        &self,
        record: &ForwardedRecord,
        forwarded_message_id: MessageId,
    ) -> Option<ForwardedRecord> {
        let fingerprint = &record.fingerprint;
        match self
            .store_call(|| self.store.confirm(fingerprint, forwarded_message_id))
            .await
        {
            Ok(()) => {
                self.unconfirmed().remove(fingerprint);
                info!(
                    "Confirmed {} as message {forwarded_message_id} on retry",
                    fingerprint.short()
                );
                Some(ForwardedRecord {
                    forwarded_message_id: Some(forwarded_message_id),
                    ..record.clone()
                })
            }
            Err(e) => {
                warn!("Confirm of {} still failing: {e}", fingerprint.short());
                None
            }
        }
    }

    async fn publish_new(
        &self,
        event: CardEvent,
        origin: &RawMessage,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let fingerprint = event.fingerprint.clone();
        let action = ForwardAction { event };

        let forwarded_message_id = match self.publisher.forward(&action).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Forward of {} failed: {e}", fingerprint.short());
                if let Err(release) = self.store_call(|| self.store.release(&fingerprint)).await {
                    error!(
                        "Could not release provisional record {}: {release}",
                        fingerprint.short()
                    );
                }
                return DispatchOutcome::Failed {
                    fingerprint: Some(fingerprint),
                    reason: e.to_string(),
                };
            }
        };

        if let Err(e) = self
            .store_call(|| self.store.confirm(&fingerprint, forwarded_message_id))
            .await
        {
            error!(
                "Forwarded {} as {forwarded_message_id} but could not confirm: {e}",
                fingerprint.short()
            );
            self.unconfirmed()
                .insert(fingerprint.clone(), forwarded_message_id);
        }

        let event = action.event;
        info!(
            "Forwarded {} {} ({}) as message {forwarded_message_id}",
            event.provider,
            fingerprint.short(),
            event.completeness
        );

        if event.needs_validation() {
            match self.scheduler.arm(&fingerprint, origin, now) {
                ArmOutcome::Armed(at) => info!("Validation for {} at {at}", fingerprint.short()),
                ArmOutcome::AlreadyArmed => {}
                ArmOutcome::Refused => warn!(
                    "Validation not armed for {}; record stays {}",
                    fingerprint.short(),
                    event.completeness
                ),
            }
        }

        DispatchOutcome::Forwarded {
            fingerprint,
            forwarded_message_id,
            completeness: event.completeness,
            message_ids: event.message_ids,
        }
    }

    async fn amend_existing(
        &self,
        event: &CardEvent,
        record: &ForwardedRecord,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let fingerprint = event.fingerprint.clone();
        let Some(unit) = event.unit.filter(|_| event.upgrades(record)) else {
            debug!("Duplicate of {}, suppressed", fingerprint.short());
            return DispatchOutcome::Suppressed {
                fingerprint,
                reason: SuppressReason::Duplicate,
            };
        };

        match self.apply_amendment(record, unit, event.completeness, now).await {
            Ok(Some((forwarded_message_id, settled))) => {
                if settled {
                    self.scheduler.cancel(&fingerprint);
                }
                DispatchOutcome::Amended {
                    fingerprint,
                    forwarded_message_id,
                    unit,
                }
            }
            Ok(None) => DispatchOutcome::Suppressed {
                fingerprint,
                reason: SuppressReason::Duplicate,
            },
            Err(reason) => DispatchOutcome::Failed {
                fingerprint: Some(fingerprint),
                reason,
            },
        }
    }

    /// Amend in the store, then at the destination. `Ok(None)` when the store
    /// reports the value as stale; otherwise the destination message id and
    /// whether the record is now settled.
    async fn apply_amendment(
        &self,
        record: &ForwardedRecord,
        unit: UnitValue,
        completeness: Completeness,
        now: DateTime<Utc>,
    ) -> Result<Option<(MessageId, bool)>, String> {
        let fingerprint = &record.fingerprint;
        let Some(forwarded_message_id) = record.forwarded_message_id else {
            return Err(format!("record {} is not confirmed", fingerprint.short()));
        };

        let updated = match self
            .store_call(|| self.store.amend(fingerprint, unit, completeness, now))
            .await
        {
            Ok(AmendOutcome::Applied(updated)) => updated,
            Ok(AmendOutcome::Stale(_)) => return Ok(None),
            Err(StoreError::NotFound(_)) => {
                warn!("Record {} vanished before amend", fingerprint.short());
                return Err(format!("record {} not found", fingerprint.short()));
            }
            Err(e) => {
                error!("Amend of {} failed: {e}", fingerprint.short());
                return Err(e.to_string());
            }
        };

        let action = AmendAction {
            fingerprint: fingerprint.clone(),
            forwarded_message_id,
            new_unit_value: unit,
            provider: updated.provider.clone(),
            card_number: updated.card_number.clone(),
            card_date: updated.card_date,
            amended_at: now,
        };
        if let Err(e) = self.publisher.amend(&action).await {
            error!(
                "Record {} amended but destination message {forwarded_message_id} was not: {e}",
                fingerprint.short()
            );
            return Err(e.to_string());
        }

        info!(
            "Amended {} to {} {} ({})",
            fingerprint.short(),
            unit.amount,
            unit.kind,
            unit.confidence
        );
        Ok(Some((forwarded_message_id, updated.is_settled())))
    }

    /// Fire every validation task that is due now.
    pub async fn run_due_validations(&self) -> Vec<ValidationOutcome> {
        let now = self.clock.now();
        let due = self.scheduler.take_due(now);
        let mut outcomes = Vec::with_capacity(due.len());
        for task in due {
            outcomes.push(self.validate(&task, now).await);
        }
        outcomes
    }

    async fn validate(&self, task: &ValidationTask, now: DateTime<Utc>) -> ValidationOutcome {
        let fingerprint = task.fingerprint.clone();
        let record = match self.store_call(|| self.store.lookup(&fingerprint)).await {
            Ok(Some(record)) if record.is_provisional() => {
                let known = self.unconfirmed().get(&fingerprint).copied();
                let confirmed = match known {
                    Some(id) => self.reconfirm(&record, id).await,
                    None => None,
                };
                confirmed.unwrap_or(record)
            }
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Validation for {}: record not found, discarding", fingerprint.short());
                self.scheduler.finish(task);
                return ValidationOutcome::Discarded { fingerprint };
            }
            Err(e) => {
                error!("Validation for {} dropped: {e}", fingerprint.short());
                self.scheduler.finish(task);
                return ValidationOutcome::Failed {
                    fingerprint,
                    reason: e.to_string(),
                };
            }
        };

        if record.is_settled() {
            self.scheduler.finish(task);
            return ValidationOutcome::Resolved { fingerprint };
        }

        let candidate = self.recheck(task, &record).await;
        let improvement = candidate
            .unit
            .filter(|unit| unit.upgrades(record.unit.as_ref()));

        if let Some(unit) = improvement {
            let completeness = Completeness::classify(
                candidate.card_number.is_some(),
                candidate.has_known_provider(),
                true,
            );
            match self.apply_amendment(&record, unit, completeness, now).await {
                Ok(Some((_, true))) => {
                    self.scheduler.finish(task);
                    return ValidationOutcome::Amended {
                        fingerprint,
                        unit,
                        settled: true,
                    };
                }
                Ok(Some((_, false))) => {
                    // Still low confidence: keep checking while attempts remain.
                    match self.scheduler.retry(task, now) {
                        RetryOutcome::Rearmed(fire_at) => debug!(
                            "Validation for {} amended to a low-confidence value, next attempt at {fire_at}",
                            fingerprint.short()
                        ),
                        RetryOutcome::Exhausted => info!(
                            "Validation for {} exhausted after {} attempts; unit stays unconfirmed",
                            fingerprint.short(),
                            task.max_attempts
                        ),
                        RetryOutcome::Canceled => {}
                    }
                    return ValidationOutcome::Amended {
                        fingerprint,
                        unit,
                        settled: false,
                    };
                }
                Ok(None) => {}
                Err(reason) => {
                    self.scheduler.finish(task);
                    return ValidationOutcome::Failed { fingerprint, reason };
                }
            }
        }

        match self.scheduler.retry(task, now) {
            RetryOutcome::Rearmed(fire_at) => {
                debug!(
                    "Validation for {} not improved, next attempt at {fire_at}",
                    fingerprint.short()
                );
                ValidationOutcome::Rearmed {
                    fingerprint,
                    fire_at,
                }
            }
            RetryOutcome::Exhausted => {
                info!(
                    "Validation for {} exhausted after {} attempts; record stays {}",
                    fingerprint.short(),
                    task.max_attempts,
                    record.completeness
                );
                ValidationOutcome::Exhausted { fingerprint }
            }
            RetryOutcome::Canceled => ValidationOutcome::Canceled { fingerprint },
        }
    }

    /// Re-extract the originating message, then search the current window
    /// around it, then ask the fallback if neither helped.
    async fn recheck(&self, task: &ValidationTask, record: &ForwardedRecord) -> CandidateExtraction {
        let origin = &task.origin;
        let provider = Some(record.provider.clone()).filter(|p| !p.is_unknown());
        let mut candidate =
            CandidateExtraction::new("validation", record.card_number.clone(), provider, None);

        if let Some(found) = self
            .extractor
            .extract(&origin.text)
            .into_iter()
            .find(|c| c.card_number == record.card_number && !candidate.conflicts_with(c))
        {
            candidate.absorb(&found);
        }
        let improves = |c: &CandidateExtraction| {
            c.unit
                .is_some_and(|unit| unit.upgrades(record.unit.as_ref()))
        };
        if improves(&candidate) {
            return candidate;
        }
        candidate.unit = None;
        candidate.refresh_confidence();

        if let Some(found) = self.correlator.find_around(origin, &candidate) {
            debug!(
                "Validation for {} found units in message {}",
                record.fingerprint.short(),
                found.message_id
            );
            candidate.absorb(&found.candidate);
            self.correlator
                .mark_consumed(origin.channel_id, found.message_id);
            if improves(&candidate) {
                return candidate;
            }
        }

        let context = self.correlator.context_text(origin);
        if let Some(extra) = self
            .fallback
            .extract(&origin.text, context.as_deref(), self.clock.now())
            .await
            .filter(|extra| !candidate.conflicts_with(extra))
        {
            candidate.absorb(&extra);
        }
        candidate
    }

    /// Fire due validations and prune the context window every tick until
    /// `shutdown` flips to `true`.
    pub async fn run_validation_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.scheduler.tick());
        info!("Validation loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    if self.scheduler.next_fire_at().is_some_and(|at| at <= now) {
                        let outcomes = self.run_due_validations().await;
                        debug!("Ran {} validation(s), {} pending", outcomes.len(), self.scheduler.pending());
                    }
                    self.correlator.prune(now);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Validation loop stopped");
    }
}

fn store_failure(fingerprint: Option<&Fingerprint>, err: &StoreError) -> DispatchOutcome {
    error!(
        "Dropping message work for {}: {err}",
        fingerprint.map_or("-", Fingerprint::short)
    );
    DispatchOutcome::Failed {
        fingerprint: fingerprint.cloned(),
        reason: err.to_string(),
    }
}
