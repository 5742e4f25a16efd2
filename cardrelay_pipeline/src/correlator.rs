//! Per-channel sliding window of recent messages and their extractions.

use cardrelay_core::{CandidateExtraction, ChannelId, MessageId, RawMessage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Context window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Messages kept per channel; the oldest is evicted first.
    pub capacity: usize,
    /// Maximum distance between two messages that may be merged.
    pub span_secs: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            span_secs: 600,
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    message_id: MessageId,
    received_at: DateTime<Utc>,
    reply_to: Option<MessageId>,
    text: String,
    candidates: Vec<CandidateExtraction>,
    consumed: bool,
}

/// A buffered extraction that fills what another one is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complement {
    pub message_id: MessageId,
    pub candidate: CandidateExtraction,
}

type Windows = HashMap<ChannelId, VecDeque<WindowEntry>>;

pub struct ContextCorrelator {
    config: ContextConfig,
    windows: Mutex<Windows>,
}

impl ContextCorrelator {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn windows(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn span(&self) -> Duration {
        Duration::seconds(self.config.span_secs)
    }

    /// Buffer a message with its extraction results. A redelivered message id
    /// replaces its entry and keeps its consumed flag.
    pub fn record(&self, message: &RawMessage, candidates: &[CandidateExtraction]) {
        if self.config.capacity == 0 {
            return;
        }
        let mut windows = self.windows();
        let window = windows.entry(message.channel_id).or_default();

        let mut entry = WindowEntry {
            message_id: message.message_id,
            received_at: message.received_at,
            reply_to: message.reply_to,
            text: message.text.clone(),
            candidates: candidates.to_vec(),
            consumed: false,
        };

        if let Some(existing) = window
            .iter_mut()
            .find(|e| e.message_id == message.message_id)
        {
            entry.consumed = existing.consumed;
            *existing = entry;
            return;
        }

        // Keep arrival order even if the transport delivers late.
        let at = window
            .iter()
            .rposition(|e| e.received_at <= entry.received_at)
            .map_or(0, |i| i + 1);
        window.insert(at, entry);
        while window.len() > self.config.capacity {
            window.pop_front();
        }
    }

    /// Complement for `candidate`, read from `message`: the message it replies
    /// to if that fits, else the closest earlier one within the span.
    #[must_use]
    pub fn find_complement(
        &self,
        message: &RawMessage,
        candidate: &CandidateExtraction,
    ) -> Option<Complement> {
        let windows = self.windows();
        let window = windows.get(&message.channel_id)?;
        let at = message.received_at;
        let oldest = at - self.span();

        let mut earlier = window
            .iter()
            .rev()
            .filter(|e| e.message_id != message.message_id && !e.consumed)
            .filter(|e| e.received_at <= at)
            .take_while(|e| e.received_at >= oldest);

        if let Some(parent) = message.reply_to {
            if let Some(found) = earlier
                .clone()
                .filter(|e| e.message_id == parent)
                .find_map(|e| complement_in(e, candidate))
            {
                return Some(found);
            }
        }
        earlier.find_map(|e| complement_in(e, candidate))
    }

    /// Complement for a validation re-check of `origin`. The origin itself
    /// need not be buffered any more: every entry from one span before it up
    /// to now is searched, replies to it first, then by distance in time.
    #[must_use]
    pub fn find_around(
        &self,
        origin: &RawMessage,
        candidate: &CandidateExtraction,
    ) -> Option<Complement> {
        let windows = self.windows();
        let window = windows.get(&origin.channel_id)?;
        let oldest = origin.received_at - self.span();

        let mut nearby: Vec<&WindowEntry> = window
            .iter()
            .filter(|e| e.message_id != origin.message_id && !e.consumed)
            .filter(|e| e.received_at >= oldest)
            .collect();
        nearby.sort_by_key(|e| {
            (
                e.reply_to != Some(origin.message_id),
                (e.received_at - origin.received_at).abs(),
            )
        });

        nearby.into_iter().find_map(|e| complement_in(e, candidate))
    }

    /// Mark a message as merged so no other card takes its data.
    pub fn mark_consumed(&self, channel: ChannelId, message_id: MessageId) {
        if let Some(entry) = self
            .windows()
            .get_mut(&channel)
            .and_then(|w| w.iter_mut().find(|e| e.message_id == message_id))
        {
            entry.consumed = true;
        }
    }

    /// A buffered message as it was delivered.
    #[must_use]
    pub fn message(&self, channel: ChannelId, message_id: MessageId) -> Option<RawMessage> {
        self.windows()
            .get(&channel)?
            .iter()
            .find(|e| e.message_id == message_id)
            .map(|e| RawMessage {
                channel_id: channel,
                message_id,
                text: e.text.clone(),
                received_at: e.received_at,
                reply_to: e.reply_to,
            })
    }

    /// Texts of the other buffered messages from one span before `origin`
    /// onwards, oldest first, for the fallback extractor.
    #[must_use]
    pub fn context_text(&self, origin: &RawMessage) -> Option<String> {
        let windows = self.windows();
        let window = windows.get(&origin.channel_id)?;
        let oldest = origin.received_at - self.span();

        let texts: Vec<&str> = window
            .iter()
            .filter(|e| e.message_id != origin.message_id && e.received_at >= oldest)
            .map(|e| e.text.as_str())
            .filter(|t| !t.trim().is_empty())
            .collect();

        (!texts.is_empty()).then(|| texts.join("\n---\n"))
    }

    /// Drop entries older than the span and empty windows.
    pub fn prune(&self, now: DateTime<Utc>) {
        let oldest = now - self.span();
        let mut windows = self.windows();
        for window in windows.values_mut() {
            window.retain(|e| e.received_at >= oldest);
        }
        windows.retain(|_, w| !w.is_empty());
    }

    /// Forget every buffered message, e.g. when forwarding resumes after a
    /// pause and the windows no longer reflect the channels.
    pub fn clear(&self) {
        let mut windows = self.windows();
        let dropped: usize = windows.values().map(VecDeque::len).sum();
        windows.clear();
        debug!("Context windows cleared ({dropped} message(s) dropped)");
    }

    #[must_use]
    pub fn len(&self, channel: ChannelId) -> usize {
        self.windows().get(&channel).map_or(0, VecDeque::len)
    }
}

fn complement_in(entry: &WindowEntry, candidate: &CandidateExtraction) -> Option<Complement> {
    entry
        .candidates
        .iter()
        .find(|c| candidate.is_complemented_by(c))
        .map(|c| Complement {
            message_id: entry.message_id,
            candidate: c.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardrelay_core::{ProviderTag, UnitValue};
    use chrono::TimeZone;

    const CHANNEL: ChannelId = -1001;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, minute, 0)
            .single()
            .unwrap_or_default()
    }

    fn msg(id: MessageId, minute: u32) -> RawMessage {
        RawMessage::new(CHANNEL, id, format!("message {id}"), t(minute))
    }

    fn card() -> CandidateExtraction {
        CandidateExtraction::new(
            "we_keyword",
            Some("111122223333".to_string()),
            Some(ProviderTag::new("we")),
            None,
        )
    }

    fn units(n: u32) -> CandidateExtraction {
        CandidateExtraction::unit_only("labeled_unit", UnitValue::high(n))
    }

    #[test]
    fn finds_closest_earlier_complement() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[units(10)]);
        correlator.record(&msg(2, 1), &[units(20)]);
        correlator.record(&msg(3, 2), &[card()]);

        let found = correlator.find_complement(&msg(3, 2), &card());
        assert_eq!(found.map(|c| c.message_id), Some(2));
    }

    #[test]
    fn unit_post_finds_earlier_card() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[card()]);
        correlator.record(&msg(2, 2), &[units(20)]);

        let found = correlator.find_complement(&msg(2, 2), &units(20));
        assert_eq!(found.map(|c| c.candidate), Some(card()));
    }

    #[test]
    fn reply_target_beats_closer_message() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        let other = CandidateExtraction::new(
            "we_keyword",
            Some("444455556666".to_string()),
            Some(ProviderTag::new("we")),
            None,
        );
        correlator.record(&msg(1, 0), &[card()]);
        correlator.record(&msg(2, 1), &[other]);
        let reply = msg(3, 2).replying_to(1);
        correlator.record(&reply, &[units(50)]);

        let found = correlator.find_complement(&reply, &units(50));
        assert_eq!(found.map(|c| c.message_id), Some(1));
        let plain = correlator.find_complement(&msg(3, 2), &units(50));
        assert_eq!(plain.map(|c| c.message_id), Some(2));
    }

    #[test]
    fn respects_span_and_channel() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[units(20)]);
        correlator.record(&msg(2, 11), &[card()]);
        assert!(correlator.find_complement(&msg(2, 11), &card()).is_none());

        let elsewhere = RawMessage::new(-42, 2, "", t(11));
        assert!(correlator.find_complement(&elsewhere, &card()).is_none());
    }

    #[test]
    fn conflicting_provider_is_not_a_complement() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        let orange_units = CandidateExtraction::new(
            "orange_sharing",
            None,
            Some(ProviderTag::new("orange")),
            Some(UnitValue::high(250)),
        );
        correlator.record(&msg(1, 0), &[orange_units]);
        correlator.record(&msg(2, 1), &[card()]);
        assert!(correlator.find_complement(&msg(2, 1), &card()).is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let correlator = ContextCorrelator::new(ContextConfig {
            capacity: 2,
            span_secs: 600,
        });
        correlator.record(&msg(1, 0), &[units(20)]);
        correlator.record(&msg(2, 1), &[]);
        correlator.record(&msg(3, 2), &[card()]);
        assert_eq!(correlator.len(CHANNEL), 2);
        assert!(correlator.find_complement(&msg(3, 2), &card()).is_none());
    }

    #[test]
    fn replay_replaces_entry() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[units(20)]);
        correlator.mark_consumed(CHANNEL, 1);
        correlator.record(&msg(1, 0), &[units(20)]);
        assert_eq!(correlator.len(CHANNEL), 1);
        assert!(correlator.find_complement(&msg(2, 1), &card()).is_none());
    }

    #[test]
    fn around_prefers_replies() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 5), &[card()]);
        correlator.record(&msg(2, 6), &[units(20)]);
        correlator.record(&msg(3, 8).replying_to(1), &[units(30)]);

        let found = correlator.find_around(&msg(1, 5), &card());
        assert_eq!(found.map(|c| c.message_id), Some(3));
    }

    #[test]
    fn around_searches_both_sides() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 4), &[units(20)]);
        correlator.record(&msg(2, 5), &[card()]);
        correlator.record(&msg(3, 9), &[units(30)]);

        let found = correlator.find_around(&msg(2, 5), &card());
        assert_eq!(found.map(|c| c.message_id), Some(1));
    }

    #[test]
    fn around_works_after_origin_is_pruned() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[card()]);
        correlator.record(&msg(2, 11).replying_to(1), &[units(40)]);
        correlator.prune(t(12));
        assert!(correlator.message(CHANNEL, 1).is_none());

        let found = correlator.find_around(&msg(1, 0), &card());
        assert_eq!(found.map(|c| c.message_id), Some(2));
        assert_eq!(
            correlator.context_text(&msg(1, 0)).as_deref(),
            Some("message 2")
        );
    }

    #[test]
    fn prune_and_clear() {
        let correlator = ContextCorrelator::new(ContextConfig::default());
        correlator.record(&msg(1, 0), &[]);
        correlator.record(&msg(2, 30), &[]);
        correlator.prune(t(35));
        assert_eq!(correlator.len(CHANNEL), 1);
        assert_eq!(correlator.message(CHANNEL, 2), Some(msg(2, 30)));
        correlator.clear();
        assert_eq!(correlator.len(CHANNEL), 0);
    }
}
