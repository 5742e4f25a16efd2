use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::util;

pub type ChannelId = i64;
pub type MessageId = i32;

/// A message as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub text: String,
    pub received_at: DateTime<Utc>,
    /// Message this one replies to, if any.
    pub reply_to: Option<MessageId>,
}

impl RawMessage {
    #[must_use]
    pub fn new(
        channel_id: ChannelId,
        message_id: MessageId,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id,
            message_id,
            text: text.into(),
            received_at,
            reply_to: None,
        }
    }

    #[must_use]
    pub const fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Lower-cased provider tag such as `vodafone`. The set of providers is data
/// driven (it comes from the rule sets), so this is not a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProviderTag(String);

impl ProviderTag {
    pub const UNKNOWN: &'static str = "unknown";

    #[must_use]
    pub fn new(tag: &str) -> Self {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            Self::unknown()
        } else {
            Self(tag)
        }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProviderTag {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for ProviderTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<ProviderTag> for String {
    fn from(value: ProviderTag) -> Self {
        value.0
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confidence of an extraction or of a unit value. Ordered `None < Low < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Low,
    High,
}

impl Confidence {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            _ => Err(anyhow::anyhow!("unknown confidence: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    Units,
    Megabytes,
}

impl UnitKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Units => "units",
            Self::Megabytes => "megabytes",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnitKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "units" => Ok(Self::Units),
            "megabytes" => Ok(Self::Megabytes),
            _ => Err(anyhow::anyhow!("unknown unit kind: {s}")),
        }
    }
}

/// A normalized unit value attached to a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitValue {
    pub amount: u32,
    pub kind: UnitKind,
    pub confidence: Confidence,
}

impl UnitValue {
    #[must_use]
    pub const fn high(amount: u32) -> Self {
        Self {
            amount,
            kind: UnitKind::Units,
            confidence: Confidence::High,
        }
    }

    #[must_use]
    pub const fn low(amount: u32) -> Self {
        Self {
            amount,
            kind: UnitKind::Units,
            confidence: Confidence::Low,
        }
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: UnitKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether replacing `existing` with `self` is an allowed transition.
    ///
    /// Only `unknown -> known` and `low -> high` are upgrades; a value of the
    /// same confidence never replaces another.
    #[must_use]
    pub fn upgrades(&self, existing: Option<&Self>) -> bool {
        existing.is_none_or(|current| self.confidence > current.confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Partial,
    Complete,
}

impl Completeness {
    #[must_use]
    pub const fn classify(has_card: bool, has_provider: bool, has_unit: bool) -> Self {
        if has_card && has_provider && has_unit {
            Self::Complete
        } else {
            Self::Partial
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Completeness {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(Self::Partial),
            "complete" => Ok(Self::Complete),
            _ => Err(anyhow::anyhow!("unknown completeness: {s}")),
        }
    }
}

/// Fields pulled out of one message (or one line of it) by a single rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateExtraction {
    /// Digits only.
    pub card_number: Option<String>,
    pub provider: Option<ProviderTag>,
    pub unit: Option<UnitValue>,
    pub confidence: Confidence,
    pub rule_id: String,
}

impl CandidateExtraction {
    #[must_use]
    pub fn new(
        rule_id: impl Into<String>,
        card_number: Option<String>,
        provider: Option<ProviderTag>,
        unit: Option<UnitValue>,
    ) -> Self {
        let mut candidate = Self {
            card_number,
            provider,
            unit,
            confidence: Confidence::None,
            rule_id: rule_id.into(),
        };
        candidate.refresh_confidence();
        candidate
    }

    /// A unit value with no card attached, e.g. a standalone "units: 20" post.
    #[must_use]
    pub fn unit_only(rule_id: impl Into<String>, unit: UnitValue) -> Self {
        Self::new(rule_id, None, None, Some(unit))
    }

    #[must_use]
    pub fn has_known_provider(&self) -> bool {
        self.provider.as_ref().is_some_and(|p| !p.is_unknown())
    }

    #[must_use]
    pub const fn is_missing_unit(&self) -> bool {
        self.unit.is_none()
    }

    #[must_use]
    pub const fn is_missing_card(&self) -> bool {
        self.card_number.is_none()
    }

    /// High only when card, provider and unit are all present.
    pub fn refresh_confidence(&mut self) {
        let fields = [
            self.card_number.is_some(),
            self.has_known_provider(),
            self.unit.is_some(),
        ];
        self.confidence = if fields.iter().all(|f| *f) {
            Confidence::High
        } else if fields.iter().any(|f| *f) {
            Confidence::Low
        } else {
            Confidence::None
        };
    }

    /// Two extractions conflict when they disagree on a field both carry.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        let card_conflict = matches!(
            (&self.card_number, &other.card_number),
            (Some(a), Some(b)) if a != b
        );
        let provider_conflict = match (&self.provider, &other.provider) {
            (Some(a), Some(b)) => !a.is_unknown() && !b.is_unknown() && a != b,
            _ => false,
        };
        card_conflict || provider_conflict
    }

    /// Whether `other` fills a field this extraction is missing without
    /// contradicting anything it already has.
    #[must_use]
    pub fn is_complemented_by(&self, other: &Self) -> bool {
        if self.conflicts_with(other) {
            return false;
        }
        let fills_unit = self.unit.is_none() && other.unit.is_some() && other.card_number.is_none();
        let fills_card = self.card_number.is_none() && other.card_number.is_some() && other.unit.is_none();
        fills_unit || fills_card
    }

    /// Copy over whatever `other` has that this extraction lacks.
    pub fn absorb(&mut self, other: &Self) {
        if self.card_number.is_none() {
            self.card_number.clone_from(&other.card_number);
        }
        if !self.has_known_provider() && other.has_known_provider() {
            self.provider.clone_from(&other.provider);
        }
        if let Some(unit) = other.unit {
            if unit.upgrades(self.unit.as_ref()) {
                self.unit = Some(unit);
            }
        }
        self.refresh_confidence();
    }
}

/// Dedup key of a card event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key for a card with a known number. Formatting of `card_number` does not
    /// matter: only its digits are hashed.
    #[must_use]
    pub fn for_card(provider: &ProviderTag, card_number: &str) -> Self {
        let digits = util::normalize_digits(card_number);
        Self(util::fingerprint_hash("card", &[provider.as_str(), &digits]))
    }

    /// Key for an event without a card number. Such events never dedupe
    /// across messages.
    #[must_use]
    pub fn for_message(provider: &ProviderTag, channel: ChannelId, message: MessageId) -> Self {
        Self(util::fingerprint_hash(
            "message",
            &[provider.as_str(), &channel.to_string(), &message.to_string()],
        ))
    }

    /// Rehydrate a fingerprint read back from storage.
    #[must_use]
    pub const fn from_stored(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical card event produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEvent {
    pub fingerprint: Fingerprint,
    pub card_number: Option<String>,
    pub provider: ProviderTag,
    pub unit: Option<UnitValue>,
    pub card_date: NaiveDate,
    pub source_channel: ChannelId,
    /// Originating message first, then any correlated messages.
    pub message_ids: Vec<MessageId>,
    pub completeness: Completeness,
    pub first_seen: DateTime<Utc>,
}

impl CardEvent {
    /// Partial, or complete with a unit nobody is sure about.
    #[must_use]
    pub fn needs_validation(&self) -> bool {
        self.completeness == Completeness::Partial
            || self.unit.is_some_and(|u| u.confidence < Confidence::High)
    }

    /// Whether this event carries a unit value the stored record should take.
    #[must_use]
    pub fn upgrades(&self, record: &ForwardedRecord) -> bool {
        self.unit
            .is_some_and(|unit| unit.upgrades(record.unit.as_ref()))
    }

    #[must_use]
    pub fn origin_message(&self) -> Option<MessageId> {
        self.message_ids.first().copied()
    }
}

/// What the store remembers about a forwarded card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRecord {
    pub fingerprint: Fingerprint,
    pub card_number: Option<String>,
    pub provider: ProviderTag,
    pub unit: Option<UnitValue>,
    pub completeness: Completeness,
    /// `None` while the forward has not been confirmed by the publisher.
    pub forwarded_message_id: Option<MessageId>,
    pub source_channel: ChannelId,
    pub card_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub last_amended_at: Option<DateTime<Utc>>,
}

impl ForwardedRecord {
    #[must_use]
    pub fn provisional(event: &CardEvent, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: event.fingerprint.clone(),
            card_number: event.card_number.clone(),
            provider: event.provider.clone(),
            unit: event.unit,
            completeness: event.completeness,
            forwarded_message_id: None,
            source_channel: event.source_channel,
            card_date: event.card_date,
            created_at: now,
            last_amended_at: None,
        }
    }

    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        self.forwarded_message_id.is_none()
    }

    /// Complete with a high-confidence unit: nothing left to validate.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.completeness == Completeness::Complete
            && self.unit.is_some_and(|u| u.confidence == Confidence::High)
    }

    /// Apply an amendment if it is an upgrade. Returns whether anything changed.
    pub fn apply_amendment(
        &mut self,
        unit: UnitValue,
        completeness: Completeness,
        at: DateTime<Utc>,
    ) -> bool {
        if !unit.upgrades(self.unit.as_ref()) {
            return false;
        }
        self.unit = Some(unit);
        self.completeness = self.completeness.max(completeness);
        self.last_amended_at = Some(at);
        true
    }
}
