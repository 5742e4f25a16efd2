#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod card;
pub mod clock;
pub mod error;
pub mod retry;
pub mod util;

pub use card::{
    AmendOutcome, CandidateExtraction, CardEvent, ChannelId, Completeness, Confidence,
    Fingerprint, ForwardStore, ForwardedRecord, MessageId, ProviderTag, RawMessage, StoreStats,
    UnitKind, UnitValue,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use retry::retry_if;

/// A brand new card event to be sent to the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardAction {
    pub event: CardEvent,
}

/// An in-place update of a message that was already forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendAction {
    pub fingerprint: Fingerprint,
    pub forwarded_message_id: MessageId,
    pub new_unit_value: UnitValue,
    /// Carried so text destinations can re-render the whole message.
    pub provider: ProviderTag,
    pub card_number: Option<String>,
    pub card_date: NaiveDate,
    pub amended_at: DateTime<Utc>,
}

/// Outbound side of the pipeline: sends and edits messages at the destination.
///
/// A forward only counts once `forward` returns the destination message id;
/// until then the store record stays provisional.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn forward(&self, action: &ForwardAction) -> anyhow::Result<MessageId>;

    async fn amend(&self, action: &AmendAction) -> anyhow::Result<()>;
}

/// Optional last-resort extractor (typically an LLM call).
///
/// `Ok(None)` means "no additional information". Callers bound the latency and
/// treat errors the same as `Ok(None)`.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> anyhow::Result<Option<CandidateExtraction>>;

    fn name(&self) -> &str;
}
