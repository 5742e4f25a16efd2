use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Completeness, Fingerprint, ForwardedRecord, MessageId, UnitValue};
use crate::error::StoreError;

/// Result of an amendment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmendOutcome {
    /// The record took the new value.
    Applied(ForwardedRecord),
    /// The new value would not upgrade the record; it is returned unchanged.
    Stale(ForwardedRecord),
}

impl AmendOutcome {
    #[must_use]
    pub const fn record(&self) -> &ForwardedRecord {
        match self {
            Self::Applied(record) | Self::Stale(record) => record,
        }
    }

    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: u64,
    pub complete: u64,
    pub partial: u64,
    pub provisional: u64,
}

/// Durable fingerprint table that gatekeeps forwarding.
///
/// Every operation is atomic per fingerprint. `create` is the check-and-set:
/// two concurrent creates of the same fingerprint produce exactly one
/// `Ok(())` and one [`StoreError::Conflict`].
#[async_trait]
pub trait ForwardStore: Send + Sync {
    async fn lookup(&self, fingerprint: &Fingerprint)
    -> Result<Option<ForwardedRecord>, StoreError>;

    async fn create(&self, record: &ForwardedRecord) -> Result<(), StoreError>;

    /// Update unit value and completeness in place. Never downgrades.
    async fn amend(
        &self,
        fingerprint: &Fingerprint,
        unit: UnitValue,
        completeness: Completeness,
        at: DateTime<Utc>,
    ) -> Result<AmendOutcome, StoreError>;

    /// Attach the destination message id to a provisional record.
    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        forwarded_message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// Drop a provisional record after a failed forward. Confirmed records are
    /// left alone.
    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
