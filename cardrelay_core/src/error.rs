use thiserror::Error;

use crate::card::Fingerprint;

/// Failures of the dedup and persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `create` on a fingerprint that already exists. Resolve with
    /// `lookup` + `amend`; retrying `create` is never correct.
    #[error("fingerprint already recorded: {0}")]
    Conflict(Fingerprint),

    /// `amend`/`confirm` on a fingerprint with no record.
    #[error("no forwarded record for fingerprint: {0}")]
    NotFound(Fingerprint),

    /// Stored data could not be decoded.
    #[error("corrupt record for fingerprint {0}: {1}")]
    Corrupt(Fingerprint, String),

    /// I/O or backend failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(anyhow::Error),
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
