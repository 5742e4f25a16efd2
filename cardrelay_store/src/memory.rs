use async_trait::async_trait;
use cardrelay_core::{
    AmendOutcome, Completeness, Fingerprint, ForwardStore, ForwardedRecord, MessageId,
    StoreError, StoreStats, UnitValue,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process [`ForwardStore`] for tests and `--ephemeral` runs.
///
/// Forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Fingerprint, ForwardedRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Fingerprint, ForwardedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ForwardStore for MemoryStore {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ForwardedRecord>, StoreError> {
        Ok(self.records().get(fingerprint).cloned())
    }

    async fn create(&self, record: &ForwardedRecord) -> Result<(), StoreError> {
        let mut records = self.records();
        if records.contains_key(&record.fingerprint) {
            return Err(StoreError::Conflict(record.fingerprint.clone()));
        }
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn amend(
        &self,
        fingerprint: &Fingerprint,
        unit: UnitValue,
        completeness: Completeness,
        at: DateTime<Utc>,
    ) -> Result<AmendOutcome, StoreError> {
        let mut records = self.records();
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;
        if record.apply_amendment(unit, completeness, at) {
            Ok(AmendOutcome::Applied(record.clone()))
        } else {
            Ok(AmendOutcome::Stale(record.clone()))
        }
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        forwarded_message_id: MessageId,
    ) -> Result<(), StoreError> {
        let mut records = self.records();
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;
        record.forwarded_message_id = Some(forwarded_message_id);
        Ok(())
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let mut records = self.records();
        if records
            .get(fingerprint)
            .is_some_and(ForwardedRecord::is_provisional)
        {
            records.remove(fingerprint);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.records();
        let mut stats = StoreStats::default();
        for record in records.values() {
            stats.total += 1;
            match record.completeness {
                Completeness::Complete => stats.complete += 1,
                Completeness::Partial => stats.partial += 1,
            }
            if record.is_provisional() {
                stats.provisional += 1;
            }
        }
        Ok(stats)
    }
}
