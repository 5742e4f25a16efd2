mod repository;
mod types;

pub use repository::{AmendOutcome, ForwardStore, StoreStats};
pub use types::{
    CandidateExtraction, CardEvent, ChannelId, Completeness, Confidence, Fingerprint,
    ForwardedRecord, MessageId, ProviderTag, RawMessage, UnitKind, UnitValue,
};
