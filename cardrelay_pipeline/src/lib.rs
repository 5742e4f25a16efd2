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
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod correlator;
pub mod dispatcher;
pub mod fallback;
pub mod scheduler;

pub use correlator::{Complement, ContextConfig, ContextCorrelator};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, PartialPolicy, PipelineConfig, PolicyConfig, SuppressReason,
    ValidationOutcome,
};
pub use fallback::Fallback;
pub use scheduler::{ArmOutcome, RetryOutcome, ValidationConfig, ValidationScheduler, ValidationTask};
