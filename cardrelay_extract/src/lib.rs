#![warn(
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

pub mod engine;
pub mod normalizer;
pub mod rules;
pub mod units;

pub use engine::{ExtractionConfig, PatternExtractor};
pub use normalizer::normalize;
pub use rules::{
    BuildError, CardRuleDef, RuleSetDef, UnitFormula, UnitRange, UnitRuleDef, UnitScope,
    default_ignore_patterns, default_rule_sets, default_unit_rules,
};
