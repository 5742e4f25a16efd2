//! Pattern extraction engine.
//!
//! The engine applies the configured provider rule sets line by line and the
//! unit rules independently of them, producing zero or more
//! [`CandidateExtraction`]s per message. It holds no mutable state.

use cardrelay_core::util::normalize_digits;
use cardrelay_core::{CandidateExtraction, ProviderTag, UnitValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rules::{
    BuildError, CompiledRuleSet, CompiledUnitRule, RuleSetDef, UnitRange, UnitRuleDef, UnitScope,
    default_ignore_patterns, default_rule_sets, default_unit_rules,
};
use crate::units;

/// Rule id reported for a bare number posted on its own line.
pub const STANDALONE_RULE: &str = "standalone_number";

/// Configuration for the extraction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Provider rule sets in priority order.
    #[serde(default = "default_rule_sets")]
    pub rule_sets: Vec<RuleSetDef>,

    #[serde(default = "default_unit_rules")]
    pub unit_rules: Vec<UnitRuleDef>,

    /// Range accepted for unlabeled numbers.
    #[serde(default)]
    pub unit_range: UnitRange,

    /// Messages matching any of these are skipped entirely.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Lines above and below a card searched for its unit value.
    #[serde(default = "ExtractionConfig::default_neighbour_lines")]
    pub neighbour_lines: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            rule_sets: default_rule_sets(),
            unit_rules: default_unit_rules(),
            unit_range: UnitRange::default(),
            ignore_patterns: default_ignore_patterns(),
            neighbour_lines: Self::default_neighbour_lines(),
        }
    }
}

impl ExtractionConfig {
    const fn default_neighbour_lines() -> usize {
        2
    }

    /// Rule set for a provider tag, used to render dial codes.
    #[must_use]
    pub fn rule_set(&self, provider: &ProviderTag) -> Option<&RuleSetDef> {
        self.rule_sets
            .iter()
            .find(|set| ProviderTag::new(&set.provider) == *provider)
    }
}

struct CardMatch<'a> {
    provider: &'a ProviderTag,
    rule_id: &'a str,
    digits: String,
    /// Byte range of the whole rule match in the line.
    span: (usize, usize),
    bare: bool,
}

/// Stateless extractor compiled from an [`ExtractionConfig`].
#[derive(Debug)]
pub struct PatternExtractor {
    rule_sets: Vec<CompiledRuleSet>,
    unit_rules: Vec<CompiledUnitRule>,
    ignore: Vec<Regex>,
    standalone: Regex,
    loose: Regex,
    range: UnitRange,
    neighbour_lines: usize,
}

impl PatternExtractor {
    /// Compile an extractor.
    ///
    /// # Errors
    /// Returns an error if any rule fails to compile or the unit range is empty.
    pub fn new(config: &ExtractionConfig) -> Result<Self, BuildError> {
        if config.unit_range.min > config.unit_range.max {
            return Err(BuildError::EmptyRange {
                min: config.unit_range.min,
                max: config.unit_range.max,
            });
        }

        let rule_sets = config
            .rule_sets
            .iter()
            .map(RuleSetDef::build)
            .collect::<Result<Vec<_>, _>>()?;
        let unit_rules = config
            .unit_rules
            .iter()
            .map(UnitRuleDef::build)
            .collect::<Result<Vec<_>, _>>()?;
        let ignore = config
            .ignore_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rule_sets,
            unit_rules,
            ignore,
            standalone: Regex::new(r"^\s*(\d{1,3}(?:,\d{3})+|\d{2,6})\s*$")?,
            loose: Regex::new(r"\b(\d{2,6})\b")?,
            range: config.unit_range,
            neighbour_lines: config.neighbour_lines,
        })
    }

    /// Create an extractor with the built-in rules.
    ///
    /// # Errors
    /// Returns an error if the default rules fail to compile.
    pub fn with_defaults() -> Result<Self, BuildError> {
        Self::new(&ExtractionConfig::default())
    }

    /// Extract candidates from message text, most specific rule first.
    ///
    /// Text with no card content yields an empty vector.
    #[must_use]
    pub fn extract(&self, text: &str) -> Vec<CandidateExtraction> {
        if text.trim().is_empty() || self.ignore.iter().any(|re| re.is_match(text)) {
            return Vec::new();
        }

        let lines: Vec<&str> = text.lines().collect();
        let message_unit = self.message_unit(text);
        let mut found: Vec<(bool, CandidateExtraction)> = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            let Some(card) = self.match_card(line) else {
                continue;
            };
            let duplicate = found.iter().any(|(_, c)| {
                c.card_number.as_deref() == Some(card.digits.as_str())
                    && c.provider.as_ref() == Some(card.provider)
            });
            if duplicate {
                continue;
            }
            let unit = message_unit.or_else(|| self.unit_near(&lines, i, card.span));
            found.push((
                card.bare,
                CandidateExtraction::new(
                    card.rule_id,
                    Some(card.digits),
                    Some(card.provider.clone()),
                    unit,
                ),
            ));
        }

        if found.is_empty() {
            return self
                .standalone_unit(text, message_unit)
                .map(|(unit, rule)| vec![CandidateExtraction::unit_only(rule, unit)])
                .unwrap_or_default();
        }

        // Bare digit-run matches are the least specific.
        found.sort_by_key(|(bare, _)| *bare);
        found.into_iter().map(|(_, c)| c).collect()
    }

    fn match_card<'a>(&'a self, line: &str) -> Option<CardMatch<'a>> {
        // Pattern rules of every provider before any bare digit-run rule.
        for bare in [false, true] {
            let mut matches = self.rule_sets.iter().filter_map(|set| {
                set.rules
                    .iter()
                    .filter(|rule| rule.bare_digits == bare)
                    .find_map(|rule| {
                        rule.regex.captures_iter(line).find_map(|caps| {
                            let card = caps.name("card")?;
                            let whole = caps.get(0)?;
                            let digits = normalize_digits(card.as_str());
                            (digits.len() >= rule.min_digits && digits.len() <= rule.max_digits)
                                .then(|| CardMatch {
                                    provider: &set.provider,
                                    rule_id: &rule.id,
                                    digits,
                                    span: (whole.start(), whole.end()),
                                    bare,
                                })
                        })
                    })
            });

            if let Some(first) = matches.next() {
                if let Some(other) = matches.find(|m| m.provider != first.provider) {
                    debug!(
                        "ExtractionAmbiguous: line matches {} ({}) and {} ({}); keeping {}",
                        first.provider, first.rule_id, other.provider, other.rule_id, first.provider
                    );
                }
                return Some(first);
            }
        }
        None
    }

    fn message_unit(&self, text: &str) -> Option<UnitValue> {
        self.unit_rules
            .iter()
            .filter(|rule| rule.scope == UnitScope::Message)
            .find_map(|rule| {
                rule.apply(text).map(|amount| {
                    debug!("Unit rule {} matched: {amount}", rule.id);
                    unit_value(rule, amount)
                })
            })
    }

    fn labeled_unit(&self, line: &str) -> Option<UnitValue> {
        self.unit_rules
            .iter()
            .filter(|rule| rule.scope == UnitScope::Line)
            .find_map(|rule| rule.apply(line).map(|amount| unit_value(rule, amount)))
    }

    fn standalone_number(&self, line: &str) -> Option<UnitValue> {
        let caps = self.standalone.captures(line)?;
        let amount = units::parse_amount(caps.get(1)?.as_str())?;
        self.range.contains(amount).then(|| UnitValue::high(amount))
    }

    /// Unit for the card on `lines[index]`: labeled values closest first, then
    /// bare numbers on neighbouring lines, then loose numbers on the card line.
    fn unit_near(&self, lines: &[&str], index: usize, card_span: (usize, usize)) -> Option<UnitValue> {
        let lo = index.saturating_sub(self.neighbour_lines);
        let hi = (index + self.neighbour_lines + 1).min(lines.len());
        let mut order: Vec<usize> = (lo..hi).collect();
        order.sort_by_key(|j| j.abs_diff(index));

        let card_line = lines[index];
        let rest = format!("{} {}", &card_line[..card_span.0], &card_line[card_span.1..]);

        if let Some(unit) = self.labeled_unit(&rest) {
            return Some(unit);
        }
        for &j in order.iter().filter(|&&j| j != index) {
            if self.match_card(lines[j]).is_some() {
                continue;
            }
            if let Some(unit) = self.labeled_unit(lines[j]) {
                return Some(unit);
            }
        }
        for &j in order.iter().filter(|&&j| j != index) {
            if let Some(unit) = self.standalone_number(lines[j]) {
                return Some(unit);
            }
        }
        self.loose
            .captures_iter(&rest)
            .filter_map(|caps| units::parse_amount(caps.get(1)?.as_str()))
            .find(|amount| self.range.contains(*amount))
            .map(UnitValue::low)
    }

    fn standalone_unit(
        &self,
        text: &str,
        message_unit: Option<UnitValue>,
    ) -> Option<(UnitValue, &'static str)> {
        if let Some(unit) = message_unit {
            return Some((unit, "message_unit"));
        }
        if let Some(unit) = text.lines().find_map(|line| self.labeled_unit(line)) {
            return Some((unit, "labeled_unit"));
        }
        self.standalone_number(text.trim())
            .map(|unit| (unit, STANDALONE_RULE))
    }
}

fn unit_value(rule: &CompiledUnitRule, amount: u32) -> UnitValue {
    UnitValue {
        amount,
        kind: rule.kind,
        confidence: rule.confidence,
    }
}
