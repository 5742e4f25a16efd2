//! Declarative provider and unit rules.
//!
//! Rules are plain data so they can live in the configuration file; adding a
//! provider means adding a [`RuleSetDef`], not writing code.

use cardrelay_core::{Confidence, ProviderTag, UnitKind};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::units;

/// Error type for rule building.
#[derive(Debug)]
pub enum BuildError {
    /// The regex pattern is invalid.
    Regex(String),

    /// A card pattern has no `card` capture group.
    MissingCardGroup(String),

    /// A unit pattern has fewer capture groups than its formula reads.
    MissingUnitGroups { rule: String, needed: usize },

    /// The plausible unit range is empty.
    EmptyRange { min: u32, max: u32 },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regex(e) => write!(f, "invalid regex: {e}"),
            Self::MissingCardGroup(id) => write!(f, "card rule {id} has no `card` group"),
            Self::MissingUnitGroups { rule, needed } => {
                write!(f, "unit rule {rule} needs {needed} capture groups")
            }
            Self::EmptyRange { min, max } => write!(f, "empty unit range {min}..={max}"),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<regex::Error> for BuildError {
    fn from(err: regex::Error) -> Self {
        Self::Regex(err.to_string())
    }
}

/// Card number shapes accepted after a provider keyword: dashed or spaced
/// groups, or one long digit run.
const CARD_SHAPE: &str = r"\d{4}(?:[ -]\d{4}){2,4}|\d{2,6}(?:-\d{2,6}){2,5}|\d{10,19}";

/// Amount shapes accepted by labeled unit rules.
const AMOUNT_SHAPE: &str = r"\d{1,3}(?:,\d{3})+|\d{1,6}";

/// All rules for one provider, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetDef {
    /// Provider tag, e.g. `vodafone`.
    pub provider: String,

    /// Name shown at the destination, e.g. `Vodafone`.
    pub display_name: String,

    /// Dial code template; `{digits}` is replaced by the card number.
    pub dial_template: String,

    pub card_rules: Vec<CardRuleDef>,
}

/// How a card number is recognised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CardRuleDef {
    /// Regex with a named `card` group. Separators inside the group are
    /// stripped before the digit count is checked.
    Pattern {
        id: String,
        pattern: String,
        #[serde(default = "CardRuleDef::default_min_digits")]
        min_digits: usize,
        #[serde(default = "CardRuleDef::default_max_digits")]
        max_digits: usize,
    },
    /// A bare run of exactly `length` digits. Evaluated only after every
    /// `pattern` rule of every provider has failed.
    DigitLength { id: String, length: usize },
}

impl CardRuleDef {
    const fn default_min_digits() -> usize {
        10
    }

    const fn default_max_digits() -> usize {
        19
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Pattern { id, .. } | Self::DigitLength { id, .. } => id,
        }
    }
}

/// Where a unit rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitScope {
    /// Against the whole message, before any line rule.
    Message,
    /// Against the card line and its neighbours.
    #[default]
    Line,
}

/// How the captured numbers turn into a unit amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UnitFormula {
    /// `$1`
    Capture,
    /// `$1 / $2`, e.g. megabytes shared between friends.
    Divide,
    /// `$1 * multiply / divide`
    Scale { multiply: u32, divide: u32 },
    /// `($2 / $1) * ($3 / $4)`: base unit times the per-friend multiplier.
    Share,
}

impl UnitFormula {
    const fn groups(self) -> usize {
        match self {
            Self::Capture | Self::Scale { .. } => 1,
            Self::Divide => 2,
            Self::Share => 4,
        }
    }

    /// Evaluate against parsed capture values. `None` on division by zero,
    /// overflow or a zero result.
    #[must_use]
    pub fn evaluate(self, values: &[u32]) -> Option<u32> {
        let amount = match (self, values) {
            (Self::Capture, [v, ..]) => Some(*v),
            (Self::Divide, [total, parts, ..]) => total.checked_div(*parts),
            (Self::Scale { multiply, divide }, [v, ..]) => {
                v.checked_mul(multiply).and_then(|n| n.checked_div(divide))
            }
            (Self::Share, [mult, units, friends_mult, friends, ..]) => {
                let base = units.checked_div(*mult)?;
                friends_mult.checked_div(*friends)?.checked_mul(base)
            }
            _ => None,
        }?;
        (amount > 0).then_some(amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRuleDef {
    pub id: String,
    pub pattern: String,
    pub formula: UnitFormula,
    #[serde(default)]
    pub scope: UnitScope,
    #[serde(default)]
    pub kind: UnitKind,
    #[serde(default = "UnitRuleDef::default_confidence")]
    pub confidence: Confidence,
}

impl UnitRuleDef {
    const fn default_confidence() -> Confidence {
        Confidence::High
    }
}

/// Plausible range for unlabeled numbers that might be unit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRange {
    pub min: u32,
    pub max: u32,
}

impl Default for UnitRange {
    fn default() -> Self {
        Self { min: 50, max: 15000 }
    }
}

impl UnitRange {
    #[must_use]
    pub const fn contains(&self, amount: u32) -> bool {
        amount >= self.min && amount <= self.max
    }
}

#[derive(Debug)]
pub(crate) struct CompiledCardRule {
    pub id: String,
    pub regex: Regex,
    pub min_digits: usize,
    pub max_digits: usize,
    pub bare_digits: bool,
}

#[derive(Debug)]
pub(crate) struct CompiledRuleSet {
    pub provider: ProviderTag,
    pub rules: Vec<CompiledCardRule>,
}

#[derive(Debug)]
pub(crate) struct CompiledUnitRule {
    pub id: String,
    pub regex: Regex,
    pub formula: UnitFormula,
    pub scope: UnitScope,
    pub kind: UnitKind,
    pub confidence: Confidence,
}

impl CompiledUnitRule {
    /// First match in `text`, evaluated.
    pub fn apply(&self, text: &str) -> Option<u32> {
        self.regex.captures_iter(text).find_map(|caps| {
            let values = (1..=self.formula.groups())
                .map(|i| caps.get(i).and_then(|m| units::parse_amount(m.as_str())))
                .collect::<Option<Vec<_>>>()?;
            self.formula.evaluate(&values)
        })
    }
}

impl RuleSetDef {
    pub(crate) fn build(&self) -> Result<CompiledRuleSet, BuildError> {
        let rules = self
            .card_rules
            .iter()
            .map(|rule| match rule {
                CardRuleDef::Pattern {
                    id,
                    pattern,
                    min_digits,
                    max_digits,
                } => {
                    let regex = Regex::new(pattern)?;
                    if !regex.capture_names().flatten().any(|name| name == "card") {
                        return Err(BuildError::MissingCardGroup(id.clone()));
                    }
                    Ok(CompiledCardRule {
                        id: id.clone(),
                        regex,
                        min_digits: *min_digits,
                        max_digits: *max_digits,
                        bare_digits: false,
                    })
                }
                CardRuleDef::DigitLength { id, length } => Ok(CompiledCardRule {
                    id: id.clone(),
                    regex: Regex::new(&format!(r"(?:^|[^\d*#])(?P<card>\d{{{length}}})(?:$|[^\d*#])"))?,
                    min_digits: *length,
                    max_digits: *length,
                    bare_digits: true,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledRuleSet {
            provider: ProviderTag::new(&self.provider),
            rules,
        })
    }

    /// Render a card number with this provider's dial template.
    #[must_use]
    pub fn dial_code(&self, digits: &str) -> String {
        self.dial_template.replace("{digits}", digits)
    }
}

impl UnitRuleDef {
    pub(crate) fn build(&self) -> Result<CompiledUnitRule, BuildError> {
        let regex = Regex::new(&self.pattern)?;
        let needed = self.formula.groups();
        if regex.captures_len() <= needed {
            return Err(BuildError::MissingUnitGroups {
                rule: self.id.clone(),
                needed,
            });
        }
        Ok(CompiledUnitRule {
            id: self.id.clone(),
            regex,
            formula: self.formula,
            scope: self.scope,
            kind: self.kind,
            confidence: self.confidence,
        })
    }
}

fn pattern_rule(id: &str, pattern: &str) -> CardRuleDef {
    CardRuleDef::Pattern {
        id: id.to_string(),
        pattern: pattern.to_string(),
        min_digits: CardRuleDef::default_min_digits(),
        max_digits: CardRuleDef::default_max_digits(),
    }
}

fn keyword_rule(id: &str, keyword: &str) -> CardRuleDef {
    pattern_rule(id, &format!(r"(?i){keyword}[^\d\n]{{0,20}}(?P<card>{CARD_SHAPE})"))
}

/// Default provider rule sets, most specific providers first.
#[must_use]
pub fn default_rule_sets() -> Vec<RuleSetDef> {
    vec![
        RuleSetDef {
            provider: "vodafone".to_string(),
            display_name: "Vodafone".to_string(),
            dial_template: "*858*{digits}#".to_string(),
            card_rules: vec![
                pattern_rule("vodafone_ussd", r"\*858\*(?P<card>\d{13})#"),
                pattern_rule("vodafone_embedded", r"#(?P<card>\d{10,19})\*858\*"),
                keyword_rule("vodafone_keyword", r"(?:\bvodafone\b|فودافون)"),
                CardRuleDef::DigitLength {
                    id: "vodafone_raw13".to_string(),
                    length: 13,
                },
            ],
        },
        RuleSetDef {
            provider: "we".to_string(),
            display_name: "WE".to_string(),
            dial_template: "*015*{digits}#".to_string(),
            card_rules: vec![
                pattern_rule("we_ussd", r"\*015\*(?P<card>\d{15})#"),
                keyword_rule("we_keyword", r"\bwe\s+(?:card|كارت)"),
                CardRuleDef::DigitLength {
                    id: "we_raw15".to_string(),
                    length: 15,
                },
            ],
        },
        RuleSetDef {
            provider: "orange".to_string(),
            display_name: "Orange".to_string(),
            dial_template: "*10*{digits}#".to_string(),
            card_rules: vec![
                pattern_rule("orange_ussd", r"\*10\*(?P<card>\d{13})#"),
                pattern_rule("orange_hash", r"#10\*(?P<card>\d{10,19})#"),
                keyword_rule("orange_keyword", r"(?:\borange\b|اورنج|أورنج)"),
            ],
        },
    ]
}

/// Default unit rules: sharing formulas first, then labeled amounts.
#[must_use]
pub fn default_unit_rules() -> Vec<UnitRuleDef> {
    let rule = |id: &str, pattern: String, formula, scope, kind| UnitRuleDef {
        id: id.to_string(),
        pattern,
        formula,
        scope,
        kind,
        confidence: Confidence::High,
    };
    vec![
        rule(
            "orange_sharing",
            r"ابعت\s+(\d+)\s+ميجا\s+ل\s*(\d+)".to_string(),
            UnitFormula::Divide,
            UnitScope::Message,
            UnitKind::Megabytes,
        ),
        rule(
            "vodafone_sharing",
            r"(\d+)\s+ليك\s+يعني\s+(\d+)\s+وحدة\s+(\d+)\s+ضعف\s+تبعتهم\s+ل\s*(\d+)".to_string(),
            UnitFormula::Share,
            UnitScope::Message,
            UnitKind::Units,
        ),
        rule(
            "vodafone_direct",
            r"معاك\s+(\d+)\s+وحدة\s+من\s+كارت\s+فودافون".to_string(),
            UnitFormula::Scale {
                multiply: 5,
                divide: 50,
            },
            UnitScope::Message,
            UnitKind::Units,
        ),
        rule(
            "labeled_prefix",
            format!(r"(?i)(?:\bunits?\b|\bvalue\b|وحدة|وحده|وحدات|قيمة|قيمه)\s*:?\s*({AMOUNT_SHAPE})\b"),
            UnitFormula::Capture,
            UnitScope::Line,
            UnitKind::Units,
        ),
        rule(
            "labeled_suffix",
            format!(r"(?i)\b({AMOUNT_SHAPE})\s*(?:units?\b|وحدة|وحده|وحدات)"),
            UnitFormula::Capture,
            UnitScope::Line,
            UnitKind::Units,
        ),
        rule(
            "megabytes_suffix",
            format!(r"(?i)\b({AMOUNT_SHAPE})\s*(?:ميجا|mb\b|megabytes?\b)"),
            UnitFormula::Capture,
            UnitScope::Line,
            UnitKind::Megabytes,
        ),
    ]
}

/// Messages matching any of these are never card posts.
#[must_use]
pub fn default_ignore_patterns() -> Vec<String> {
    vec![r"(?i)(طلب انضمام|اضغط للانضمام|join request|انضم للقناة|دوس طلب انضمام)".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn default_rules_build() {
        for set in default_rule_sets() {
            set.build().expect("default rule set should build");
        }
        for rule in default_unit_rules() {
            rule.build().expect("default unit rule should build");
        }
    }

    #[test]
    fn card_rule_without_group_is_rejected() {
        let set = RuleSetDef {
            provider: "x".to_string(),
            display_name: "X".to_string(),
            dial_template: "{digits}".to_string(),
            card_rules: vec![pattern_rule("bad", r"\d{13}")],
        };
        assert!(matches!(set.build(), Err(BuildError::MissingCardGroup(id)) if id == "bad"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let rule = UnitRuleDef {
            id: "broken".to_string(),
            pattern: "(".to_string(),
            formula: UnitFormula::Capture,
            scope: UnitScope::Line,
            kind: UnitKind::Units,
            confidence: Confidence::High,
        };
        assert!(matches!(rule.build(), Err(BuildError::Regex(_))));
    }

    #[test]
    fn formulas_evaluate() {
        assert_eq!(UnitFormula::Capture.evaluate(&[50]), Some(50));
        assert_eq!(UnitFormula::Divide.evaluate(&[1000, 4]), Some(250));
        assert_eq!(UnitFormula::Divide.evaluate(&[1000, 0]), None);
        assert_eq!(
            UnitFormula::Scale {
                multiply: 5,
                divide: 50
            }
            .evaluate(&[500]),
            Some(50)
        );
        // 2x gives 100 units, so base is 50; 6x shared by 3 friends is 2x each.
        assert_eq!(UnitFormula::Share.evaluate(&[2, 100, 6, 3]), Some(100));
    }

    #[test]
    #[expect(clippy::expect_used, reason = "Test failure should panic with context")]
    fn rule_sets_round_trip_through_json() {
        let json = serde_json::to_string(&default_rule_sets()).expect("rules should serialize");
        let parsed: Vec<RuleSetDef> =
            serde_json::from_str(&json).expect("valid JSON should deserialize");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].dial_code("123"), "*858*123#");
    }
}
