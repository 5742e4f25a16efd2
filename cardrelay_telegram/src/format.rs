//! Destination message layout.

use cardrelay_core::{AmendAction, CardEvent, Confidence, ProviderTag, UnitKind, UnitValue};
use cardrelay_extract::{ExtractionConfig, RuleSetDef};
use chrono::NaiveDate;

/// WE cards are posted with a fixed charge count instead of units.
const WE_CHARGES: u32 = 5;

/// Renders card events with the provider's display name and dial code.
#[derive(Debug, Clone)]
pub struct CardFormatter {
    rule_sets: Vec<RuleSetDef>,
}

impl CardFormatter {
    #[must_use]
    pub fn new(extraction: &ExtractionConfig) -> Self {
        Self {
            rule_sets: extraction.rule_sets.clone(),
        }
    }

    #[must_use]
    pub fn render_event(&self, event: &CardEvent) -> String {
        self.render(
            &event.provider,
            event.card_number.as_deref(),
            event.unit.as_ref(),
            event.card_date,
        )
    }

    #[must_use]
    pub fn render_amendment(&self, action: &AmendAction) -> String {
        self.render(
            &action.provider,
            action.card_number.as_deref(),
            Some(&action.new_unit_value),
            action.card_date,
        )
    }

    #[must_use]
    pub fn render(
        &self,
        provider: &ProviderTag,
        card_number: Option<&str>,
        unit: Option<&UnitValue>,
        card_date: NaiveDate,
    ) -> String {
        let rule_set = self
            .rule_sets
            .iter()
            .find(|set| ProviderTag::new(&set.provider) == *provider);
        let name = rule_set.map_or_else(|| "Unknown".to_string(), |set| set.display_name.clone());
        let code = match (card_number, rule_set) {
            (Some(digits), Some(set)) => set.dial_code(digits),
            (Some(digits), None) => digits.to_string(),
            (None, _) => "Unknown".to_string(),
        };

        let title = match emoji(provider) {
            Some(icon) => format!("▂▂▂ {icon} {name} Card {icon} ▂▂▂"),
            None => format!("▂▂▂ {name} Card ▂▂▂"),
        };

        format!(
            "{title}\n\n✅ Code: {code}\n\n{}\n\n📅 Card Date: {}\n",
            units_line(provider, unit),
            card_date.format("%Y-%m-%d")
        )
    }
}

fn emoji(provider: &ProviderTag) -> Option<&'static str> {
    match provider.as_str() {
        "vodafone" => Some("🔴"),
        "we" => Some("🟣"),
        "orange" => Some("🟠"),
        _ => None,
    }
}

fn units_line(provider: &ProviderTag, unit: Option<&UnitValue>) -> String {
    if provider.as_str() == "we" {
        return format!("🔄 Charges: {WE_CHARGES}");
    }
    let Some(unit) = unit else {
        return "📶 Units: Unknown".to_string();
    };
    let amount = match unit.kind {
        UnitKind::Units => unit.amount.to_string(),
        UnitKind::Megabytes => format!("{} MB", unit.amount),
    };
    if unit.confidence < Confidence::High {
        format!("📶 Units: {amount} (unconfirmed)")
    } else {
        format!("📶 Units: {amount}")
    }
}
