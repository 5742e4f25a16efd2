use cardrelay_config::Config;
use cardrelay_core::{CandidateExtraction, CardEvent, RawMessage};
use cardrelay_extract::{ExtractionConfig, PatternExtractor, normalize};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

/// Input for the extract command.
pub struct ExtractInput {
    /// Message text; stdin when `None`
    pub text: Option<String>,
}

#[derive(Serialize)]
struct Finding {
    candidate: CandidateExtraction,
    #[serde(skip_serializing_if = "Option::is_none")]
    dial_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<CardEvent>,
}

/// Strategy for dry-running the extractor on one message.
///
/// Uses the configured rules when a config file exists, the built-in ones
/// otherwise. Nothing is stored or forwarded.
#[derive(Debug, Clone, Copy)]
pub struct ExtractStrategy;

impl super::CommandStrategy for ExtractStrategy {
    type Input = ExtractInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let extraction = match Config::load() {
            Ok(config) => config.extraction,
            Err(e) => {
                debug!("Using built-in rules: {e}");
                ExtractionConfig::default()
            }
        };
        let extractor = PatternExtractor::new(&extraction)?;

        let text = input
            .text
            .map_or_else(|| std::io::read_to_string(std::io::stdin()), Ok)?;
        let message = RawMessage::new(0, 0, text, Utc::now());

        let findings: Vec<Finding> = extractor
            .extract(&message.text)
            .into_iter()
            .map(|candidate| {
                let dial_code = candidate.provider.as_ref().and_then(|provider| {
                    let digits = candidate.card_number.as_deref()?;
                    extraction
                        .rule_set(provider)
                        .map(|set| set.dial_code(digits))
                });
                let event = normalize(&candidate, &message, &[]);
                Finding {
                    candidate,
                    dial_code,
                    event,
                }
            })
            .collect();

        println!("{}", serde_json::to_string_pretty(&findings)?);
        Ok(())
    }
}
