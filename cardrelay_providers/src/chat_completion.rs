use async_trait::async_trait;
use cardrelay_core::{CandidateExtraction, FallbackExtractor, UnitValue, retry_if};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FallbackError, Result};

/// Rule id reported on candidates produced by this extractor.
pub const RULE_ID: &str = "chat_completion";

/// Longest slice of message text put into the prompt.
const MAX_PROMPT_CHARS: usize = 1000;

/// Fallback extractor backed by an OpenAI-compatible chat completion API.
pub struct ChatCompletionExtractor {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    min_units: u32,
    max_units: u32,
    retry_delays: Vec<Duration>,
}

impl ChatCompletionExtractor {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    #[must_use]
    pub fn new(api_key: String) -> Self {
        info!("Creating ChatCompletionExtractor");
        Self {
            client: Client::new(),
            api_key,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            min_units: 50,
            max_units: 15000,
            retry_delays: vec![Duration::from_secs(1)],
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    /// Answers outside `min..=max` are discarded.
    #[must_use]
    pub const fn with_range(mut self, min: u32, max: u32) -> Self {
        self.min_units = min;
        self.max_units = max;
        self
    }

    #[must_use]
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    fn prompt(&self, text: &str, context: Option<&str>) -> String {
        let message: String = text.chars().take(MAX_PROMPT_CHARS).collect();
        let mut prompt = format!(
            "Extract the units value of the recharge card in this message:\n\n{message}\n\n"
        );
        if let Some(context) = context {
            let context: String = context.chars().take(MAX_PROMPT_CHARS).collect();
            prompt.push_str(&format!("Nearby messages from the same channel:\n\n{context}\n\n"));
        }
        prompt.push_str(&format!(
            "Units are numbers between {} and {}, often labeled 'وحدة', 'وحده', 'وحدات', 'unit' or 'value'.\n\
             For Vodafone sharing (\"ليك يعني X وحدة Y ضعف تبعتهم لZ\") compute base units times multiplier divided by friends.\n\
             For Orange sharing (\"ابعت X ميجا ل Y\") compute X divided by Y.\n\
             For direct Vodafone units (\"معاك X وحدة من كارت فودافون\") compute X * 5 / 50.\n\n\
             Return ONLY the numeric value or 'Unknown'. No explanations.",
            self.min_units, self.max_units
        ));
        prompt
    }

    /// Helper method to send a single request
    async fn try_send(&self, request: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(FallbackError::RateLimited(self.base_url.clone()));
        }

        let body = response
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FallbackError::Format("missing content".to_string()))
    }
}

#[async_trait]
impl FallbackExtractor for ChatCompletionExtractor {
    async fn extract(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> anyhow::Result<Option<CandidateExtraction>> {
        let request = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": self.prompt(text, context) }],
            "temperature": 0,
        });

        debug!("Sending fallback request: model={}", self.model);
        let answer = retry_if(
            || self.try_send(&request),
            &self.retry_delays,
            FallbackError::is_retryable,
        )
        .await?;

        let Some(amount) = parse_answer(&answer, self.min_units, self.max_units) else {
            debug!("Fallback answer not usable: {:?}", answer.trim());
            return Ok(None);
        };
        info!("Fallback returned {amount} units");
        Ok(Some(CandidateExtraction::unit_only(
            RULE_ID,
            UnitValue::low(amount),
        )))
    }

    fn name(&self) -> &str {
        RULE_ID
    }
}

/// Remove a surrounding code fence and stray backticks.
fn strip_fences(raw: &str) -> &str {
    let mut answer = raw.trim();
    if let Some(rest) = answer.strip_prefix("```") {
        // Drop the language tag line if there is one.
        let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
        answer = body.strip_suffix("```").unwrap_or(body);
    }
    answer.trim().trim_matches('`').trim()
}

/// A plain number (optionally with thousands commas or a zero-able decimal
/// part) inside `min..=max`. Anything else is "no information".
#[must_use]
pub fn parse_answer(raw: &str, min: u32, max: u32) -> Option<u32> {
    let answer = strip_fences(raw).replace(',', "");
    let (whole, fraction) = answer.split_once('.').unwrap_or((answer.as_str(), ""));
    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !digits_only(whole) || !digits_only(fraction) {
        return None;
    }
    let amount: u32 = whole.parse().ok()?;
    (min..=max).contains(&amount).then_some(amount)
}
