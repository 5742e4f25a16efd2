use cardrelay_core::{CandidateExtraction, FallbackExtractor};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// The fallback capability as seen by the dispatcher.
///
/// Every failure mode degrades to "no additional information".
pub enum Fallback {
    Disabled,
    Enabled {
        extractor: Arc<dyn FallbackExtractor>,
        timeout: Duration,
        cooldown: Duration,
        paused_until: Mutex<Option<DateTime<Utc>>>,
    },
}

impl Fallback {
    #[must_use]
    pub fn enabled(
        extractor: Arc<dyn FallbackExtractor>,
        timeout: Duration,
        cooldown: Duration,
    ) -> Self {
        Self::Enabled {
            extractor,
            timeout,
            cooldown,
            paused_until: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// Ask the extractor about `text`. `now` drives the failure cooldown.
    pub async fn extract(
        &self,
        text: &str,
        context: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<CandidateExtraction> {
        let Self::Enabled {
            extractor,
            timeout,
            cooldown,
            paused_until,
        } = self
        else {
            return None;
        };

        {
            let paused = paused_until.lock().unwrap_or_else(PoisonError::into_inner);
            if paused.is_some_and(|until| now < until) {
                debug!("Fallback {} cooling down, skipped", extractor.name());
                return None;
            }
        }

        let failure = match tokio::time::timeout(*timeout, extractor.extract(text, context)).await
        {
            Ok(Ok(result)) => {
                debug!(
                    "Fallback {} returned {}",
                    extractor.name(),
                    if result.is_some() { "a result" } else { "nothing" }
                );
                return result;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        warn!("FallbackUnavailable: {} {failure}", extractor.name());
        let until = chrono::Duration::from_std(*cooldown)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        *paused_until.lock().unwrap_or_else(PoisonError::into_inner) = until;
        None
    }
}

impl std::fmt::Debug for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Fallback::Disabled"),
            Self::Enabled {
                extractor, timeout, ..
            } => f
                .debug_struct("Fallback::Enabled")
                .field("extractor", &extractor.name())
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}
