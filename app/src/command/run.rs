use crate::command::CommandStrategy;
use anyhow::Context;
use cardrelay_config::{Config, FallbackConfig};
use cardrelay_core::ForwardStore;
use cardrelay_extract::{PatternExtractor, UnitRange};
use cardrelay_pipeline::{Dispatcher, Fallback};
use cardrelay_providers::ChatCompletionExtractor;
use cardrelay_store::{MemoryStore, SqlStore};
use cardrelay_telegram::{CardFormatter, RelayBot, TelegramPublisher};
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tokio::time::sleep;
use tracing::{info, warn};

/// Connect to the record store with exponential backoff retry.
///
/// # Retry Behavior
/// - First retry: 1s
/// - Second retry: 2s
/// - Third and beyond: 3s (capped)
/// - Retries indefinitely until connection succeeds
async fn connect_store_with_retry(database_url: &str) -> SqlStore {
    const MAX_DELAY: Duration = Duration::from_secs(3);
    const INITIAL_DELAY: Duration = Duration::from_secs(1);

    let mut attempt = 0u32;
    let mut delay = INITIAL_DELAY;

    loop {
        attempt += 1;
        match SqlStore::connect(database_url).await {
            Ok(store) => {
                info!("Record store connected successfully on attempt {attempt}");
                return store;
            }
            Err(e) => {
                warn!(
                    "Failed to connect to database (attempt {attempt}): {e}. Retrying in {}s...",
                    delay.as_secs()
                );
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

fn build_fallback(config: &FallbackConfig, range: UnitRange) -> Fallback {
    if !config.is_usable() {
        if config.enabled {
            warn!("Fallback enabled but no API key set; running rules only");
        }
        return Fallback::Disabled;
    }

    let mut extractor = ChatCompletionExtractor::new(config.api_key.clone())
        .with_range(range.min, range.max)
        .with_retry_delays(config.retry_delays());
    if let Some(base_url) = &config.base_url {
        extractor = extractor.with_base_url(base_url);
    }
    if let Some(model) = &config.model {
        extractor = extractor.with_model(model.clone());
    }
    info!("Fallback extractor enabled");
    Fallback::enabled(
        Arc::new(extractor),
        Duration::from_secs(config.timeout_secs),
        Duration::from_secs(config.cooldown_secs),
    )
}

/// Input for the run command.
pub struct RunInput {
    /// Optional bot token (overrides config)
    pub token: Option<String>,
    /// Use the in-memory store instead of the database
    pub ephemeral: bool,
}

/// Strategy for running the Telegram relay.
pub struct RunStrategy;

impl CommandStrategy for RunStrategy {
    type Input = RunInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load()?;

        if !config.telegram.enabled {
            anyhow::bail!("Telegram is not enabled in config. Set \"telegram.enabled\": true");
        }

        let token = if let Some(t) = input.token {
            t
        } else if !config.telegram.token.is_empty() {
            config.telegram.token.clone()
        } else {
            anyhow::bail!("Telegram bot token not configured. Set \"telegram.token\" in config");
        };

        let extractor =
            PatternExtractor::new(&config.extraction).context("Invalid extraction rules")?;

        let store: Arc<dyn ForwardStore> = if input.ephemeral {
            warn!("Ephemeral mode: forwarded cards are forgotten on restart");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(connect_store_with_retry(&config.database.url).await)
        };

        info!("Starting Telegram relay...");
        let bot = Bot::new(token);
        let publisher = TelegramPublisher::new(
            bot.clone(),
            config.telegram.destination_channel,
            CardFormatter::new(&config.extraction),
        )?;

        let dispatcher = Dispatcher::new(
            config.pipeline(),
            extractor,
            store.clone(),
            Arc::new(publisher),
        )
        .with_fallback(build_fallback(
            &config.fallback,
            config.extraction.unit_range,
        ));

        let relay = RelayBot::new(bot, config.telegram, Arc::new(dispatcher), store);

        info!("Telegram relay is running. Press Ctrl+C to stop.");
        relay.run().await?;

        Ok(())
    }
}
