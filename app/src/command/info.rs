use cardrelay_config::Config;
use cardrelay_core::ForwardStore;
use cardrelay_store::SqlStore;
use tracing::info;

use super::mask;

/// Strategy for displaying configuration and record statistics.
///
/// Secrets are masked; the database is opened once to read record counts.
#[derive(Debug, Clone, Copy)]
pub struct InfoStrategy;

impl super::CommandStrategy for InfoStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load()?;

        println!("=== cardrelay Configuration ===\n");

        println!("Telegram:");
        println!("  Enabled: {}", config.telegram.enabled);
        println!("  Token: {}", mask(&config.telegram.token, 8));
        if config.telegram.source_channels.is_empty() {
            println!("  Sources: (empty - every chat the bot is in)");
        } else {
            let sources: Vec<String> = config
                .telegram
                .source_channels
                .iter()
                .map(ToString::to_string)
                .collect();
            println!("  Sources: {}", sources.join(", "));
        }
        println!("  Destination: {}", config.telegram.destination_channel);
        println!("  Forwarding Active: {}", config.telegram.forwarding_active);
        println!();

        println!("Database:");
        println!("  URL: {}", config.database.url);
        info!("Testing database connection");
        match SqlStore::connect(&config.database.url).await {
            Ok(store) => match store.stats().await {
                Ok(stats) => {
                    println!("  Status: Connected");
                    println!("  Records: {}", stats.total);
                    println!("    Complete: {}", stats.complete);
                    println!("    Partial: {}", stats.partial);
                    println!("    Unconfirmed: {}", stats.provisional);
                }
                Err(e) => {
                    println!("  Status: Connected, statistics unavailable");
                    println!("  Error: {e}");
                }
            },
            Err(e) => {
                println!("  Status: Connection failed");
                println!("  Error: {e}");
            }
        }
        println!();

        println!("Extraction:");
        for set in &config.extraction.rule_sets {
            println!(
                "  {} ({}): {} card rule(s), dial {}",
                set.display_name,
                set.provider,
                set.card_rules.len(),
                set.dial_template
            );
        }
        println!("  Unit Rules: {}", config.extraction.unit_rules.len());
        println!(
            "  Plausible Units: {}..={}",
            config.extraction.unit_range.min, config.extraction.unit_range.max
        );
        println!();

        println!("Context Window:");
        println!("  Capacity: {}", config.context.capacity);
        println!("  Span: {}s", config.context.span_secs);
        println!();

        println!("Validation:");
        println!("  Backoff: {:?}s", config.validation.backoff_secs);
        println!("  Max Attempts: {}", config.validation.max_attempts);
        println!("  Max Pending: {}", config.validation.max_pending);
        println!();

        println!("Policy:");
        println!("  Partial Cards: {:?}", config.policy.partial);
        println!("  Provisional TTL: {}s", config.policy.provisional_ttl_secs);
        println!();

        println!("Fallback:");
        println!("  Enabled: {}", config.fallback.enabled);
        if config.fallback.enabled {
            println!("  API Key: {}", mask(&config.fallback.api_key, 4));
            println!(
                "  Model: {}",
                config.fallback.model.as_deref().unwrap_or("(provider default)")
            );
            println!("  Timeout: {}s", config.fallback.timeout_secs);
        }

        Ok(())
    }
}
