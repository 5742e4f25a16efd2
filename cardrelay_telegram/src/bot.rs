use crate::Result;
use cardrelay_config::TelegramConfig;
use cardrelay_core::ForwardStore;
use cardrelay_pipeline::Dispatcher;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use teloxide::prelude::*;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// Telegram front end of the relay: feeds source chats into the pipeline.
#[derive(Clone)]
pub struct RelayBot {
    /// Teloxide bot instance
    pub bot: Bot,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn ForwardStore>,
    config: TelegramConfig,
    forwarding: Arc<AtomicBool>,
}

impl RelayBot {
    #[must_use]
    pub fn new(
        bot: Bot,
        config: TelegramConfig,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn ForwardStore>,
    ) -> Self {
        let forwarding = Arc::new(AtomicBool::new(config.forwarding_active));
        Self {
            bot,
            dispatcher,
            store,
            config,
            forwarding,
        }
    }

    /// Source chat, and not the destination.
    #[must_use]
    pub fn accepts(&self, chat_id: i64) -> bool {
        accepts_chat(&self.config, chat_id)
    }

    #[must_use]
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.config.admins.contains(&user_id)
    }

    #[must_use]
    pub fn forwarding_active(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }

    /// Pause or resume forwarding. Messages seen before a pause are dropped
    /// from the context windows on resume.
    pub fn set_forwarding(&self, active: bool) {
        let was_active = self.forwarding.swap(active, Ordering::SeqCst);
        if active && !was_active {
            self.dispatcher.correlator().clear();
        }
        info!(
            "Forwarding {}",
            if active { "resumed" } else { "paused" }
        );
    }

    /// Test connection to Telegram API with linear backoff retry.
    /// Starts at 2s, increases by 2s each attempt, max 10s delay.
    /// Retries indefinitely until connection succeeds.
    async fn test_connection(&self) {
        const INITIAL_DELAY_SECS: u64 = 2;
        const MAX_DELAY_SECS: u64 = 10;

        let mut attempt = 1u64;
        loop {
            match self.bot.get_me().await {
                Ok(bot_user) => {
                    info!(
                        "Connected to Telegram API: @{} (id: {})",
                        bot_user
                            .user
                            .username
                            .unwrap_or_else(|| "no username".to_string()),
                        bot_user.user.id
                    );
                    return;
                }
                Err(e) => {
                    let delay_secs = (INITIAL_DELAY_SECS * attempt).min(MAX_DELAY_SECS);
                    warn!("Connection attempt {attempt} failed: {e}. Retrying in {delay_secs}s...");

                    if attempt == 1 {
                        warn!("This may be due to:");
                        warn!("  - Network connectivity issues");
                        warn!("  - Firewall blocking api.telegram.org");
                        warn!("  - Invalid bot token");
                    }

                    sleep(Duration::from_secs(delay_secs)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run the bot and the validation loop until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        use teloxide::dispatching::{Dispatcher as UpdateDispatcher, UpdateFilterExt};
        use teloxide::dptree;
        use teloxide::types::Update;

        self.test_connection().await;
        info!(
            "Relaying {} source chat(s) to {}",
            self.config.source_channels.len(),
            self.config.destination_channel
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let validation = tokio::spawn(self.dispatcher.clone().run_validation_loop(shutdown_rx));

        let bot = self.bot.clone();
        let on_message = {
            let relay = self.clone();
            move |msg: Message| {
                let relay = relay.clone();
                async move { crate::handler::handle_message(relay, msg).await }
            }
        };
        let schema = dptree::entry()
            .branch(Update::filter_message().endpoint(on_message.clone()))
            .branch(Update::filter_channel_post().endpoint(on_message));

        UpdateDispatcher::builder(bot, schema)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        let _ = shutdown_tx.send(true);
        if let Err(e) = validation.await {
            warn!("Validation loop ended abnormally: {e}");
        }
        Ok(())
    }
}

fn accepts_chat(config: &TelegramConfig, chat_id: i64) -> bool {
    chat_id != config.destination_channel && config.is_source(chat_id)
}
