use cardrelay_extract::ExtractionConfig;
use cardrelay_pipeline::{ContextConfig, PipelineConfig, PolicyConfig, ValidationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "cardrelay";

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Chats whose messages are scanned for cards.
    #[serde(default)]
    pub source_channels: Vec<i64>,
    /// Chat the cards are forwarded to.
    #[serde(default)]
    pub destination_channel: i64,
    /// Runtime switch; when off, messages are read but nothing is forwarded.
    #[serde(default = "TelegramConfig::default_forwarding_active")]
    pub forwarding_active: bool,
    /// Users allowed to run admin commands in a private chat with the bot.
    #[serde(default)]
    pub admins: Vec<u64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            source_channels: Vec::new(),
            destination_channel: 0,
            forwarding_active: Self::default_forwarding_active(),
            admins: Vec::new(),
        }
    }
}

impl TelegramConfig {
    const fn default_forwarding_active() -> bool {
        true
    }

    #[must_use]
    pub fn is_source(&self, chat_id: i64) -> bool {
        self.source_channels.is_empty() || self.source_channels.contains(&chat_id)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

impl DatabaseConfig {
    fn default_url() -> String {
        Config::config_dir().map_or_else(
            |_| "sqlite://cards.db?mode=rwc".to_string(),
            |dir| format!("sqlite://{}?mode=rwc", dir.join("cards.db").display()),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    /// OpenAI-compatible endpoint; the provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "FallbackConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause after a failed call.
    #[serde(default = "FallbackConfig::default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Delays between attempts of one call when the endpoint is unreachable.
    #[serde(default = "FallbackConfig::default_retry_delays_millis")]
    pub retry_delays_millis: Vec<u64>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            base_url: None,
            model: None,
            timeout_secs: Self::default_timeout_secs(),
            cooldown_secs: Self::default_cooldown_secs(),
            retry_delays_millis: Self::default_retry_delays_millis(),
        }
    }
}

impl FallbackConfig {
    const fn default_timeout_secs() -> u64 {
        5
    }

    const fn default_cooldown_secs() -> u64 {
        60
    }

    fn default_retry_delays_millis() -> Vec<u64> {
        vec![1000]
    }

    #[must_use]
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_millis
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Enabled and carrying an API key.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }
}

impl Config {
    /// `~/cardrelay`.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(APP_DIR))
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Please run 'cardrelay init' to create config.",
                config_path.display()
            );
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.validation.backoff_secs.is_empty() {
            anyhow::bail!("validation.backoff_secs must not be empty");
        }
        if self.context.capacity == 0 {
            anyhow::bail!("context.capacity must be at least 1");
        }
        if self.telegram.enabled
            && self
                .telegram
                .source_channels
                .contains(&self.telegram.destination_channel)
        {
            anyhow::bail!("telegram.destination_channel is also listed as a source");
        }
        Ok(())
    }

    /// Pipeline settings in the shape the dispatcher takes.
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            context: self.context.clone(),
            validation: self.validation.clone(),
            policy: self.policy.clone(),
        }
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn create_config() -> anyhow::Result<()> {
        let config_dir = Self::ensure_config_dir()?;
        let config_path = config_dir.join("config.json");

        if config_path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                config_path.display()
            );
        }

        std::fs::write(&config_path, CONFIG_TEMPLATE)?;

        println!("✅ Created config file at: {}", config_path.display());
        println!();
        println!("📝 Next steps:");
        println!("   1. Add your bot token and the source/destination chat ids");
        println!("   2. Add the bot to every source chat and as admin of the destination");
        println!("   3. Run 'cardrelay run' to start relaying cards");
        println!();
        println!("🔧 Configuration options:");
        println!("   - policy.partial: \"forward\" (default) or \"suppress\" cards without units");
        println!("   - validation.backoff_secs: delays between re-checks of partial cards");
        println!("   - fallback.enabled: ask a chat completion API when rules find no units");
        println!("   - extraction: provider and unit rules (built-in rules when omitted)");
        println!();
        Ok(())
    }
}

const CONFIG_TEMPLATE: &str = r#"{
  "telegram": {
    "enabled": true,
    "token": "your-bot-token-here",
    "source_channels": [-1001111111111],
    "destination_channel": -1002222222222,
    "forwarding_active": true,
    "admins": []
  },
  "context": {
    "capacity": 20,
    "span_secs": 600
  },
  "validation": {
    "backoff_secs": [30, 120, 600],
    "max_attempts": 3,
    "max_pending": 1024,
    "tick_millis": 1000
  },
  "policy": {
    "partial": "forward",
    "provisional_ttl_secs": 300,
    "store_retry_millis": [100, 500, 2000]
  },
  "fallback": {
    "enabled": false,
    "api_key": "your-api-key-here",
    "timeout_secs": 5,
    "cooldown_secs": 60,
    "retry_delays_millis": [1000]
  }
}"#;
