use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dotenvy::dotenv;
use serde::Deserialize;

/// Full runtime configuration: a JSON config file with per-section
/// defaults, overlaid by environment variables. Credentials are only
/// validated by the commands that need them, so `db stats` works
/// without a Discord token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub discord: DiscordConfig,
    pub scraper: ScraperConfig,
    pub ai: AiConfig,
    pub privacy: PrivacyConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub prompts: PromptConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScraperConfig {
    /// Sleep between paginated message requests, in milliseconds.
    pub delay_between_requests: u64,
    pub backoff_multiplier: f64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            delay_between_requests: 100,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Max messages per LLM batch.
    pub batch_size: usize,
    pub max_tokens_per_batch: usize,
    /// Per-call completion token cap.
    pub max_tokens: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// When set, memoized stage rows older than this many days are
    /// considered stale and reprocessed.
    pub reprocess_after_days: Option<i64>,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub stages: HashMap<String, StageToggle>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            batch_size: 20,
            max_tokens_per_batch: 8000,
            max_tokens: 4000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            reprocess_after_days: None,
            input_cost_per_1k: 0.00015,
            output_cost_per_1k: 0.0006,
            stages: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StageToggle {
    pub enabled: bool,
}

impl Default for StageToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrivacyConfig {
    /// Replace usernames with stable aliases before anything leaves
    /// the process toward the LLM.
    pub anonymize_in_prompts: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            anonymize_in_prompts: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/guildpress.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    /// "compact" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PromptConfig {
    /// Directory of prompt templates; compiled-in defaults are used
    /// for any template missing from it.
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load `.env`, then the config file (if present), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new("config.json");
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("DISCORD_TOKEN") {
            self.discord.token = Some(token);
        }
        if let Ok(guild) = env::var("DISCORD_GUILD_ID") {
            self.discord.guild_id = Some(guild);
        }
        if let Ok(key) = env::var("AI_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            self.ai.api_key = Some(key);
        }
        if let Ok(model) = env::var("AI_MODEL") {
            self.ai.model = model;
        }
        if let Ok(base) = env::var("AI_BASE_URL") {
            self.ai.base_url = base;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Credentials needed for a scrape pass. Checked before the store
    /// is touched.
    pub fn require_discord(&self) -> anyhow::Result<(&str, &str)> {
        let token = self
            .discord
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("discord.token (or DISCORD_TOKEN) must be set"))?;
        let guild = self
            .discord
            .guild_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("discord.guildId (or DISCORD_GUILD_ID) must be set"))?;
        Ok((token, guild))
    }

    /// API key needed for any processing stage.
    pub fn require_ai_key(&self) -> anyhow::Result<&str> {
        self.ai
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ai.apiKey (or OPENAI_API_KEY) must be set"))
    }

    pub fn stage_enabled(&self, stage: &str) -> bool {
        self.ai
            .stages
            .get(stage)
            .map(|toggle| toggle.enabled)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scraper.delay_between_requests, 100);
        assert_eq!(config.ai.batch_size, 20);
        assert_eq!(config.ai.max_tokens_per_batch, 8000);
        assert_eq!(config.ai.retry_attempts, 3);
        assert!(config.privacy.anonymize_in_prompts);
        assert_eq!(config.database.path, PathBuf::from("./data/guildpress.db"));
        assert!(config.stage_enabled("filter"));
    }

    #[test]
    fn test_parse_nested_sections() {
        let raw = r#"{
            "discord": {"token": "tok", "guildId": "g1"},
            "scraper": {"delayBetweenRequests": 250},
            "ai": {"model": "test-model", "batchSize": 5, "stages": {"extract": {"enabled": false}}},
            "privacy": {"anonymizeInPrompts": false}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.discord.guild_id.as_deref(), Some("g1"));
        assert_eq!(config.scraper.delay_between_requests, 250);
        assert_eq!(config.ai.model, "test-model");
        assert_eq!(config.ai.batch_size, 5);
        assert!(!config.privacy.anonymize_in_prompts);
        assert!(!config.stage_enabled("extract"));
        assert!(config.stage_enabled("filter"));
        // Untouched sections keep their defaults.
        assert_eq!(config.ai.retry_attempts, 3);
    }

    #[test]
    fn test_require_discord_missing() {
        let config = Config::default();
        assert!(config.require_discord().is_err());
        assert!(config.require_ai_key().is_err());
    }
}
