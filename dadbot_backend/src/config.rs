use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Number the bot texts from.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Public URL Twilio posts to; signatures are computed over it.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_twilio_api_base")]
    pub api_base: String,
}

fn default_twilio_api_base() -> String {
    "https://api.twilio.com".to_string()
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            phone_number: None,
            webhook_url: None,
            api_base: default_twilio_api_base(),
        }
    }
}

impl TwilioConfig {
    /// Outbound texting needs all three credentials.
    pub fn outbound_ready(&self) -> bool {
        [&self.account_sid, &self.auth_token, &self.phone_number]
            .iter()
            .all(|value| value.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // LLM configuration (OpenAI-compatible endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_journal_model")]
    pub journal_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Reply generation
    #[serde(default = "default_reply_max_tokens")]
    pub reply_max_tokens: u32,
    #[serde(default = "default_reply_temperature")]
    pub reply_temperature: f32,

    // Context window
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_journal_digest_window")]
    pub journal_digest_window: usize,

    // Journal trigger
    #[serde(default = "default_journal_batch_size")]
    pub journal_batch_size: usize,
    #[serde(default = "default_journal_min_per_direction")]
    pub journal_min_per_direction: usize,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub twilio: TwilioConfig,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4".to_string()
}

fn default_journal_model() -> String {
    "o4-mini-2025-04-16".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_reply_max_tokens() -> u32 {
    200
}

fn default_reply_temperature() -> f32 {
    0.8
}

fn default_history_window() -> usize {
    10
}

fn default_journal_digest_window() -> usize {
    3
}

fn default_journal_batch_size() -> usize {
    6
}

fn default_journal_min_per_direction() -> usize {
    3
}

fn default_database_path() -> String {
    "dadbot.db".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            journal_model: default_journal_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            reply_max_tokens: default_reply_max_tokens(),
            reply_temperature: default_reply_temperature(),
            history_window: default_history_window(),
            journal_digest_window: default_journal_digest_window(),
            journal_batch_size: default_journal_batch_size(),
            journal_min_per_direction: default_journal_min_per_direction(),
            database_path: default_database_path(),
            twilio: TwilioConfig::default(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `DADBOT_CONFIG` if set, else `dadbot_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        env::var("DADBOT_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::get_base_dir().join("dadbot_config.toml"))
    }

    /// Load the config file (falling back to defaults), then apply env overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config = toml::from_str::<BotConfig>(contents).context("Invalid dadbot config")?;
        config.clamp_limits();
        Ok(config)
    }

    /// A zero timeout would fail every completion call.
    fn clamp_limits(&mut self) {
        if self.llm_timeout_secs == 0 {
            tracing::warn!("llm_timeout_secs must be at least 1; using 1");
            self.llm_timeout_secs = 1;
        }
    }

    /// Env vars win over the file. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("LLM_API_URL") {
            self.llm_api_url = url;
        }
        if let Some(model) = non_empty("LLM_MODEL") {
            self.llm_model = model;
        }
        if let Some(model) = non_empty("LLM_JOURNAL_MODEL") {
            self.journal_model = model;
        }
        if let Some(key) = non_empty("LLM_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.llm_api_key = Some(key);
        }
        if let Some(secs) = non_empty("LLM_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.llm_timeout_secs = secs;
        }
        if let Some(path) = non_empty("DADBOT_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(size) = non_empty("DADBOT_JOURNAL_BATCH_SIZE").and_then(|v| v.trim().parse().ok())
        {
            self.journal_batch_size = size;
        }
        if let Some(min) =
            non_empty("DADBOT_JOURNAL_MIN_PER_DIRECTION").and_then(|v| v.trim().parse().ok())
        {
            self.journal_min_per_direction = min;
        }

        if let Some(sid) = non_empty("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = Some(sid);
        }
        if let Some(token) = non_empty("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = Some(token);
        }
        if let Some(number) = non_empty("TWILIO_PHONE_NUMBER") {
            self.twilio.phone_number = Some(number);
        }
        if let Some(url) = non_empty("TWILIO_WEBHOOK_URL") {
            self.twilio.webhook_url = Some(url);
        }
        if let Some(base) = non_empty("TWILIO_API_BASE") {
            self.twilio.api_base = base;
        }

        self.clamp_limits();
    }
}
