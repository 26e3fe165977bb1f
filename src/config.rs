//! Configuration types, populated from environment variables.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default model for the main conversational tier.
const DEFAULT_MODEL_MAIN: &str = "claude-sonnet-4-5";
/// Default model for the fast auxiliary tier (checkins, extraction, deep scans).
const DEFAULT_MODEL_FAST: &str = "claude-haiku-4-5-20251001";

/// Top-level agent configuration.
#[derive(Clone)]
pub struct CoachConfig {
    /// Path to the local database file.
    pub db_path: PathBuf,
    /// Model id for the main tier.
    pub model_main: String,
    /// Model id for the fast tier.
    pub model_fast: String,
    /// Anthropic API key.
    pub anthropic_api_key: SecretString,
    /// OpenAI API key for voice transcription. Voice is disabled without it.
    pub openai_api_key: Option<SecretString>,
    /// Telegram bot token. The Telegram channel is disabled without it.
    pub telegram_token: Option<String>,
    /// Telegram allowlist (usernames or numeric ids, "*" for everyone).
    pub telegram_allowed_users: Vec<String>,
    /// Max output tokens for the main reply call.
    pub max_reply_tokens: u32,
    /// Optional directory for rolling log files. Logs go to stderr without it.
    pub log_dir: Option<PathBuf>,
    /// Scheduled checkin configuration.
    pub checkins: CheckinConfig,
}

impl CoachConfig {
    /// Build configuration from the environment.
    ///
    /// `ANTHROPIC_API_KEY` is required; everything else has a default or
    /// disables the corresponding integration when absent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let telegram_allowed_users = std::env::var("TELEGRAM_ALLOWED_USERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            db_path: std::env::var("NASTAVNIK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/nastavnik.db")),
            model_main: std::env::var("CLAUDE_MODEL_MAIN")
                .unwrap_or_else(|_| DEFAULT_MODEL_MAIN.to_string()),
            model_fast: std::env::var("CLAUDE_MODEL_FAST")
                .unwrap_or_else(|_| DEFAULT_MODEL_FAST.to_string()),
            anthropic_api_key,
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().map(SecretString::from),
            telegram_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_allowed_users,
            max_reply_tokens: env_parse("NASTAVNIK_MAX_REPLY_TOKENS", 700),
            log_dir: std::env::var("NASTAVNIK_LOG_DIR").ok().map(PathBuf::from),
            checkins: CheckinConfig::from_env(),
        })
    }
}

/// Scheduled checkin configuration.
///
/// Cron expressions use the 6-field `sec min hour dom mon dow` form and
/// are evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CheckinConfig {
    pub enabled: bool,
    pub morning_cron: String,
    pub evening_cron: String,
    pub weekly_cron: String,
    /// Trailing activity window: only users who wrote within this many
    /// days receive checkins.
    pub active_window_days: u32,
}

impl CheckinConfig {
    pub fn from_env() -> Self {
        let morning_hour: u32 = env_parse("MORNING_CHECKIN_HOUR", 8);
        let morning_minute: u32 = env_parse("MORNING_CHECKIN_MINUTE", 0);
        let evening_hour: u32 = env_parse("EVENING_CHECKIN_HOUR", 21);
        let evening_minute: u32 = env_parse("EVENING_CHECKIN_MINUTE", 0);

        Self {
            enabled: std::env::var("NASTAVNIK_CHECKINS_ENABLED")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
            morning_cron: format!("0 {morning_minute} {morning_hour} * * *"),
            evening_cron: format!("0 {evening_minute} {evening_hour} * * *"),
            weekly_cron: "0 0 12 * * Sat".to_string(),
            active_window_days: env_parse("NASTAVNIK_ACTIVE_WINDOW_DAYS", 7),
        }
    }
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            morning_cron: "0 0 8 * * *".to_string(),
            evening_cron: "0 0 21 * * *".to_string(),
            weekly_cron: "0 0 12 * * Sat".to_string(),
            active_window_days: 7,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
