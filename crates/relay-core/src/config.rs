//! Environment-driven gateway configuration.
//!
//! Values can be seeded from an optional TOML file; environment variables
//! always win. Invalid numeric or boolean values fall back to the default
//! with a warning rather than failing startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Optional credentials and base override for one upstream provider.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl ProviderEndpoint {
    pub fn is_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Per-provider endpoint table for the native adapters.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSettings {
    pub openai: ProviderEndpoint,
    pub anthropic: ProviderEndpoint,
    pub google: ProviderEndpoint,
    pub deepseek: ProviderEndpoint,
    pub openrouter: ProviderEndpoint,
}

/// Cursor transport and anti-bot fingerprint settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CursorSettings {
    pub script_url: String,
    pub chat_url: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub user_agent: String,
    pub max_input_length: usize,
    pub system_prompt_inject: Option<String>,
    pub sessions_file: Option<PathBuf>,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            script_url: String::new(),
            chat_url: "https://cursor.com/api/chat".to_string(),
            webgl_vendor: "Google Inc. (NVIDIA)".to_string(),
            webgl_renderer:
                "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)"
                    .to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_string(),
            max_input_length: 120_000,
            system_prompt_inject: None,
            sessions_file: None,
        }
    }
}

impl CursorSettings {
    /// The Cursor path is usable once a script URL is present.
    pub fn is_configured(&self) -> bool {
        !self.script_url.trim().is_empty()
    }
}

/// Usage-tracker queue and flush tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerSettings {
    pub enabled: bool,
    pub channel_size: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_size: 1024,
            batch_size: 50,
            flush_interval_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

/// Retention-sweeper schedule and batch tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub retention_days: u32,
    pub batch_size: usize,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            batch_size: 500,
            schedule_hour: 3,
            schedule_minute: 0,
        }
    }
}

/// Cloudflare Turnstile verifier secret. Empty secret refuses every check.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TurnstileSettings {
    pub secret_key: Option<String>,
}

/// Full gateway configuration assembled from file defaults plus environment.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub providers: ProviderSettings,
    pub cursor: CursorSettings,
    pub tracker: TrackerSettings,
    pub sweeper: SweeperSettings,
    pub turnstile: TurnstileSettings,
}

impl GatewayConfig {
    /// Loads configuration: TOML file values seed defaults, env wins.
    pub fn load(config_file: Option<&Path>) -> Self {
        let mut config = match config_file {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(raw) => match toml::from_str::<GatewayConfig>(&raw) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "ignoring malformed config file");
                        GatewayConfig::default()
                    }
                },
                Err(error) => {
                    warn!(path = %path.display(), %error, "ignoring unreadable config file");
                    GatewayConfig::default()
                }
            },
            None => GatewayConfig::default(),
        };
        config.apply_env();
        config
    }

    /// Overlays recognised environment keys onto the current values.
    pub fn apply_env(&mut self) {
        overlay_endpoint(&mut self.providers.openai, "OPENAI");
        overlay_endpoint(&mut self.providers.anthropic, "ANTHROPIC");
        overlay_endpoint(&mut self.providers.google, "GOOGLE");
        overlay_endpoint(&mut self.providers.deepseek, "DEEPSEEK");
        overlay_endpoint(&mut self.providers.openrouter, "OPENROUTER");

        if let Some(value) = non_empty_env("CURSOR_SCRIPT_URL") {
            self.cursor.script_url = value;
        }
        if let Some(value) = non_empty_env("CURSOR_CHAT_URL") {
            self.cursor.chat_url = value;
        }
        if let Some(value) = non_empty_env("CURSOR_FP_WEBGL_VENDOR") {
            self.cursor.webgl_vendor = value;
        }
        if let Some(value) = non_empty_env("CURSOR_FP_WEBGL_RENDERER") {
            self.cursor.webgl_renderer = value;
        }
        if let Some(value) = non_empty_env("CURSOR_FP_USER_AGENT") {
            self.cursor.user_agent = value;
        }
        if let Some(value) = parse_env("MAX_INPUT_LENGTH", self.cursor.max_input_length) {
            self.cursor.max_input_length = value;
        }
        if let Some(value) = non_empty_env("SYSTEM_PROMPT_INJECT") {
            self.cursor.system_prompt_inject = Some(value);
        }
        if let Some(value) = non_empty_env("CURSOR_SESSIONS_FILE") {
            self.cursor.sessions_file = Some(PathBuf::from(value));
        }

        if let Some(value) = parse_env_bool("USAGE_ENABLED", self.tracker.enabled) {
            self.tracker.enabled = value;
        }
        if let Some(value) = parse_env("USAGE_CHANNEL_SIZE", self.tracker.channel_size) {
            self.tracker.channel_size = value;
        }
        if let Some(value) = parse_env("USAGE_BATCH_SIZE", self.tracker.batch_size) {
            self.tracker.batch_size = value;
        }
        if let Some(value) = parse_env("USAGE_FLUSH_INTERVAL", self.tracker.flush_interval_ms) {
            self.tracker.flush_interval_ms = value;
        }
        if let Some(value) = parse_env("USAGE_MAX_RETRIES", self.tracker.max_retries) {
            self.tracker.max_retries = value;
        }
        if let Some(value) = parse_env("USAGE_RETRY_BACKOFF_MS", self.tracker.retry_backoff_ms) {
            self.tracker.retry_backoff_ms = value;
        }

        if let Some(value) = parse_env("USAGE_RETENTION_DAYS", self.sweeper.retention_days) {
            self.sweeper.retention_days = value;
        }
        if let Some(value) = parse_env("USAGE_SCHEDULE_HOUR", self.sweeper.schedule_hour) {
            self.sweeper.schedule_hour = value;
        }
        if let Some(value) = parse_env("USAGE_SCHEDULE_MINUTE", self.sweeper.schedule_minute) {
            self.sweeper.schedule_minute = value;
        }

        if let Some(value) = non_empty_env("TURNSTILE_SECRET_KEY") {
            self.turnstile.secret_key = Some(value);
        }
    }
}

fn overlay_endpoint(endpoint: &mut ProviderEndpoint, prefix: &str) {
    if let Some(key) = non_empty_env(&format!("{prefix}_API_KEY")) {
        endpoint.api_key = Some(key);
    }
    if let Some(base) = non_empty_env(&format!("{prefix}_BASE_URL")) {
        endpoint.base_url = Some(base);
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_env<T: std::str::FromStr + Copy + std::fmt::Display>(
    name: &str,
    fallback: T,
) -> Option<T> {
    let raw = non_empty_env(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = name, value = %raw, %fallback, "invalid value, keeping default");
            None
        }
    }
}

fn parse_env_bool(name: &str, fallback: bool) -> Option<bool> {
    let raw = non_empty_env(name)?.to_ascii_lowercase();
    match raw.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key = name, value = %raw, fallback, "invalid boolean, keeping default");
            None
        }
    }
}
