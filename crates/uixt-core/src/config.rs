//! Persistent and environment configuration for uixt.
//!
//! [`UixtConfig`] stores default timeouts, retry policy and backend ports in
//! `~/.uixt/config.json` (or `$UIXT_HOME/config.json`). Every field has a
//! documented default, and the loaded value is passed explicitly into driver
//! constructors; nothing here is global mutable state.
//!
//! [`RecognitionConfig`] is read from the environment because it carries the
//! recognition-service credentials.
//!
//! # Example
//!
//! ```no_run
//! use uixt_core::config::UixtConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = UixtConfig::load();
//! let timeout = config.request_timeout();
//! println!("requests time out after {timeout:?}");
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Environment variable overriding the uixt home directory.
pub const HOME_ENV: &str = "UIXT_HOME";
/// Environment variable holding the recognition-service URL.
pub const RECOGNITION_URL_ENV: &str = "UIXT_RECOGNITION_URL";
/// Environment variable holding the recognition-service bearer token.
pub const RECOGNITION_TOKEN_ENV: &str = "UIXT_RECOGNITION_TOKEN";

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is unset or empty.
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    /// A value could not be parsed.
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns the uixt home directory (`$UIXT_HOME` or `~/.uixt`), creating it
/// if needed.
pub fn uixt_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid {
                key: "home".into(),
                message: "could not determine home directory".into(),
            })?
            .join(".uixt"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Persistent uixt configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UixtConfig {
    /// Per-request timeout in milliseconds (HTTP and shell commands).
    pub request_timeout_ms: u64,
    /// Session rebuild attempts after a transport failure.
    pub reset_retries: u32,
    /// Initial backoff between rebuild attempts; doubles each attempt.
    pub reset_backoff_ms: u64,
    /// Capacity of the per-session screen-result cache.
    pub screen_result_capacity: usize,
    /// Capacity of the per-session request history.
    pub request_history_capacity: usize,
    /// Capacity of the action executor's log.
    pub action_log_capacity: usize,
    pub uia2_port: u16,
    pub wda_port: u16,
    pub wda_mjpeg_port: u16,
    pub browser_port: u16,
    pub stub_port: u16,
    /// Path or name of the `adb` binary.
    pub adb_path: PathBuf,
    /// Path or name of the `hdc` binary.
    pub hdc_path: PathBuf,
}

impl Default for UixtConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            reset_retries: 3,
            reset_backoff_ms: 500,
            screen_result_capacity: 100,
            request_history_capacity: 1000,
            action_log_capacity: 1000,
            uia2_port: 6790,
            wda_port: 8100,
            wda_mjpeg_port: 9100,
            browser_port: 8093,
            stub_port: 32111,
            adb_path: PathBuf::from("adb"),
            hdc_path: PathBuf::from("hdc"),
        }
    }
}

impl UixtConfig {
    /// Load config from `~/.uixt/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        match uixt_dir() {
            Ok(dir) => Self::load_from(&dir.join(CONFIG_FILENAME)),
            Err(_) => Self::default(),
        }
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.uixt/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&uixt_dir()?.join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            key: "config".into(),
            message: e.to_string(),
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reset_backoff(&self) -> Duration {
        Duration::from_millis(self.reset_backoff_ms)
    }
}

/// Connection settings for the remote recognition service.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    /// Full URL of the recognition endpoint.
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Service-side processing timeout sent with each request, in seconds.
    pub timeout_secs: u64,
    /// Attempts before a failure is surfaced.
    pub max_attempts: u32,
}

impl RecognitionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: 10,
            max_attempts: 3,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Reads `UIXT_RECOGNITION_URL` (required) and `UIXT_RECOGNITION_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(RECOGNITION_URL_ENV)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingEnv(RECOGNITION_URL_ENV))?;
        let mut config = Self::new(url.trim());
        if let Some(token) = lookup(RECOGNITION_TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            config.token = Some(token);
        }
        Ok(config)
    }
}
