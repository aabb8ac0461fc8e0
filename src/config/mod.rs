//! Configuration for personactl.
//!
//! Settings are loaded with priority: env var > config.toml > settings.json >
//! default. Env files (`./.env`, `~/.personactl/.env`) are loaded via dotenvy
//! before resolution.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::settings::Settings;

const MAX_BATCH_SIZE: usize = 10;

/// Resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub runtime_url: String,
    pub queue_url: String,
    pub api_token: Option<SecretString>,
    pub http_timeout: Duration,
    pub poll: PollConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// `None` disables the stuck-command report.
    pub stuck_after: Option<Duration>,
}

impl PollConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let interval_ms = helpers::env_or("PERSONACTL_POLL_INTERVAL_MS", settings.poll.interval_ms)?;
        if interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PERSONACTL_POLL_INTERVAL_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let batch_size = helpers::env_or("PERSONACTL_POLL_BATCH_SIZE", settings.poll.batch_size)?;
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(ConfigError::InvalidValue {
                key: "PERSONACTL_POLL_BATCH_SIZE".to_string(),
                message: format!("must be between 1 and {MAX_BATCH_SIZE}, got {batch_size}"),
            });
        }

        let stuck_after_secs =
            helpers::env_or("PERSONACTL_STUCK_AFTER_SECS", settings.poll.stuck_after_secs)?;

        Ok(Self {
            interval: Duration::from_millis(interval_ms),
            batch_size,
            stuck_after: (stuck_after_secs > 0).then(|| Duration::from_secs(stuck_after_secs)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub marker_path: PathBuf,
    /// `None` keeps markers resumable indefinitely.
    pub marker_ttl: Option<Duration>,
}

impl GenerationConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let marker_path = helpers::optional_env("PERSONACTL_MARKER_PATH")?
            .or_else(|| settings.generation.marker_path.clone())
            .map(|path| expand_home(&path))
            .unwrap_or_else(crate::generation::default_marker_path);

        let ttl_secs = helpers::env_or(
            "PERSONACTL_MARKER_TTL_SECS",
            settings.generation.marker_ttl_secs,
        )?;

        Ok(Self {
            marker_path,
            marker_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        })
    }
}

impl Config {
    /// Load env files, settings.json and the optional TOML overlay, then resolve.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_personactl_env();
        let mut settings = Settings::load();

        // Overlay TOML config file (values win over JSON settings)
        Self::apply_toml_overlay(&mut settings, toml_path)?;

        Self::resolve(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries the default path `~/.personactl/config.toml` (missing
    /// file is silently ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Resolve every value from env, falling back to `settings`.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let runtime_url = resolve_url(
            "PERSONACTL_RUNTIME_URL",
            settings.runtime_url.as_deref(),
            "http://localhost:8080",
        )?;
        let queue_url = resolve_url(
            "PERSONACTL_QUEUE_URL",
            settings.queue_url.as_deref(),
            "http://localhost:8080/queue",
        )?;

        let api_token = helpers::optional_env("PERSONACTL_API_TOKEN")?
            .or_else(|| settings.api_token.clone().filter(|t| !t.trim().is_empty()))
            .map(SecretString::from);

        let http_timeout_ms = helpers::env_or("PERSONACTL_HTTP_TIMEOUT_MS", settings.http_timeout_ms)?;
        if http_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PERSONACTL_HTTP_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        Ok(Self {
            runtime_url,
            queue_url,
            api_token,
            http_timeout: Duration::from_millis(http_timeout_ms),
            poll: PollConfig::resolve(settings)?,
            generation: GenerationConfig::resolve(settings)?,
        })
    }
}

fn resolve_url(key: &str, configured: Option<&str>, default: &str) -> Result<String, ConfigError> {
    let value = helpers::optional_env(key)?
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| default.to_string());
    let value = value.trim().trim_end_matches('/').to_string();

    match reqwest::Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(value),
        Ok(url) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("invalid URL '{value}': {e}"),
        }),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
