//! User settings persistence.
//!
//! Stores user preferences in ~/.personactl/settings.json, optionally
//! overlaid by ~/.personactl/config.toml.
//! Settings are loaded with env var > config.toml > settings.json > default priority.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bootstrap::personactl_base_dir;

/// User settings persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the runtime status API.
    #[serde(default)]
    pub runtime_url: Option<String>,

    /// Base URL of the queue gateway.
    #[serde(default)]
    pub queue_url: Option<String>,

    /// Bearer token for both endpoints. Prefer `PERSONACTL_API_TOKEN`.
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub generation: GenerationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_url: None,
            queue_url: None,
            api_token: None,
            http_timeout_ms: default_http_timeout_ms(),
            poll: PollSettings::default(),
            generation: GenerationSettings::default(),
        }
    }
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

/// Inbox polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Messages requested per receive (1-10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds before an unacknowledged command is reported. 0 disables the report.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    10
}

fn default_stuck_after_secs() -> u64 {
    300
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

/// Avatar generation resumability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Marker file path; defaults to ~/.personactl/generation_marker.json.
    #[serde(default)]
    pub marker_path: Option<String>,

    /// Seconds a marker stays resumable. 0 disables expiry.
    #[serde(default = "default_marker_ttl_secs")]
    pub marker_ttl_secs: u64,
}

fn default_marker_ttl_secs() -> u64 {
    1_800
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            marker_path: None,
            marker_ttl_secs: default_marker_ttl_secs(),
        }
    }
}

impl Settings {
    /// Get the default settings file path (~/.personactl/settings.json).
    pub fn default_path() -> PathBuf {
        personactl_base_dir().join("settings.json")
    }

    /// Load settings from disk, returning default if not found.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load settings from a specific path. Unreadable files yield defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Default TOML config file path (~/.personactl/config.toml).
    pub fn default_toml_path() -> PathBuf {
        personactl_base_dir().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Merge values from `other` into `self`, preferring `other` for
    /// fields that differ from the default.
    ///
    /// Only fields that the overlay explicitly changed (i.e. differ from
    /// Default) are applied.
    pub fn merge_from(&mut self, other: &Self) {
        let default_json = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let other_json = match serde_json::to_value(other) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut self_json = match serde_json::to_value(&*self) {
            Ok(v) => v,
            Err(_) => return,
        };

        merge_non_default(&mut self_json, &other_json, &default_json);

        if let Ok(merged) = serde_json::from_value(self_json) {
            *self = merged;
        }
    }
}

fn merge_non_default(
    target: &mut serde_json::Value,
    other: &serde_json::Value,
    defaults: &serde_json::Value,
) {
    match (target, other, defaults) {
        (
            serde_json::Value::Object(t),
            serde_json::Value::Object(o),
            serde_json::Value::Object(d),
        ) => {
            for (key, other_val) in o {
                let default_val = d.get(key).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(target_val) = t.get_mut(key) {
                    merge_non_default(target_val, other_val, &default_val);
                } else if other_val != &default_val {
                    t.insert(key.clone(), other_val.clone());
                }
            }
        }
        (target, other, defaults) => {
            if other != defaults {
                *target = other.clone();
            }
        }
    }
}
