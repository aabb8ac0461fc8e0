//! Persisted resumability marker for an in-flight avatar generation.
//!
//! One slot holds at most one marker. It names the agent and the task so a
//! marker left behind by an unrelated earlier run can be told apart from the
//! current one, and it carries its start time so abandoned markers expire.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MarkerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMarker {
    pub agent_id: String,
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl GenerationMarker {
    pub fn new(agent_id: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id,
            started_at: Utc::now(),
        }
    }

    /// Whether the marker is older than `ttl`. `None` never expires.
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.started_at) > ttl,
            Err(_) => false,
        }
    }
}

/// The persistent key-value slot holding the marker.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn load(&self) -> Result<Option<GenerationMarker>, MarkerError>;
    async fn save(&self, marker: &GenerationMarker) -> Result<(), MarkerError>;
    async fn clear(&self) -> Result<(), MarkerError>;
}

/// Default marker location (~/.personactl/generation_marker.json).
pub fn default_marker_path() -> PathBuf {
    crate::bootstrap::personactl_base_dir().join("generation_marker.json")
}

/// Marker stored as a small JSON file.
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> MarkerError {
        MarkerError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl MarkerStore for FileMarkerStore {
    async fn load(&self) -> Result<Option<GenerationMarker>, MarkerError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        match serde_json::from_str::<GenerationMarker>(&data) {
            Ok(marker) => {
                tracing::debug!(
                    agent_id = %marker.agent_id,
                    task_id = %marker.task_id,
                    "Loaded generation marker from {}",
                    self.path.display()
                );
                Ok(Some(marker))
            }
            Err(e) => {
                // An unreadable marker cannot be resumed; treat the slot as empty.
                tracing::warn!(
                    "Ignoring unreadable generation marker {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, marker: &GenerationMarker) -> Result<(), MarkerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(marker)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tracing::debug!("Generation marker saved to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<(), MarkerError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Marker slot held in memory.
#[derive(Default)]
pub struct MemoryMarkerStore {
    slot: Mutex<Option<GenerationMarker>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(marker: GenerationMarker) -> Self {
        Self {
            slot: Mutex::new(Some(marker)),
        }
    }

    pub async fn current(&self) -> Option<GenerationMarker> {
        self.slot.lock().await.clone()
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn load(&self) -> Result<Option<GenerationMarker>, MarkerError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, marker: &GenerationMarker) -> Result<(), MarkerError> {
        *self.slot.lock().await = Some(marker.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), MarkerError> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_marker_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = FileMarkerStore::new(dir.path().join("nested").join("marker.json"));

        assert_eq!(store.load().await.unwrap(), None);

        let marker = GenerationMarker::new("A123", Uuid::new_v4());
        store.save(&marker).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(marker));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        // Clearing an empty slot is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_marker_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marker.json");
        std::fs::write(&path, "A123").unwrap();

        let store = FileMarkerStore::new(&path);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[test]
    fn expiry_respects_ttl() {
        let mut marker = GenerationMarker::new("A1", Uuid::new_v4());
        marker.started_at = Utc::now() - chrono::Duration::seconds(120);
        let now = Utc::now();

        assert!(marker.is_expired(Some(Duration::from_secs(60)), now));
        assert!(!marker.is_expired(Some(Duration::from_secs(600)), now));
        assert!(!marker.is_expired(None, now));
    }

    #[tokio::test]
    async fn memory_marker_round_trip() {
        let store = MemoryMarkerStore::new();
        let marker = GenerationMarker::new("A1", Uuid::new_v4());
        store.save(&marker).await.unwrap();
        assert_eq!(store.current().await, Some(marker));
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
