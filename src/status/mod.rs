//! Agent runtime status: the external status store and the local reconciler.
//!
//! The store is the backing truth (`/runtime/{agentId}`); the reconciler
//! holds the process-wide view the rest of the crate reads and subscribes to.

mod compensation;
mod http;
mod memory;
mod reconciler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StatusStoreError;

pub use self::compensation::{AckOutcome, AcknowledgmentHandler};
pub use self::http::HttpStatusStore;
pub use self::memory::MemoryStatusStore;
pub use self::reconciler::{PendingCommand, StatusReconciler};

/// Remote runtime status of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Stopped,
    Unknown,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a committed status update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusUpdate {
    /// Correlation token minted by the store for the upcoming command.
    pub execution_id: Option<String>,
}

/// Plain status snapshot read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub execution_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// External status store collaborator.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist `status` for the agent, returning the minted execution id.
    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<StatusUpdate, StatusStoreError>;

    /// Read the plain status snapshot.
    async fn fetch_status(&self, agent_id: &str) -> Result<StatusSnapshot, StatusStoreError>;
}
