//! Process-wide agent status map.
//!
//! `StatusReconciler` is the only writer of local agent status. Dispatch,
//! acknowledgment handling and compensation go through its transition
//! methods; everyone else reads or subscribes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};

use crate::status::{AgentStatus, StatusSnapshot, StatusStore};

/// Status assumed for an agent that has never been referenced.
const INITIAL_STATUS: AgentStatus = AgentStatus::Stopped;

struct StatusEntry {
    status: AgentStatus,
    changed_at: DateTime<Utc>,
    /// Execution id of the in-flight command while `status == Unknown`.
    execution_id: Option<String>,
    tx: watch::Sender<AgentStatus>,
}

impl StatusEntry {
    fn new(status: AgentStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self {
            status,
            changed_at: Utc::now(),
            execution_id: None,
            tx,
        }
    }

    fn set(&mut self, status: AgentStatus) {
        self.status = status;
        self.changed_at = Utc::now();
        // send_replace never fails, even with no live receivers.
        self.tx.send_replace(status);
    }
}

/// An agent awaiting its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub agent_id: String,
    pub execution_id: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Default)]
pub struct StatusReconciler {
    entries: RwLock<HashMap<String, StatusEntry>>,
    snapshots: RwLock<HashMap<String, StatusSnapshot>>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current local status; agents never referenced read as stopped.
    pub async fn read(&self, agent_id: &str) -> AgentStatus {
        self.entries
            .read()
            .await
            .get(agent_id)
            .map(|entry| entry.status)
            .unwrap_or(INITIAL_STATUS)
    }

    /// Receive every subsequent status transition for the agent.
    pub async fn subscribe(&self, agent_id: &str) -> watch::Receiver<AgentStatus> {
        let mut entries = self.entries.write().await;
        entries
            .entry(agent_id.to_string())
            .or_insert_with(|| StatusEntry::new(INITIAL_STATUS))
            .tx
            .subscribe()
    }

    /// Mark a command as in flight. Returns the status held before, for rollback.
    pub async fn mark_dispatched(
        &self,
        agent_id: &str,
        execution_id: Option<String>,
    ) -> AgentStatus {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| StatusEntry::new(INITIAL_STATUS));
        let previous = entry.status;
        if previous == AgentStatus::Unknown {
            tracing::warn!(
                agent_id,
                previous_execution = entry.execution_id.as_deref().unwrap_or("-"),
                "Dispatching while another command is still unacknowledged"
            );
        }
        entry.execution_id = execution_id;
        entry.set(AgentStatus::Unknown);
        previous
    }

    /// Commit a terminal status after an acknowledgment or compensation.
    pub async fn commit(&self, agent_id: &str, status: AgentStatus) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| StatusEntry::new(INITIAL_STATUS));
        if status != AgentStatus::Unknown {
            entry.execution_id = None;
        }
        entry.set(status);
        tracing::debug!(agent_id, status = %status, "Agent status committed");
    }

    /// Drive the agent to the safe status after a failed acknowledgment.
    pub async fn compensate(&self, agent_id: &str, safe: AgentStatus) {
        tracing::debug!(agent_id, status = %safe, "Compensating agent status");
        self.commit(agent_id, safe).await;
    }

    /// Undo a `mark_dispatched` whose command never left the process.
    pub async fn rollback(&self, agent_id: &str, previous: AgentStatus) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| StatusEntry::new(INITIAL_STATUS));
        entry.execution_id = None;
        entry.set(previous);
        tracing::debug!(agent_id, status = %previous, "Dispatch rolled back");
    }

    /// Seed the local status from the store if this agent has no local entry yet.
    pub async fn seed_from_store(&self, store: &dyn StatusStore, agent_id: &str) {
        if self.entries.read().await.contains_key(agent_id) {
            return;
        }
        match store.fetch_status(agent_id).await {
            Ok(snapshot) => {
                let mut entries = self.entries.write().await;
                entries
                    .entry(agent_id.to_string())
                    .or_insert_with(|| StatusEntry::new(snapshot.status));
                drop(entries);
                self.snapshots
                    .write()
                    .await
                    .insert(agent_id.to_string(), snapshot);
            }
            Err(e) => {
                tracing::debug!(agent_id, "No remote status to seed from: {}", e);
            }
        }
    }

    pub async fn execution_id(&self, agent_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(agent_id)
            .and_then(|entry| entry.execution_id.clone())
    }

    /// Agents currently awaiting an acknowledgment.
    pub async fn pending(&self) -> Vec<PendingCommand> {
        let mut pending: Vec<PendingCommand> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.status == AgentStatus::Unknown)
            .map(|(agent_id, entry)| PendingCommand {
                agent_id: agent_id.clone(),
                execution_id: entry.execution_id.clone(),
                since: entry.changed_at,
            })
            .collect();
        pending.sort_by(|a, b| a.since.cmp(&b.since));
        pending
    }

    /// Pending commands older than `threshold`. Reported only; status is left as is.
    pub async fn stuck(&self, threshold: Duration) -> Vec<PendingCommand> {
        let now = Utc::now();
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        self.pending()
            .await
            .into_iter()
            .filter(|pending| now.signed_duration_since(pending.since) >= threshold)
            .collect()
    }

    pub async fn record_snapshot(&self, snapshot: StatusSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.agent_id.clone(), snapshot);
    }

    /// Last snapshot read from the status store.
    pub async fn remote_snapshot(&self, agent_id: &str) -> Option<StatusSnapshot> {
        self.snapshots.read().await.get(agent_id).cloned()
    }
}
