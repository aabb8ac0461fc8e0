//! In-process status store used by tests and offline runs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StatusStoreError;
use crate::status::{AgentStatus, StatusSnapshot, StatusStore, StatusUpdate};

#[derive(Default)]
struct Inner {
    statuses: HashMap<String, StatusSnapshot>,
    history: Vec<(String, AgentStatus)>,
    /// Outcomes queued for upcoming `set_status` calls; `true` fails the call.
    scripted_failures: VecDeque<bool>,
    next_execution: u64,
    omit_execution_id: bool,
}

/// Status store held in memory. Execution ids are minted as `E1`, `E2`, ...
#[derive(Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Inner>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` status updates.
    pub async fn fail_next_updates(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.scripted_failures.extend(std::iter::repeat_n(true, count));
    }

    /// Queue an explicit sequence of outcomes (`true` = fail) for upcoming updates.
    pub async fn script_updates(&self, failures: impl IntoIterator<Item = bool>) {
        self.inner.lock().await.scripted_failures.extend(failures);
    }

    /// Answer updates without an execution id.
    pub async fn omit_execution_ids(&self, omit: bool) {
        self.inner.lock().await.omit_execution_id = omit;
    }

    /// Every committed update, in order.
    pub async fn history(&self) -> Vec<(String, AgentStatus)> {
        self.inner.lock().await.history.clone()
    }

    pub async fn current(&self, agent_id: &str) -> Option<AgentStatus> {
        self.inner
            .lock()
            .await
            .statuses
            .get(agent_id)
            .map(|snapshot| snapshot.status)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<StatusUpdate, StatusStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.scripted_failures.pop_front().unwrap_or(false) {
            return Err(StatusStoreError::UpdateFailed {
                agent_id: agent_id.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        inner.next_execution += 1;
        let execution_id = (!inner.omit_execution_id).then(|| format!("E{}", inner.next_execution));
        inner.statuses.insert(
            agent_id.to_string(),
            StatusSnapshot {
                agent_id: agent_id.to_string(),
                status,
                execution_id: execution_id.clone(),
                updated_at: Some(Utc::now()),
            },
        );
        inner.history.push((agent_id.to_string(), status));

        Ok(StatusUpdate { execution_id })
    }

    async fn fetch_status(&self, agent_id: &str) -> Result<StatusSnapshot, StatusStoreError> {
        self.inner
            .lock()
            .await
            .statuses
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StatusStoreError::ReadFailed {
                agent_id: agent_id.to_string(),
                reason: "no status recorded".to_string(),
            })
    }
}
