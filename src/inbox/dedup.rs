//! Process-lifetime record of handled events.
//!
//! Keys are grouped by agent so one agent's history can be dropped without
//! touching the rest. Nothing is evicted implicitly.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use crate::protocol::IdempotencyKey;

#[derive(Default)]
pub struct Deduplicator {
    seen: Mutex<HashMap<String, HashSet<IdempotencyKey>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` for the agent. Returns `false` if it was already recorded.
    pub async fn check_and_insert(&self, agent_id: &str, key: IdempotencyKey) -> bool {
        self.seen
            .lock()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .insert(key)
    }

    pub async fn contains(&self, agent_id: &str, key: &IdempotencyKey) -> bool {
        self.seen
            .lock()
            .await
            .get(agent_id)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Forget one key so its next delivery is handled again.
    pub async fn forget(&self, agent_id: &str, key: &IdempotencyKey) -> bool {
        let mut seen = self.seen.lock().await;
        let Some(keys) = seen.get_mut(agent_id) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            seen.remove(agent_id);
        }
        removed
    }

    /// Drop every key recorded for the agent.
    pub async fn clear_agent(&self, agent_id: &str) -> usize {
        let removed = self
            .seen
            .lock()
            .await
            .remove(agent_id)
            .map_or(0, |keys| keys.len());
        if removed > 0 {
            tracing::debug!(agent_id, removed, "Cleared dedup keys");
        }
        removed
    }

    pub async fn clear(&self) {
        self.seen.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.values().map(HashSet::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
