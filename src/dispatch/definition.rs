//! Persistence of agent definitions sent with `update`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::error::DispatchError;

#[async_trait]
pub trait AgentDefinitionStore: Send + Sync {
    /// Store the new definition ahead of the `update` command.
    async fn save_definition(
        &self,
        agent_id: &str,
        definition: &serde_json::Value,
    ) -> Result<(), DispatchError>;
}

/// `PUT {base}/agents/{agentId}` with the definition as the JSON body.
pub struct HttpDefinitionStore {
    base_url: String,
    client: Client,
    token: Option<SecretString>,
}

impl HttpDefinitionStore {
    pub fn new(base_url: &str, timeout: Duration, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            token,
        }
    }
}

#[async_trait]
impl AgentDefinitionStore for HttpDefinitionStore {
    async fn save_definition(
        &self,
        agent_id: &str,
        definition: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);
        let mut request = self.client.put(&url).json(definition);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let rejected = |reason: String| DispatchError::DefinitionRejected {
            agent_id: agent_id.to_string(),
            reason,
        };
        let response = request.send().await.map_err(|e| rejected(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(rejected(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        tracing::debug!(agent_id, "Agent definition saved");
        Ok(())
    }
}

/// Definitions held in memory; rejects anything that is not a JSON object.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    definitions: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, agent_id: &str) -> Option<serde_json::Value> {
        self.definitions.lock().await.get(agent_id).cloned()
    }
}

#[async_trait]
impl AgentDefinitionStore for MemoryDefinitionStore {
    async fn save_definition(
        &self,
        agent_id: &str,
        definition: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        if !definition.is_object() {
            return Err(DispatchError::DefinitionRejected {
                agent_id: agent_id.to_string(),
                reason: "definition must be a JSON object".to_string(),
            });
        }
        self.definitions
            .lock()
            .await
            .insert(agent_id.to_string(), definition.clone());
        Ok(())
    }
}
