//! HTTP client for the runtime status endpoints.
//!
//! - `POST {base}/runtime/{agentId}/update` with `{"status": ...}` returns the
//!   minted `executionId`.
//! - `GET {base}/runtime/{agentId}` returns the plain snapshot.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::StatusStoreError;
use crate::status::{AgentStatus, StatusSnapshot, StatusStore, StatusUpdate};

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default, alias = "execution_id", rename = "executionId")]
    execution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    status: String,
    #[serde(default, alias = "execution_id", rename = "executionId")]
    execution_id: Option<String>,
    #[serde(default, alias = "updated_at", rename = "updatedAt")]
    updated_at: Option<DateTime<Utc>>,
}

/// Status store backed by the runtime HTTP API.
pub struct HttpStatusStore {
    base_url: String,
    client: Client,
    token: Option<SecretString>,
}

impl HttpStatusStore {
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

    fn runtime_url(&self, agent_id: &str) -> String {
        format!("{}/runtime/{}", self.base_url, agent_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl StatusStore for HttpStatusStore {
    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<StatusUpdate, StatusStoreError> {
        let url = format!("{}/update", self.runtime_url(agent_id));
        let response = self
            .authorize(self.client.post(&url))
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(|e| StatusStoreError::UpdateFailed {
                agent_id: agent_id.to_string(),
                reason: e.to_string(),
            })?;

        let code = response.status();
        if !code.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatusStoreError::UpdateFailed {
                agent_id: agent_id.to_string(),
                reason: format!("HTTP {}: {}", code.as_u16(), body),
            });
        }

        // Some deployments answer with an empty body for terminal statuses.
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(StatusUpdate::default());
        }
        let parsed: UpdateResponse =
            serde_json::from_str(&body).map_err(|e| StatusStoreError::UpdateFailed {
                agent_id: agent_id.to_string(),
                reason: format!("invalid response body: {e}"),
            })?;

        tracing::debug!(
            agent_id,
            status = %status,
            execution_id = parsed.execution_id.as_deref().unwrap_or("-"),
            "Runtime status updated"
        );

        Ok(StatusUpdate {
            execution_id: parsed.execution_id,
        })
    }

    async fn fetch_status(&self, agent_id: &str) -> Result<StatusSnapshot, StatusStoreError> {
        let response = self
            .authorize(self.client.get(self.runtime_url(agent_id)))
            .send()
            .await
            .map_err(|e| StatusStoreError::ReadFailed {
                agent_id: agent_id.to_string(),
                reason: e.to_string(),
            })?;

        let code = response.status();
        if !code.is_success() {
            return Err(StatusStoreError::ReadFailed {
                agent_id: agent_id.to_string(),
                reason: format!("HTTP {}", code.as_u16()),
            });
        }

        let parsed: SnapshotResponse =
            response
                .json()
                .await
                .map_err(|e| StatusStoreError::ReadFailed {
                    agent_id: agent_id.to_string(),
                    reason: format!("invalid response body: {e}"),
                })?;

        let status =
            AgentStatus::parse(&parsed.status).ok_or_else(|| StatusStoreError::ReadFailed {
                agent_id: agent_id.to_string(),
                reason: format!("unrecognized status '{}'", parsed.status),
            })?;

        Ok(StatusSnapshot {
            agent_id: agent_id.to_string(),
            status,
            execution_id: parsed.execution_id,
            updated_at: parsed.updated_at,
        })
    }
}
