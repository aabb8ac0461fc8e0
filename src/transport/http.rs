//! HTTP queue gateway client.
//!
//! - `POST {base}/commands` enqueues one outbound message.
//! - `GET {base}/inbox/{userId}?max=N` returns `{"messages": [...]}` where each
//!   entry has `receiptHandle`, optional `messageId`, and `body` (a JSON
//!   string or an inline object).
//! - `POST {base}/inbox/{userId}/delete` with `{"receiptHandles": [...]}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::TransportError;
use crate::protocol::Outbound;
use crate::transport::{CommandQueue, EventInbox, InboxMessage};

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(alias = "receipt_handle", alias = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(default, alias = "message_id", alias = "MessageId")]
    message_id: Option<String>,
    #[serde(alias = "Body")]
    body: serde_json::Value,
}

impl WireMessage {
    fn into_inbox_message(self) -> InboxMessage {
        let body = match self.body {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        };
        InboxMessage {
            receipt: self.receipt_handle,
            message_id: self.message_id,
            body,
        }
    }
}

/// Queue transport over the HTTP gateway.
pub struct HttpQueue {
    base_url: String,
    client: Client,
    token: Option<SecretString>,
}

impl HttpQueue {
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

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn ensure_success(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::UnexpectedStatus {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CommandQueue for HttpQueue {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        let endpoint = format!("{}/commands", self.base_url);
        let response = self
            .authorize(self.client.post(&endpoint))
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        Self::ensure_success(&endpoint, response).await?;

        tracing::debug!(
            agent_id = message.agent_id(),
            action = message.action_name(),
            "Command enqueued"
        );
        Ok(())
    }
}

#[async_trait]
impl EventInbox for HttpQueue {
    async fn receive(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<Vec<InboxMessage>, TransportError> {
        let endpoint = format!("{}/inbox/{}", self.base_url, user_id);
        let response = self
            .authorize(self.client.get(&endpoint))
            .query(&[("max", max_messages)])
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        let response = Self::ensure_success(&endpoint, response).await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: ReceiveResponse =
            serde_json::from_str(&text).map_err(|e| TransportError::InvalidResponse {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(parsed
            .messages
            .into_iter()
            .map(WireMessage::into_inbox_message)
            .collect())
    }

    async fn delete(&self, user_id: &str, receipts: &[String]) -> Result<(), TransportError> {
        if receipts.is_empty() {
            return Ok(());
        }
        let endpoint = format!("{}/inbox/{}/delete", self.base_url, user_id);
        let response = self
            .authorize(self.client.post(&endpoint))
            .json(&serde_json::json!({ "receiptHandles": receipts }))
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        Self::ensure_success(&endpoint, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_accepts_string_and_inline_bodies() {
        let parsed: ReceiveResponse = serde_json::from_str(
            r#"{"messages":[
                {"receiptHandle":"r1","messageId":"m1","body":"{\"action\":\"bootACK\"}"},
                {"ReceiptHandle":"r2","Body":{"event_type":"final"}}
            ]}"#,
        )
        .unwrap();

        let messages: Vec<InboxMessage> = parsed
            .messages
            .into_iter()
            .map(WireMessage::into_inbox_message)
            .collect();

        assert_eq!(messages[0].body, r#"{"action":"bootACK"}"#);
        assert_eq!(messages[0].message_id.as_deref(), Some("m1"));
        assert_eq!(messages[1].receipt, "r2");
        assert!(messages[1].message_id.is_none());
        assert_eq!(messages[1].body, r#"{"event_type":"final"}"#);
    }

    #[test]
    fn empty_message_list_is_default() {
        let parsed: ReceiveResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.messages.is_empty());
    }
}
