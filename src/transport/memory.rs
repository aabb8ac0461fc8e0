//! In-process queue used by tests and `--offline` runs.
//!
//! Undeleted messages are redelivered on every receive, which is the
//! harshest form of at-least-once delivery.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::protocol::{Event, Outbound};
use crate::transport::{CommandQueue, EventInbox, InboxMessage};

struct StoredMessage {
    message_id: String,
    body: String,
}

#[derive(Default)]
struct Inner {
    sent: Vec<Outbound>,
    inboxes: HashMap<String, Vec<StoredMessage>>,
    /// receipt -> (user, message id); one live receipt per message
    receipts: HashMap<String, (String, String)>,
    next_message: u64,
    next_receipt: u64,
    receive_calls: usize,
    fail_sends: usize,
    fail_receives: usize,
    fail_deletes: usize,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the user's inbox. Returns the message id.
    pub async fn push_event(&self, user_id: &str, event: &Event) -> String {
        self.push_raw(user_id, event.to_value().to_string()).await
    }

    /// Deliver a raw body, which need not be valid JSON.
    pub async fn push_raw(&self, user_id: &str, body: impl Into<String>) -> String {
        let mut inner = self.inner.lock().await;
        inner.next_message += 1;
        let message_id = format!("m-{}", inner.next_message);
        inner
            .inboxes
            .entry(user_id.to_string())
            .or_default()
            .push(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
            });
        message_id
    }

    /// Commands and generation requests sent so far.
    pub async fn sent(&self) -> Vec<Outbound> {
        self.inner.lock().await.sent.clone()
    }

    /// Messages still undeleted for the user.
    pub async fn pending(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .inboxes
            .get(user_id)
            .map_or(0, Vec::len)
    }

    pub async fn receive_calls(&self) -> usize {
        self.inner.lock().await.receive_calls
    }

    pub async fn fail_next_sends(&self, count: usize) {
        self.inner.lock().await.fail_sends += count;
    }

    pub async fn fail_next_receives(&self, count: usize) {
        self.inner.lock().await.fail_receives += count;
    }

    pub async fn fail_next_deletes(&self, count: usize) {
        self.inner.lock().await.fail_deletes += count;
    }
}

#[async_trait]
impl CommandQueue for MemoryQueue {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(TransportError::RequestFailed {
                endpoint: "memory://commands".to_string(),
                reason: "scripted send failure".to_string(),
            });
        }
        inner.sent.push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl EventInbox for MemoryQueue {
    async fn receive(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<Vec<InboxMessage>, TransportError> {
        let mut inner = self.inner.lock().await;
        inner.receive_calls += 1;
        if inner.fail_receives > 0 {
            inner.fail_receives -= 1;
            return Err(TransportError::RequestFailed {
                endpoint: format!("memory://inbox/{user_id}"),
                reason: "scripted receive failure".to_string(),
            });
        }

        let batch: Vec<(String, String)> = inner
            .inboxes
            .get(user_id)
            .map(|messages| {
                messages
                    .iter()
                    .take(max_messages)
                    .map(|m| (m.message_id.clone(), m.body.clone()))
                    .collect()
            })
            .unwrap_or_default();

        // A fresh delivery supersedes the receipts of earlier ones.
        inner.receipts.retain(|_, (owner, message_id)| {
            owner.as_str() != user_id || !batch.iter().any(|(id, _)| *id == *message_id)
        });

        let mut delivered = Vec::with_capacity(batch.len());
        for (message_id, body) in batch {
            inner.next_receipt += 1;
            let receipt = format!("r-{}", inner.next_receipt);
            inner
                .receipts
                .insert(receipt.clone(), (user_id.to_string(), message_id.clone()));
            delivered.push(InboxMessage {
                receipt,
                message_id: Some(message_id),
                body,
            });
        }
        Ok(delivered)
    }

    async fn delete(&self, user_id: &str, receipts: &[String]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_deletes > 0 {
            inner.fail_deletes -= 1;
            return Err(TransportError::RequestFailed {
                endpoint: format!("memory://inbox/{user_id}/delete"),
                reason: "scripted delete failure".to_string(),
            });
        }

        for receipt in receipts {
            let Some((owner, message_id)) = inner.receipts.remove(receipt) else {
                continue;
            };
            if owner != user_id {
                continue;
            }
            if let Some(messages) = inner.inboxes.get_mut(&owner) {
                messages.retain(|m| m.message_id != message_id);
            }
        }
        Ok(())
    }
}
