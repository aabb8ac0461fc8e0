//! Queue transport collaborators.
//!
//! Outbound commands go through a [`CommandQueue`]. Inbound events are read
//! from a per-user [`EventInbox`] with at-least-once delivery: a received
//! message stays in the inbox until its receipt is deleted, batches carry no
//! ordering guarantee, and the same event may appear in several batches.

pub mod health;
mod http;
mod memory;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::protocol::Outbound;

pub use self::http::HttpQueue;
pub use self::memory::MemoryQueue;

/// One undeleted message read from the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Handle used to delete this delivery.
    pub receipt: String,
    /// Transport-assigned id, stable across redeliveries when available.
    pub message_id: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError>;
}

#[async_trait]
pub trait EventInbox: Send + Sync {
    /// Receive up to `max_messages` pending messages for the user.
    async fn receive(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<Vec<InboxMessage>, TransportError>;

    /// Delete handled deliveries by receipt.
    async fn delete(&self, user_id: &str, receipts: &[String]) -> Result<(), TransportError>;
}
