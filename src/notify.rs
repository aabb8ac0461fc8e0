//! Non-blocking user notifications.
//!
//! Every user-facing outcome (enqueue success, acknowledgment failure,
//! compensation failure, generation completion) is reported through a
//! [`Notifier`]. Implementations must not block the caller.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{FaultPayload, LifecycleFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultPayload>,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Success, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, title, message)
    }

    fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            agent_id: None,
            fault: None,
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_fault(mut self, fault: LifecycleFault) -> Self {
        self.fault = Some(FaultPayload::new(fault, self.message.clone()));
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let agent_id = notification.agent_id.as_deref().unwrap_or("-");
        let code = notification
            .fault
            .as_ref()
            .map(|fault| fault.code)
            .unwrap_or("-");
        match notification.severity {
            Severity::Error => tracing::error!(
                agent_id,
                code,
                "{}: {}",
                notification.title,
                notification.message
            ),
            Severity::Info | Severity::Success => tracing::info!(
                agent_id,
                "{}: {}",
                notification.title,
                notification.message
            ),
        }
    }
}

/// Forwards notifications over an unbounded channel to a presentation layer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification dropped: receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_forwards_in_order() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        notifier.notify(Notification::info("a", "first"));
        notifier.notify(Notification::error("b", "second").for_agent("A1"));

        assert_eq!(rx.try_recv().unwrap().message, "first");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.severity, Severity::Error);
        assert_eq!(second.agent_id.as_deref(), Some("A1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let (notifier, rx) = ChannelNotifier::channel();
        drop(rx);
        notifier.notify(Notification::success("done", "ok"));
    }

    #[test]
    fn fault_payload_copies_message() {
        let notification =
            Notification::error("Boot failed", "E_OOM").with_fault(LifecycleFault::AckFailure);
        let fault = notification.fault.unwrap();
        assert_eq!(fault.code, "ack.failure");
        assert_eq!(fault.message, "E_OOM");
    }
}
