//! Acknowledgment handling: commit on success, compensate on failure.
//!
//! ```text
//! Stopped --start--> Unknown --bootACK(ok)---> Running
//! Running --stop---> Unknown --stopACK(ok)---> Stopped
//! Running --update-> Unknown --updateACK(ok)-> Running
//! Unknown --*ACK(failed)---------------------> Stopped
//! ```
//!
//! Every failed acknowledgment drives the agent to `Stopped`, including a
//! failed update. A failed revert is reported and left for the operator.

use std::sync::Arc;

use crate::error::LifecycleFault;
use crate::notify::{Notification, Notifier};
use crate::protocol::{AckAction, Acknowledgment};
use crate::status::{AgentStatus, StatusReconciler, StatusStore};

/// Status every failed acknowledgment compensates to.
const SAFE_STATUS: AgentStatus = AgentStatus::Stopped;

/// What handling an acknowledgment did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Success acknowledged; terminal status committed.
    Committed(AgentStatus),
    /// Failure acknowledged; agent reverted to the safe status.
    Compensated { error_code: Option<String> },
    /// Failure acknowledged but the revert itself failed; status left as is.
    CompensationFailed { error_code: Option<String> },
}

pub struct AcknowledgmentHandler {
    store: Arc<dyn StatusStore>,
    reconciler: Arc<StatusReconciler>,
    notifier: Arc<dyn Notifier>,
}

fn past_tense(action: AckAction) -> &'static str {
    match action {
        AckAction::BootAck => "started",
        AckAction::StopAck => "stopped",
        AckAction::UpdateAck => "updated",
    }
}

impl AcknowledgmentHandler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        reconciler: Arc<StatusReconciler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            reconciler,
            notifier,
        }
    }

    pub async fn handle(&self, ack: &Acknowledgment) -> AckOutcome {
        if ack.success {
            self.commit_success(ack).await
        } else {
            self.compensate(ack).await
        }
    }

    async fn commit_success(&self, ack: &Acknowledgment) -> AckOutcome {
        let target = ack.action.target_status();

        // The acknowledgment is authoritative; a failed write only leaves the
        // store stale until its next update.
        if let Err(e) = self.store.set_status(&ack.agent_id, target).await {
            tracing::warn!(
                agent_id = %ack.agent_id,
                status = %target,
                "Failed to persist acknowledged status: {}",
                e
            );
        }

        self.reconciler.commit(&ack.agent_id, target).await;
        tracing::info!(
            agent_id = %ack.agent_id,
            user_id = %ack.user_id,
            action = ack.action.as_str(),
            status = %target,
            "Acknowledgment committed"
        );
        self.notifier.notify(
            Notification::success(
                format!("Agent {}", past_tense(ack.action)),
                format!("Agent {} is now {}", ack.agent_id, target),
            )
            .for_agent(&ack.agent_id),
        );

        AckOutcome::Committed(target)
    }

    async fn compensate(&self, ack: &Acknowledgment) -> AckOutcome {
        let error_code = ack.error_code.clone();
        let detail = match &error_code {
            Some(code) => format!(
                "{} for agent {} failed: {}",
                ack.action.command(),
                ack.agent_id,
                code
            ),
            None => format!("{} for agent {} failed", ack.action.command(), ack.agent_id),
        };
        tracing::warn!(
            agent_id = %ack.agent_id,
            action = ack.action.as_str(),
            error_code = error_code.as_deref().unwrap_or("-"),
            "Command failed remotely; compensating to {}",
            SAFE_STATUS
        );
        self.notifier.notify(
            Notification::error("Agent command failed", detail)
                .for_agent(&ack.agent_id)
                .with_fault(LifecycleFault::AckFailure),
        );

        match self.store.set_status(&ack.agent_id, SAFE_STATUS).await {
            Ok(_) => {
                self.reconciler.compensate(&ack.agent_id, SAFE_STATUS).await;
                AckOutcome::Compensated { error_code }
            }
            Err(e) => {
                tracing::error!(
                    agent_id = %ack.agent_id,
                    "Compensation to {} failed: {}",
                    SAFE_STATUS,
                    e
                );
                self.notifier.notify(
                    Notification::error(
                        "Agent status could not be reverted",
                        format!("Agent {} may be in an indeterminate state: {}", ack.agent_id, e),
                    )
                    .for_agent(&ack.agent_id)
                    .with_fault(LifecycleFault::CompensationFailure),
                );
                AckOutcome::CompensationFailed { error_code }
            }
        }
    }
}
