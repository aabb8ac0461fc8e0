//! Outbound lifecycle commands.
//!
//! Every command is preceded by a status update that marks the agent
//! `unknown` in the store and mints the execution id the command carries. If
//! that update does not commit, nothing is sent. If it commits but the send
//! fails, the agent is rolled back to the status it held before.

mod definition;

use std::sync::Arc;

use crate::error::{DispatchError, LifecycleFault, StatusStoreError};
use crate::inbox::Deduplicator;
use crate::notify::{Notification, Notifier};
use crate::protocol::{Command, CommandAction, IdempotencyKey, Outbound};
use crate::status::{AgentStatus, StatusReconciler, StatusStore};
use crate::transport::CommandQueue;

pub use self::definition::{AgentDefinitionStore, HttpDefinitionStore, MemoryDefinitionStore};

pub struct CommandDispatcher {
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn CommandQueue>,
    reconciler: Arc<StatusReconciler>,
    dedup: Arc<Deduplicator>,
    notifier: Arc<dyn Notifier>,
    definitions: Option<Arc<dyn AgentDefinitionStore>>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn CommandQueue>,
        reconciler: Arc<StatusReconciler>,
        dedup: Arc<Deduplicator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            queue,
            reconciler,
            dedup,
            notifier,
            definitions: None,
        }
    }

    pub fn with_definitions(mut self, definitions: Arc<dyn AgentDefinitionStore>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub async fn start_agent(&self, user_id: &str, agent_id: &str) -> Result<Command, DispatchError> {
        self.dispatch(CommandAction::Boot, user_id, agent_id).await
    }

    pub async fn stop_agent(&self, user_id: &str, agent_id: &str) -> Result<Command, DispatchError> {
        self.dispatch(CommandAction::Stop, user_id, agent_id).await
    }

    /// Save the new definition, then send `update`.
    pub async fn update_agent(
        &self,
        user_id: &str,
        agent_id: &str,
        definition: &serde_json::Value,
    ) -> Result<Command, DispatchError> {
        self.require_ids(user_id, agent_id)?;

        if let Some(definitions) = &self.definitions
            && let Err(e) = definitions.save_definition(agent_id, definition).await
        {
            tracing::warn!(agent_id, "Agent definition rejected: {}", e);
            self.notifier.notify(
                Notification::error("Agent update failed", e.to_string())
                    .for_agent(agent_id)
                    .with_fault(LifecycleFault::DispatchAbort),
            );
            return Err(e);
        }

        self.dispatch(CommandAction::Update, user_id, agent_id).await
    }

    fn require_ids(&self, user_id: &str, agent_id: &str) -> Result<(), DispatchError> {
        let missing = if user_id.trim().is_empty() {
            Some("userId")
        } else if agent_id.trim().is_empty() {
            Some("agentId")
        } else {
            None
        };
        match missing {
            Some(field) => {
                self.notifier.notify(Notification::error(
                    "Missing data",
                    format!("Cannot send an agent command without {field}"),
                ));
                Err(DispatchError::MissingData(field))
            }
            None => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        action: CommandAction,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Command, DispatchError> {
        self.require_ids(user_id, agent_id)?;

        let execution_id = match self.store.set_status(agent_id, AgentStatus::Unknown).await {
            Ok(update) => match update.execution_id {
                Some(execution_id) => execution_id,
                None => {
                    self.restore_store(agent_id, self.reconciler.read(agent_id).await)
                        .await;
                    return Err(self.abort(
                        action,
                        agent_id,
                        StatusStoreError::MissingExecutionId {
                            agent_id: agent_id.to_string(),
                        },
                    ));
                }
            },
            Err(e) => return Err(self.abort(action, agent_id, e)),
        };

        let previous = self
            .reconciler
            .mark_dispatched(agent_id, Some(execution_id.clone()))
            .await;

        // The answer to this command shares its key with earlier answers.
        let expected = IdempotencyKey::acknowledgment(action.acknowledged_by(), agent_id, user_id);
        self.dedup.forget(agent_id, &expected).await;

        let command = Command::new(action, agent_id)
            .with_user(user_id)
            .with_execution_id(&execution_id);
        if let Err(source) = self.queue.send(&Outbound::from(command.clone())).await {
            self.reconciler.rollback(agent_id, previous).await;
            self.restore_store(agent_id, previous).await;

            let err = DispatchError::EnqueueFailed {
                action: action.to_string(),
                agent_id: agent_id.to_string(),
                source,
            };
            tracing::warn!(agent_id, execution_id = %execution_id, "{}", err);
            self.notifier.notify(
                Notification::error("Agent command not sent", err.to_string())
                    .for_agent(agent_id)
                    .with_fault(LifecycleFault::DispatchAbort),
            );
            return Err(err);
        }

        tracing::info!(
            agent_id,
            user_id,
            action = action.as_str(),
            execution_id = %execution_id,
            "Command dispatched"
        );
        self.notifier.notify(
            Notification::info(
                "Agent command sent",
                format!("{action} requested for agent {agent_id}"),
            )
            .for_agent(agent_id),
        );
        Ok(command)
    }

    fn abort(
        &self,
        action: CommandAction,
        agent_id: &str,
        source: StatusStoreError,
    ) -> DispatchError {
        let err = DispatchError::StatusAbort {
            agent_id: agent_id.to_string(),
            source,
        };
        tracing::warn!(agent_id, action = action.as_str(), "{}", err);
        self.notifier.notify(
            Notification::error("Agent command not sent", err.to_string())
                .for_agent(agent_id)
                .with_fault(LifecycleFault::DispatchAbort),
        );
        err
    }

    async fn restore_store(&self, agent_id: &str, status: AgentStatus) {
        if let Err(e) = self.store.set_status(agent_id, status).await {
            tracing::warn!(agent_id, status = %status, "Failed to restore runtime status: {}", e);
        }
    }
}
