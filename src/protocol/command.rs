//! Outbound messages sent to the remote execution backend.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::AckAction;

/// Lifecycle action carried by a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Boot,
    Stop,
    Update,
}

impl CommandAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Stop => "stop",
            Self::Update => "update",
        }
    }

    /// Acknowledgment the backend answers this action with.
    pub fn acknowledged_by(self) -> AckAction {
        match self {
            Self::Boot => AckAction::BootAck,
            Self::Stop => AckAction::StopAck,
            Self::Update => AckAction::UpdateAck,
        }
    }
}

impl std::fmt::Display for CommandAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle command. Immutable once built; no retry state is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub action: CommandAction,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl Command {
    pub fn new(action: CommandAction, agent_id: impl Into<String>) -> Self {
        Self {
            action,
            agent_id: agent_id.into(),
            user_id: None,
            execution_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationAction {
    #[serde(rename = "generate_avatar")]
    GenerateAvatar,
}

/// Request to start a long-running avatar generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub action: GenerationAction,
    pub agent_id: String,
    pub user_id: String,
    pub prompt: String,
    pub task_id: Uuid,
}

impl GenerationRequest {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        task_id: Uuid,
    ) -> Self {
        Self {
            action: GenerationAction::GenerateAvatar,
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            prompt: prompt.into(),
            task_id,
        }
    }
}

/// Anything placed on the outbound command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Lifecycle(Command),
    Generation(GenerationRequest),
}

impl Outbound {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::Lifecycle(command) => &command.agent_id,
            Self::Generation(request) => &request.agent_id,
        }
    }

    /// Wire name of the action, used in logs and error messages.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::Lifecycle(command) => command.action.as_str(),
            Self::Generation(_) => "generate_avatar",
        }
    }
}

impl From<Command> for Outbound {
    fn from(command: Command) -> Self {
        Self::Lifecycle(command)
    }
}

impl From<GenerationRequest> for Outbound {
    fn from(request: GenerationRequest) -> Self {
        Self::Generation(request)
    }
}
