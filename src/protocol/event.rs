//! Inbound events delivered through the per-user inbox.
//!
//! Two shapes arrive on the same channel: acknowledgments keyed by an
//! `action` field (`bootACK`, `stopACK`, `updateACK`) and avatar generation
//! notices keyed by `event_type` (`progress`, `final`). Both decode into the
//! [`Event`] sum type so consumers match exhaustively.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::protocol::CommandAction;
use crate::status::AgentStatus;

/// Acknowledged lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckAction {
    #[serde(rename = "bootACK")]
    BootAck,
    #[serde(rename = "stopACK")]
    StopAck,
    #[serde(rename = "updateACK")]
    UpdateAck,
}

impl AckAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootAck => "bootACK",
            Self::StopAck => "stopACK",
            Self::UpdateAck => "updateACK",
        }
    }

    /// The command this acknowledgment answers.
    pub fn command(self) -> CommandAction {
        match self {
            Self::BootAck => CommandAction::Boot,
            Self::StopAck => CommandAction::Stop,
            Self::UpdateAck => CommandAction::Update,
        }
    }

    /// Status committed when the acknowledgment reports success.
    pub fn target_status(self) -> AgentStatus {
        match self {
            Self::BootAck | Self::UpdateAck => AgentStatus::Running,
            Self::StopAck => AgentStatus::Stopped,
        }
    }
}

/// Confirmation (or refusal) of a previously sent command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub action: AckAction,
    pub agent_id: String,
    pub user_id: String,
    #[serde(deserialize_with = "deserialize_flag", serialize_with = "serialize_flag")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Progress,
    Final,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Final => "final",
        }
    }
}

/// Progress or completion notice for a long-running avatar generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationNotice {
    #[serde(rename = "event_type")]
    pub kind: NoticeKind,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub image_url: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acknowledgment(Acknowledgment),
    Generation(GenerationNotice),
}

/// Reasons an inbox body fails to decode.
#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("body carries neither `action` nor `event_type`")]
    UnknownShape,

    #[error("invalid {shape} event: {source}")]
    InvalidField {
        shape: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Event {
    /// Decode an inbox message body.
    pub fn parse(body: &str) -> Result<Self, EventParseError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(EventParseError::InvalidJson)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, EventParseError> {
        let Some(object) = value.as_object() else {
            return Err(EventParseError::UnknownShape);
        };

        if object.contains_key("action") {
            serde_json::from_value(value)
                .map(Self::Acknowledgment)
                .map_err(|source| EventParseError::InvalidField {
                    shape: "acknowledgment",
                    source,
                })
        } else if object.contains_key("event_type") {
            serde_json::from_value(value)
                .map(Self::Generation)
                .map_err(|source| EventParseError::InvalidField {
                    shape: "generation",
                    source,
                })
        } else {
            Err(EventParseError::UnknownShape)
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            Self::Acknowledgment(ack) => serde_json::to_value(ack),
            Self::Generation(notice) => serde_json::to_value(notice),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Acknowledgment(ack) => &ack.agent_id,
            Self::Generation(notice) => &notice.agent_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Acknowledgment(ack) => &ack.user_id,
            Self::Generation(notice) => &notice.user_id,
        }
    }

    /// Whether no further events are expected for the command or task.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Acknowledgment(_) => true,
            Self::Generation(notice) => notice.kind == NoticeKind::Final,
        }
    }

    /// Derive the key used to recognize redeliveries.
    ///
    /// Acknowledgments always key on `action|agentId|userId`. Generation
    /// notices key on the transport message id when one is supplied and fall
    /// back to `kind|agentId|userId|imageUrl`, which collapses distinct
    /// progress notices that share an image URL.
    pub fn idempotency_key(&self, message_id: Option<&str>) -> IdempotencyKey {
        match self {
            Self::Acknowledgment(ack) => {
                IdempotencyKey::acknowledgment(ack.action, &ack.agent_id, &ack.user_id)
            }
            Self::Generation(notice) => match message_id.filter(|id| !id.is_empty()) {
                Some(id) => IdempotencyKey(format!(
                    "{}|{}|{}|msg:{}",
                    notice.kind.as_str(),
                    notice.agent_id,
                    notice.user_id,
                    id
                )),
                None => IdempotencyKey(format!(
                    "{}|{}|{}|{}",
                    notice.kind.as_str(),
                    notice.agent_id,
                    notice.user_id,
                    notice.image_url
                )),
            },
        }
    }
}

/// Content-derived key identifying one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key every delivery of this acknowledgment shares.
    pub fn acknowledgment(action: AckAction, agent_id: &str, user_id: &str) -> Self {
        Self(format!("{}|{}|{}", action.as_str(), agent_id, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The backend sends `success` as the strings `"true"`/`"false"`; plain
/// booleans are accepted as well.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected \"true\" or \"false\", got \"{other}\""
            ))),
        },
    }
}

fn serialize_flag<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(if *value { "true" } else { "false" })
}
