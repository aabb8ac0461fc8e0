//! Error types for personactl.

use serde::Serialize;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Status store error: {0}")]
    StatusStore(#[from] StatusStoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Generation marker error: {0}")]
    Marker(#[from] MarkerError),
}

/// Lifecycle fault taxonomy reported to operators and notification surfaces.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleFault {
    /// The pre-command status update failed; nothing was sent.
    DispatchAbort,
    /// The remote executor acknowledged a command with `success=false`.
    AckFailure,
    /// Reverting an agent to a safe status failed.
    CompensationFailure,
    /// A poll tick failed at the transport level; retried next tick.
    PollTransientError,
    /// An inbox message body could not be parsed.
    MalformedEvent,
    /// An event was already processed in this scope.
    DuplicateEvent,
}

impl LifecycleFault {
    pub fn code(self) -> &'static str {
        match self {
            Self::DispatchAbort => "dispatch.abort",
            Self::AckFailure => "ack.failure",
            Self::CompensationFailure => "compensation.failure",
            Self::PollTransientError => "poll.transient",
            Self::MalformedEvent => "event.malformed",
            Self::DuplicateEvent => "event.duplicate",
        }
    }

    /// Whether the fault is shown to the user as a notification.
    pub fn surfaces_to_user(self) -> bool {
        matches!(
            self,
            Self::DispatchAbort | Self::AckFailure | Self::CompensationFailure
        )
    }

    /// Whether the fault resolves itself on a later attempt without intervention.
    pub fn retryable(self) -> bool {
        matches!(self, Self::PollTransientError)
    }
}

/// Structured fault payload for logs and notification detail.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FaultPayload {
    pub fault: LifecycleFault,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl FaultPayload {
    pub fn new(fault: LifecycleFault, message: impl Into<String>) -> Self {
        Self {
            fault,
            code: fault.code(),
            retryable: fault.retryable(),
            message: message.into(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Queue transport errors (outbound commands and inbound inbox).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Queue {0} is closed")]
    Closed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the external runtime status store.
#[derive(Debug, thiserror::Error)]
pub enum StatusStoreError {
    #[error("Status update for agent {agent_id} failed: {reason}")]
    UpdateFailed { agent_id: String, reason: String },

    #[error("Status read for agent {agent_id} failed: {reason}")]
    ReadFailed { agent_id: String, reason: String },

    #[error("Status update for agent {agent_id} returned no execution id")]
    MissingExecutionId { agent_id: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Command dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Missing required data: {0}")]
    MissingData(&'static str),

    #[error("Status update for agent {agent_id} did not commit; command not sent: {source}")]
    StatusAbort {
        agent_id: String,
        #[source]
        source: StatusStoreError,
    },

    #[error("Agent definition for {agent_id} could not be saved: {reason}")]
    DefinitionRejected { agent_id: String, reason: String },

    #[error("Failed to enqueue {action} for agent {agent_id}: {source}")]
    EnqueueFailed {
        action: String,
        agent_id: String,
        #[source]
        source: TransportError,
    },
}

/// Resumability marker persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("Failed to access marker file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode generation marker: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an error into the lifecycle fault taxonomy.
    ///
    /// Configuration and marker errors are local failures with no lifecycle
    /// counterpart.
    pub fn fault(&self) -> Option<LifecycleFault> {
        match self {
            Self::Dispatch(_) | Self::StatusStore(_) => Some(LifecycleFault::DispatchAbort),
            Self::Transport(TransportError::InvalidResponse { .. })
            | Self::Transport(TransportError::Json(_)) => Some(LifecycleFault::MalformedEvent),
            Self::Transport(_) => Some(LifecycleFault::PollTransientError),
            Self::Config(_) | Self::Marker(_) => None,
        }
    }

    pub fn to_fault_payload(&self) -> Option<FaultPayload> {
        self.fault()
            .map(|fault| FaultPayload::new(fault, self.to_string()))
    }
}
