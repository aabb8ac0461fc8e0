//! Wire types exchanged with the remote execution backend.

mod command;
mod event;

pub use self::command::{Command, CommandAction, GenerationAction, GenerationRequest, Outbound};
pub use self::event::{
    AckAction, Acknowledgment, Event, EventParseError, GenerationNotice, IdempotencyKey,
    NoticeKind,
};
