//! personactl: lifecycle commands and acknowledgments for persona agents.
//!
//! Commands (`start`, `stop`, `update`) are sent to a remote executor through
//! a queue after the agent's status is parked at `unknown`. Acknowledgments
//! and avatar generation notices come back through a per-user inbox that is
//! polled, deduplicated, and routed to the status reconciler or the
//! generation tracker.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod generation;
pub mod inbox;
pub mod notify;
pub mod protocol;
pub mod settings;
pub mod status;
pub mod transport;

pub use crate::coordinator::{Collaborators, Coordinator, CoordinatorSettings, Scope};
pub use crate::error::{Error, Result};
