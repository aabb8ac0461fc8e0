//! Inbound side: polling, deduplication and routing of inbox events.

mod dedup;
mod poller;
mod router;

pub use self::dedup::Deduplicator;
pub use self::poller::{InboxPoller, PollOutcome, PollScope, PollStats};
pub use self::router::{EventRouter, RouteOutcome};
