//! Wiring of the lifecycle components around shared state.
//!
//! One [`Coordinator`] per process owns the status reconciler and the
//! deduplicator. Each polling [`Scope`] gets its own poller (and, when bound to
//! an agent, its own generation tracker) on top of that shared state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{AgentDefinitionStore, CommandDispatcher};
use crate::error::DispatchError;
use crate::generation::{GenerationTracker, MarkerStore};
use crate::inbox::{Deduplicator, EventRouter, InboxPoller, PollScope};
use crate::notify::Notifier;
use crate::status::{AcknowledgmentHandler, StatusReconciler, StatusStore};
use crate::transport::{CommandQueue, EventInbox};

/// External collaborators the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StatusStore>,
    pub queue: Arc<dyn CommandQueue>,
    pub inbox: Arc<dyn EventInbox>,
    pub markers: Arc<dyn MarkerStore>,
    pub definitions: Option<Arc<dyn AgentDefinitionStore>>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub stuck_after: Option<Duration>,
    pub marker_ttl: Option<Duration>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            batch_size: 10,
            stuck_after: Some(Duration::from_secs(300)),
            marker_ttl: Some(Duration::from_secs(1800)),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll.interval,
            batch_size: config.poll.batch_size,
            stuck_after: config.poll.stuck_after,
            marker_ttl: config.generation.marker_ttl,
        }
    }
}

pub struct Coordinator {
    collaborators: Collaborators,
    settings: CoordinatorSettings,
    reconciler: Arc<StatusReconciler>,
    dedup: Arc<Deduplicator>,
    acks: Arc<AcknowledgmentHandler>,
}

impl Coordinator {
    pub fn new(collaborators: Collaborators, settings: CoordinatorSettings) -> Self {
        let reconciler = Arc::new(StatusReconciler::new());
        let acks = Arc::new(AcknowledgmentHandler::new(
            collaborators.store.clone(),
            reconciler.clone(),
            collaborators.notifier.clone(),
        ));
        Self {
            collaborators,
            settings,
            reconciler,
            dedup: Arc::new(Deduplicator::new()),
            acks,
        }
    }

    pub fn reconciler(&self) -> Arc<StatusReconciler> {
        self.reconciler.clone()
    }

    pub fn deduplicator(&self) -> Arc<Deduplicator> {
        self.dedup.clone()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        let dispatcher = CommandDispatcher::new(
            self.collaborators.store.clone(),
            self.collaborators.queue.clone(),
            self.reconciler.clone(),
            self.dedup.clone(),
            self.collaborators.notifier.clone(),
        );
        match &self.collaborators.definitions {
            Some(definitions) => dispatcher.with_definitions(definitions.clone()),
            None => dispatcher,
        }
    }

    /// Generation tracker for one agent, sharing this coordinator's dedup set.
    pub fn tracker(&self, user_id: &str, agent_id: &str) -> GenerationTracker {
        GenerationTracker::new(
            user_id,
            agent_id,
            self.collaborators.queue.clone(),
            self.collaborators.markers.clone(),
            self.dedup.clone(),
            self.collaborators.notifier.clone(),
        )
        .with_marker_ttl(self.settings.marker_ttl)
    }

    /// Build the polling scope for a user, optionally narrowed to one agent.
    pub async fn scope(&self, user_id: &str, agent_id: Option<&str>) -> Result<Scope, DispatchError> {
        if user_id.trim().is_empty() {
            return Err(DispatchError::MissingData("userId"));
        }
        let agent_id = agent_id.filter(|id| !id.trim().is_empty());

        let mut router = EventRouter::new(
            self.acks.clone(),
            self.collaborators.store.clone(),
            self.reconciler.clone(),
        );
        let tracker = agent_id.map(|agent_id| Arc::new(self.tracker(user_id, agent_id)));
        if let Some(tracker) = &tracker {
            router = router.with_generation(tracker.clone());
        }

        let poll_scope = match agent_id {
            Some(agent_id) => {
                self.reconciler
                    .seed_from_store(self.collaborators.store.as_ref(), agent_id)
                    .await;
                PollScope::agent(user_id, agent_id)
            }
            None => PollScope::user(user_id),
        };

        let poller = InboxPoller::new(
            poll_scope,
            self.collaborators.inbox.clone(),
            self.dedup.clone(),
            router,
            self.reconciler.clone(),
        )
        .with_batch_size(self.settings.batch_size)
        .with_stuck_after(self.settings.stuck_after);

        Ok(Scope {
            poller: Arc::new(poller),
            tracker,
            interval: self.settings.poll_interval,
        })
    }
}

/// A polling scope: one poller, plus a generation tracker when agent-bound.
pub struct Scope {
    poller: Arc<InboxPoller>,
    tracker: Option<Arc<GenerationTracker>>,
    interval: Duration,
}

impl Scope {
    pub fn poller(&self) -> &Arc<InboxPoller> {
        &self.poller
    }

    pub fn tracker(&self) -> Option<&Arc<GenerationTracker>> {
        self.tracker.as_ref()
    }

    /// Start the poll loop on the runtime.
    pub fn spawn(&self) -> ScopeHandle {
        let (shutdown, rx) = watch::channel(false);
        let poller = self.poller.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move { poller.run(interval, rx).await });
        ScopeHandle { shutdown, task }
    }
}

/// Running poll loop; dropping it without `stop` also ends the loop.
pub struct ScopeHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScopeHandle {
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Poll loop ended abnormally: {}", e);
        }
    }
}
