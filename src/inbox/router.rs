//! Dispatch of decoded events to their handlers.

use std::sync::Arc;

use crate::generation::{GenerationTracker, NoticeOutcome};
use crate::protocol::Event;
use crate::status::{AckOutcome, AcknowledgmentHandler, StatusReconciler, StatusStore};

/// What routing one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Acknowledged(AckOutcome),
    Generation(NoticeOutcome),
    /// A generation notice arrived in a scope with no tracker.
    Unclaimed,
}

pub struct EventRouter {
    acks: Arc<AcknowledgmentHandler>,
    generation: Option<Arc<GenerationTracker>>,
    store: Arc<dyn StatusStore>,
    reconciler: Arc<StatusReconciler>,
}

impl EventRouter {
    pub fn new(
        acks: Arc<AcknowledgmentHandler>,
        store: Arc<dyn StatusStore>,
        reconciler: Arc<StatusReconciler>,
    ) -> Self {
        Self {
            acks,
            generation: None,
            store,
            reconciler,
        }
    }

    pub fn with_generation(mut self, tracker: Arc<GenerationTracker>) -> Self {
        self.generation = Some(tracker);
        self
    }

    /// Whether this router can apply `event`. Acknowledgments always apply;
    /// generation notices need the tracker for their agent.
    pub fn accepts(&self, event: &Event) -> bool {
        match event {
            Event::Acknowledgment(_) => true,
            Event::Generation(notice) => self
                .generation
                .as_ref()
                .is_some_and(|tracker| tracker.agent_id() == notice.agent_id),
        }
    }

    pub async fn route(&self, event: &Event) -> RouteOutcome {
        let outcome = match event {
            Event::Acknowledgment(ack) => RouteOutcome::Acknowledged(self.acks.handle(ack).await),
            Event::Generation(notice) => match &self.generation {
                Some(tracker) => RouteOutcome::Generation(tracker.handle_notice(notice).await),
                None => {
                    tracing::debug!(
                        agent_id = %notice.agent_id,
                        kind = notice.kind.as_str(),
                        "No generation tracker in scope; notice dropped"
                    );
                    RouteOutcome::Unclaimed
                }
            },
        };

        self.refresh_status(event.agent_id()).await;
        outcome
    }

    /// Best-effort read of the plain status snapshot after every routed event.
    async fn refresh_status(&self, agent_id: &str) {
        match self.store.fetch_status(agent_id).await {
            Ok(snapshot) => self.reconciler.record_snapshot(snapshot).await,
            Err(e) => tracing::debug!(agent_id, "Status refresh failed: {}", e),
        }
    }
}
