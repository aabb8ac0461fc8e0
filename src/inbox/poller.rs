//! Interval-driven inbox consumption for one `(user, agent?)` scope.
//!
//! Each tick receives a batch, routes every new event, and only then deletes
//! the receipts it handled. Generation notices the scope has no tracker for
//! are left undeleted for the scope that owns them. A tick that starts while
//! another is in flight returns immediately without touching the transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};

use crate::error::{LifecycleFault, TransportError};
use crate::inbox::{Deduplicator, EventRouter};
use crate::protocol::Event;
use crate::status::StatusReconciler;
use crate::transport::{EventInbox, InboxMessage};

const MAX_BODY_PREVIEW: usize = 200;
/// Receives per tick when deferred events fill the batch.
const MAX_PAGES: usize = 4;

/// The user whose inbox is read, optionally narrowed to one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollScope {
    pub user_id: String,
    pub agent_id: Option<String>,
}

impl PollScope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: None,
        }
    }

    pub fn agent(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: Some(agent_id.into()),
        }
    }

    /// Whether `agent_id` falls inside this scope.
    pub fn claims(&self, agent_id: &str) -> bool {
        self.agent_id.as_deref().is_none_or(|own| own == agent_id)
    }
}

/// Counters for one completed tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    pub routed: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// Generation notices this scope does not track, left in the inbox.
    pub deferred: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another tick was still in flight.
    Skipped,
    Polled(PollStats),
    /// The inbox could not be read; retried on the next tick.
    Failed,
}

pub struct InboxPoller {
    scope: PollScope,
    inbox: Arc<dyn EventInbox>,
    dedup: Arc<Deduplicator>,
    router: EventRouter,
    reconciler: Arc<StatusReconciler>,
    batch_size: usize,
    stuck_after: Option<Duration>,
    in_flight: Mutex<()>,
    events: RwLock<Vec<Event>>,
}

impl InboxPoller {
    pub fn new(
        scope: PollScope,
        inbox: Arc<dyn EventInbox>,
        dedup: Arc<Deduplicator>,
        router: EventRouter,
        reconciler: Arc<StatusReconciler>,
    ) -> Self {
        Self {
            scope,
            inbox,
            dedup,
            router,
            reconciler,
            batch_size: 10,
            stuck_after: None,
            in_flight: Mutex::new(()),
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Warn about commands unacknowledged for longer than `threshold`.
    pub fn with_stuck_after(mut self, threshold: Option<Duration>) -> Self {
        self.stuck_after = threshold;
        self
    }

    pub fn scope(&self) -> &PollScope {
        &self.scope
    }

    /// Routed events in arrival order, each at most once.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Run one tick. Never fails; transport errors are logged and retried next tick.
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!(user_id = %self.scope.user_id, "Poll already in flight; skipping tick");
            return PollOutcome::Skipped;
        };

        match self.drain_batch().await {
            Ok(stats) => PollOutcome::Polled(stats),
            Err(e) => {
                tracing::warn!(
                    user_id = %self.scope.user_id,
                    code = LifecycleFault::PollTransientError.code(),
                    "Inbox poll failed: {}",
                    e
                );
                PollOutcome::Failed
            }
        }
    }

    async fn drain_batch(&self) -> Result<PollStats, TransportError> {
        let mut stats = PollStats::default();
        let mut seen = HashSet::new();
        let mut window = self.batch_size;

        for page in 0..MAX_PAGES {
            let batch = match self.inbox.receive(&self.scope.user_id, window).await {
                Ok(batch) => batch,
                Err(e) if page == 0 => return Err(e),
                Err(e) => {
                    tracing::debug!(user_id = %self.scope.user_id, page, "Stopped paging inbox: {}", e);
                    break;
                }
            };
            let full = batch.len() >= window;
            let deferred_before = stats.deferred;

            let handled = self.handle_page(batch, &mut seen, &mut stats).await;
            self.delete_handled(&handled, &mut stats).await;

            // Deferred events stay at the head of the inbox; widen the next
            // receive past them while the page came back full of them.
            if !full || stats.deferred == deferred_before {
                break;
            }
            window = self.batch_size + stats.deferred;
        }

        Ok(stats)
    }

    /// Route the unseen messages of one page. Returns the receipts to delete.
    async fn handle_page(
        &self,
        batch: Vec<InboxMessage>,
        seen: &mut HashSet<String>,
        stats: &mut PollStats,
    ) -> Vec<String> {
        let mut handled = Vec::with_capacity(batch.len());

        for message in batch {
            let identity = message
                .message_id
                .clone()
                .unwrap_or_else(|| message.receipt.clone());
            if !seen.insert(identity) {
                continue;
            }
            stats.received += 1;

            let event = match Event::parse(&message.body) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        user_id = %self.scope.user_id,
                        code = LifecycleFault::MalformedEvent.code(),
                        body = %preview(&message.body),
                        "Dropping malformed event: {}",
                        e
                    );
                    stats.malformed += 1;
                    handled.push(message.receipt);
                    continue;
                }
            };

            // Acknowledgments for any of the user's agents feed the shared
            // status map; generation notices wait for the scope tracking them.
            if !self.router.accepts(&event) {
                stats.deferred += 1;
                continue;
            }

            let key = event.idempotency_key(message.message_id.as_deref());
            if !self.dedup.check_and_insert(event.agent_id(), key.clone()).await {
                tracing::debug!(
                    agent_id = event.agent_id(),
                    key = %key,
                    code = LifecycleFault::DuplicateEvent.code(),
                    "Duplicate event dropped"
                );
                stats.duplicates += 1;
                handled.push(message.receipt);
                continue;
            }

            let outcome = self.router.route(&event).await;
            tracing::debug!(agent_id = event.agent_id(), key = %key, ?outcome, "Event routed");
            self.events.write().await.push(event);
            stats.routed += 1;
            handled.push(message.receipt);
        }

        handled
    }

    async fn delete_handled(&self, handled: &[String], stats: &mut PollStats) {
        if handled.is_empty() {
            return;
        }
        match self.inbox.delete(&self.scope.user_id, handled).await {
            Ok(()) => stats.deleted += handled.len(),
            Err(e) => tracing::warn!(
                user_id = %self.scope.user_id,
                count = handled.len(),
                "Failed to delete handled events; redeliveries will be deduplicated: {}",
                e
            ),
        }
    }

    /// Log commands in this scope that are still waiting for an acknowledgment.
    pub async fn report_stuck(&self) -> usize {
        let Some(threshold) = self.stuck_after else {
            return 0;
        };
        let stuck: Vec<_> = self
            .reconciler
            .stuck(threshold)
            .await
            .into_iter()
            .filter(|pending| self.scope.claims(&pending.agent_id))
            .collect();
        for pending in &stuck {
            tracing::warn!(
                agent_id = %pending.agent_id,
                execution_id = pending.execution_id.as_deref().unwrap_or("-"),
                since = %pending.since,
                "Command still unacknowledged"
            );
        }
        stuck.len()
    }

    /// Poll every `interval` until `shutdown` flips to `true` or its sender drops.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            user_id = %self.scope.user_id,
            agent_id = self.scope.agent_id.as_deref().unwrap_or("*"),
            interval_ms = interval.as_millis() as u64,
            "Inbox polling started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    self.report_stuck().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(user_id = %self.scope.user_id, "Inbox polling stopped");
    }
}

fn preview(body: &str) -> String {
    if body.len() <= MAX_BODY_PREVIEW {
        return body.to_string();
    }
    let mut end = MAX_BODY_PREVIEW;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use crate::notify::LogNotifier;
    use crate::protocol::{AckAction, Acknowledgment, GenerationNotice, NoticeKind};
    use crate::status::{AcknowledgmentHandler, AgentStatus, MemoryStatusStore};
    use crate::transport::{InboxMessage, MemoryQueue};

    fn ack(agent_id: &str) -> Event {
        Event::Acknowledgment(Acknowledgment {
            action: AckAction::BootAck,
            agent_id: agent_id.to_string(),
            user_id: "U1".to_string(),
            success: true,
            error_code: None,
        })
    }

    fn poller(scope: PollScope, inbox: Arc<dyn EventInbox>) -> (InboxPoller, Arc<StatusReconciler>) {
        let store = Arc::new(MemoryStatusStore::new());
        let reconciler = Arc::new(StatusReconciler::new());
        let acks = Arc::new(AcknowledgmentHandler::new(
            store.clone(),
            reconciler.clone(),
            Arc::new(LogNotifier),
        ));
        let router = EventRouter::new(acks, store, reconciler.clone());
        let poller = InboxPoller::new(
            scope,
            inbox,
            Arc::new(Deduplicator::new()),
            router,
            reconciler.clone(),
        );
        (poller, reconciler)
    }

    #[tokio::test]
    async fn routes_then_deletes() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push_event("U1", &ack("A1")).await;
        let (poller, reconciler) = poller(PollScope::user("U1"), queue.clone());

        let outcome = poller.poll_once().await;

        assert_eq!(
            outcome,
            PollOutcome::Polled(PollStats {
                received: 1,
                routed: 1,
                deleted: 1,
                ..PollStats::default()
            })
        );
        assert_eq!(reconciler.read("A1").await, AgentStatus::Running);
        assert_eq!(queue.pending("U1").await, 0);
    }

    #[tokio::test]
    async fn redelivery_is_exposed_once() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push_event("U1", &ack("A1")).await;
        queue.push_event("U1", &ack("A1")).await;
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());

        let PollOutcome::Polled(stats) = poller.poll_once().await else {
            panic!("expected a completed poll");
        };

        assert_eq!(stats.routed, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(poller.events().await, vec![ack("A1")]);
    }

    #[tokio::test]
    async fn malformed_events_are_dropped_and_deleted() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push_raw("U1", "{not json").await;
        queue.push_event("U1", &ack("A1")).await;
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());

        let PollOutcome::Polled(stats) = poller.poll_once().await else {
            panic!("expected a completed poll");
        };

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.routed, 1);
        assert_eq!(queue.pending("U1").await, 0);
    }

    fn untracked_notice(agent_id: &str) -> Event {
        Event::Generation(GenerationNotice {
            kind: NoticeKind::Final,
            agent_id: agent_id.to_string(),
            user_id: "U1".to_string(),
            image_url: format!("https://img/{agent_id}.png"),
            prompt: String::new(),
            task_id: None,
        })
    }

    #[tokio::test]
    async fn untracked_notices_stay_in_inbox() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push_event("U1", &untracked_notice("A2")).await;
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());

        let PollOutcome::Polled(stats) = poller.poll_once().await else {
            panic!("expected a completed poll");
        };

        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.routed, 0);
        assert_eq!(stats.deleted, 0);
        assert_eq!(queue.pending("U1").await, 1);
        assert!(poller.events().await.is_empty());
    }

    #[tokio::test]
    async fn agent_scope_applies_acknowledgments_for_sibling_agents() {
        let queue = Arc::new(MemoryQueue::new());
        let (poller, reconciler) = poller(PollScope::agent("U1", "A1"), queue.clone());
        reconciler.mark_dispatched("A1", None).await;
        for i in 0..poller.batch_size {
            queue.push_event("U1", &ack(&format!("B{i}"))).await;
        }
        queue.push_event("U1", &ack("A1")).await;

        for _ in 0..3 {
            poller.poll_once().await;
        }

        assert_eq!(reconciler.read("A1").await, AgentStatus::Running);
        assert_eq!(reconciler.read("B0").await, AgentStatus::Running);
        assert_eq!(queue.pending("U1").await, 0);
    }

    #[tokio::test]
    async fn pages_past_a_full_batch_of_deferred_notices() {
        let queue = Arc::new(MemoryQueue::new());
        let (poller, reconciler) = poller(PollScope::agent("U1", "A1"), queue.clone());
        let poller = poller.with_batch_size(3);
        reconciler.mark_dispatched("A1", None).await;
        for i in 0..5 {
            queue.push_event("U1", &untracked_notice(&format!("B{i}"))).await;
        }
        queue.push_event("U1", &ack("A1")).await;

        let PollOutcome::Polled(stats) = poller.poll_once().await else {
            panic!("expected a completed poll");
        };

        assert_eq!(stats.deferred, 5);
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.received, 6);
        assert_eq!(reconciler.read("A1").await, AgentStatus::Running);
        assert_eq!(queue.pending("U1").await, 5);
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        let queue = Arc::new(MemoryQueue::new());
        queue.fail_next_receives(1).await;
        queue.push_event("U1", &ack("A1")).await;
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());

        assert_eq!(poller.poll_once().await, PollOutcome::Failed);
        assert!(matches!(poller.poll_once().await, PollOutcome::Polled(_)));
        assert_eq!(poller.events().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_delete_relies_on_dedup() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push_event("U1", &ack("A1")).await;
        queue.fail_next_deletes(1).await;
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());

        poller.poll_once().await;
        let PollOutcome::Polled(second) = poller.poll_once().await else {
            panic!("expected a completed poll");
        };

        assert_eq!(second.duplicates, 1);
        assert_eq!(second.deleted, 1);
        assert_eq!(poller.events().await.len(), 1);
    }

    /// Inbox whose receive blocks until released.
    struct GatedInbox {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl EventInbox for GatedInbox {
        async fn receive(
            &self,
            _user_id: &str,
            _max_messages: usize,
        ) -> Result<Vec<InboxMessage>, TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }

        async fn delete(&self, _user_id: &str, _receipts: &[String]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let inbox = Arc::new(GatedInbox {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (poller, _) = poller(PollScope::user("U1"), inbox.clone());
        let poller = Arc::new(poller);

        let first = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.poll_once().await })
        };
        inbox.entered.notified().await;

        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);

        inbox.release.notify_one();
        assert!(matches!(first.await.unwrap(), PollOutcome::Polled(_)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        let (poller, _) = poller(PollScope::user("U1"), queue.clone());
        let (tx, rx) = watch::channel(false);

        let poller = Arc::new(poller);
        let handle = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.run(Duration::from_millis(5), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(queue.receive_calls().await >= 1);
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let body = "x".repeat(500);
        assert_eq!(preview(&body).len(), MAX_BODY_PREVIEW + 3);
        assert_eq!(preview("short"), "short");
    }
}
