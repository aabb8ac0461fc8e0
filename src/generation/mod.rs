//! Long-running avatar generation.
//!
//! A [`GenerationTracker`] is bound to one `(user, agent)` scope. It sends the
//! generation request, persists a [`GenerationMarker`] so a later mount can
//! resume waiting without re-sending, and consumes progress/final notices
//! routed from the inbox. Cancellation is local only: the remote worker keeps
//! running and its late notices are dropped by the final-received gate.

mod marker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::error::{DispatchError, MarkerError};
use crate::inbox::Deduplicator;
use crate::notify::{Notification, Notifier};
use crate::protocol::{GenerationNotice, GenerationRequest, NoticeKind, Outbound};
use crate::transport::CommandQueue;

pub use self::marker::{
    FileMarkerStore, GenerationMarker, MarkerStore, MemoryMarkerStore, default_marker_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl GenerationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed or cancelled; the task accepts no further notices.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for GenerationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the tracked task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationTask {
    pub agent_id: String,
    pub task_id: Option<Uuid>,
    pub prompt: String,
    pub state: GenerationState,
    pub last_image_url: Option<String>,
}

/// Invoked once with the final notice of a completed task.
pub type CompletionCallback = Box<dyn FnOnce(&GenerationNotice) + Send>;

/// What mounting the tracker found in the marker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    /// No marker, or one for another agent.
    Idle,
    /// A live marker for this agent; waiting resumes without a new request.
    Resumed(GenerationMarker),
    /// The marker outlived its TTL and was cleared.
    Expired(GenerationMarker),
}

/// Why a routed notice had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The task already completed or was cancelled.
    FinalReceived,
    OtherAgent,
    OtherTask,
    /// No generation is running in this scope.
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeOutcome {
    Progress { image_url: String },
    Completed { image_url: String },
    Ignored(IgnoreReason),
}

struct TrackerInner {
    task: GenerationTask,
    final_received: bool,
    on_complete: Option<CompletionCallback>,
}

pub struct GenerationTracker {
    user_id: String,
    agent_id: String,
    queue: Arc<dyn CommandQueue>,
    markers: Arc<dyn MarkerStore>,
    dedup: Arc<Deduplicator>,
    notifier: Arc<dyn Notifier>,
    marker_ttl: Option<Duration>,
    inner: Mutex<TrackerInner>,
    state_tx: watch::Sender<GenerationState>,
}

impl GenerationTracker {
    pub fn new(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        queue: Arc<dyn CommandQueue>,
        markers: Arc<dyn MarkerStore>,
        dedup: Arc<Deduplicator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let agent_id = agent_id.into();
        let (state_tx, _rx) = watch::channel(GenerationState::Idle);
        Self {
            user_id: user_id.into(),
            inner: Mutex::new(TrackerInner {
                task: GenerationTask {
                    agent_id: agent_id.clone(),
                    task_id: None,
                    prompt: String::new(),
                    state: GenerationState::Idle,
                    last_image_url: None,
                },
                final_received: false,
                on_complete: None,
            }),
            agent_id,
            queue,
            markers,
            dedup,
            notifier,
            marker_ttl: None,
            state_tx,
        }
    }

    /// Markers older than `ttl` are discarded on mount instead of resumed.
    pub fn with_marker_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.marker_ttl = ttl;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn task(&self) -> GenerationTask {
        self.inner.lock().await.task.clone()
    }

    pub async fn state(&self) -> GenerationState {
        self.inner.lock().await.task.state
    }

    pub async fn final_received(&self) -> bool {
        self.inner.lock().await.final_received
    }

    /// Whether the scope should keep polling for this task.
    pub async fn awaiting_notices(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.task.state == GenerationState::Running && !inner.final_received
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state_tx.subscribe()
    }

    /// Resume an in-flight task recorded in the marker slot, if it is ours.
    pub async fn mount(&self) -> Result<MountOutcome, MarkerError> {
        let Some(marker) = self.markers.load().await? else {
            return Ok(MountOutcome::Idle);
        };

        if marker.agent_id != self.agent_id {
            tracing::debug!(
                agent_id = %self.agent_id,
                marker_agent = %marker.agent_id,
                "Generation marker belongs to another agent"
            );
            return Ok(MountOutcome::Idle);
        }

        if marker.is_expired(self.marker_ttl, Utc::now()) {
            tracing::warn!(
                agent_id = %self.agent_id,
                task_id = %marker.task_id,
                started_at = %marker.started_at,
                "Discarding expired generation marker"
            );
            self.markers.clear().await?;
            return Ok(MountOutcome::Expired(marker));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.task = GenerationTask {
                agent_id: self.agent_id.clone(),
                task_id: Some(marker.task_id),
                prompt: String::new(),
                state: GenerationState::Running,
                last_image_url: None,
            };
            inner.final_received = false;
        }
        self.state_tx.send_replace(GenerationState::Running);
        tracing::info!(
            agent_id = %self.agent_id,
            task_id = %marker.task_id,
            "Resuming avatar generation"
        );

        Ok(MountOutcome::Resumed(marker))
    }

    /// Register the callback for the running task, e.g. after a resume.
    pub async fn on_complete(&self, callback: CompletionCallback) {
        self.inner.lock().await.on_complete = Some(callback);
    }

    /// Start a fresh generation task. Returns its task id.
    pub async fn generate_avatar(
        &self,
        prompt: &str,
        on_complete: Option<CompletionCallback>,
    ) -> crate::error::Result<Uuid> {
        if let Err(e) = self.check_preconditions(prompt) {
            self.notifier.notify(
                Notification::error("Missing data", e.to_string()).for_agent(&self.agent_id),
            );
            return Err(e.into());
        }

        self.dedup.clear_agent(&self.agent_id).await;
        {
            let mut inner = self.inner.lock().await;
            if inner.task.state == GenerationState::Running {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    task_id = ?inner.task.task_id,
                    "Superseding running generation task"
                );
            }
            inner.final_received = false;
        }

        let task_id = Uuid::new_v4();
        let request = Outbound::from(GenerationRequest::new(
            &self.agent_id,
            &self.user_id,
            prompt,
            task_id,
        ));
        if let Err(source) = self.queue.send(&request).await {
            let err = DispatchError::EnqueueFailed {
                action: request.action_name().to_string(),
                agent_id: self.agent_id.clone(),
                source,
            };
            tracing::warn!(agent_id = %self.agent_id, "{}", err);
            self.notifier.notify(
                Notification::error("Avatar generation failed to start", err.to_string())
                    .for_agent(&self.agent_id),
            );
            return Err(err.into());
        }

        {
            let mut inner = self.inner.lock().await;
            inner.task = GenerationTask {
                agent_id: self.agent_id.clone(),
                task_id: Some(task_id),
                prompt: prompt.to_string(),
                state: GenerationState::Running,
                last_image_url: None,
            };
            inner.on_complete = on_complete;
        }
        self.state_tx.send_replace(GenerationState::Running);

        let marker = GenerationMarker::new(&self.agent_id, task_id);
        if let Err(e) = self.markers.save(&marker).await {
            tracing::warn!(
                agent_id = %self.agent_id,
                "Generation is running but cannot be resumed after restart: {}",
                e
            );
        }

        tracing::info!(agent_id = %self.agent_id, task_id = %task_id, "Avatar generation requested");
        self.notifier.notify(
            Notification::info("Avatar generation started", "Waiting for the first preview")
                .for_agent(&self.agent_id),
        );
        Ok(task_id)
    }

    fn check_preconditions(&self, prompt: &str) -> Result<(), DispatchError> {
        if self.user_id.trim().is_empty() {
            return Err(DispatchError::MissingData("userId"));
        }
        if self.agent_id.trim().is_empty() {
            return Err(DispatchError::MissingData("agentId"));
        }
        if prompt.trim().is_empty() {
            return Err(DispatchError::MissingData("prompt"));
        }
        Ok(())
    }

    /// Stop waiting for the running task. Returns `false` if nothing was running.
    pub async fn cancel_generation(&self) -> bool {
        let task_id = {
            let mut inner = self.inner.lock().await;
            if inner.task.state != GenerationState::Running {
                return false;
            }
            inner.task.state = GenerationState::Cancelled;
            inner.final_received = true;
            inner.on_complete = None;
            inner.task.task_id
        };
        self.state_tx.send_replace(GenerationState::Cancelled);
        self.clear_marker(task_id).await;

        tracing::info!(agent_id = %self.agent_id, "Avatar generation cancelled");
        self.notifier.notify(
            Notification::info(
                "Avatar generation cancelled",
                "Late results for this request will be ignored",
            )
            .for_agent(&self.agent_id),
        );
        true
    }

    /// Apply a routed generation notice.
    pub async fn handle_notice(&self, notice: &GenerationNotice) -> NoticeOutcome {
        let mut inner = self.inner.lock().await;

        if inner.final_received {
            return NoticeOutcome::Ignored(IgnoreReason::FinalReceived);
        }
        if notice.agent_id != self.agent_id {
            return NoticeOutcome::Ignored(IgnoreReason::OtherAgent);
        }
        if let (Some(active), Some(incoming)) = (inner.task.task_id, notice.task_id)
            && active != incoming
        {
            tracing::debug!(
                agent_id = %self.agent_id,
                active = %active,
                incoming = %incoming,
                "Ignoring notice for another generation task"
            );
            return NoticeOutcome::Ignored(IgnoreReason::OtherTask);
        }
        if inner.task.state != GenerationState::Running {
            return NoticeOutcome::Ignored(IgnoreReason::NotRunning);
        }

        inner.task.last_image_url = Some(notice.image_url.clone());
        match notice.kind {
            NoticeKind::Progress => {
                tracing::debug!(agent_id = %self.agent_id, image_url = %notice.image_url, "Generation progress");
                NoticeOutcome::Progress {
                    image_url: notice.image_url.clone(),
                }
            }
            NoticeKind::Final => {
                inner.task.state = GenerationState::Completed;
                inner.final_received = true;
                let callback = inner.on_complete.take();
                let task_id = inner.task.task_id;
                drop(inner);

                self.state_tx.send_replace(GenerationState::Completed);
                if let Some(callback) = callback {
                    callback(notice);
                }
                self.clear_marker(task_id).await;

                tracing::info!(agent_id = %self.agent_id, image_url = %notice.image_url, "Avatar generation completed");
                self.notifier.notify(
                    Notification::success("Avatar ready", notice.image_url.clone())
                        .for_agent(&self.agent_id),
                );
                NoticeOutcome::Completed {
                    image_url: notice.image_url.clone(),
                }
            }
        }
    }

    /// Wait until the task completes or is cancelled.
    pub async fn settled(&self) -> GenerationState {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_settled() {
                return state;
            }
            if rx.changed().await.is_err() {
                return state;
            }
        }
    }

    /// Clear the marker slot only while it still records `task_id` for this agent.
    async fn clear_marker(&self, task_id: Option<Uuid>) {
        let marker = match self.markers.load().await {
            Ok(Some(marker)) => marker,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, "Failed to read generation marker: {}", e);
                return;
            }
        };
        if marker.agent_id != self.agent_id || Some(marker.task_id) != task_id {
            tracing::debug!(
                agent_id = %self.agent_id,
                marker_agent = %marker.agent_id,
                marker_task = %marker.task_id,
                "Generation marker belongs to another task; left in place"
            );
            return;
        }
        if let Err(e) = self.markers.clear().await {
            tracing::warn!(agent_id = %self.agent_id, "Failed to clear generation marker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::notify::{ChannelNotifier, Severity};
    use crate::protocol::{AckAction, IdempotencyKey};
    use crate::transport::MemoryQueue;

    struct Fixture {
        tracker: GenerationTracker,
        queue: Arc<MemoryQueue>,
        markers: Arc<MemoryMarkerStore>,
        dedup: Arc<Deduplicator>,
        notifications: tokio::sync::mpsc::UnboundedReceiver<Notification>,
    }

    fn fixture(markers: MemoryMarkerStore) -> Fixture {
        let queue = Arc::new(MemoryQueue::new());
        let markers = Arc::new(markers);
        let dedup = Arc::new(Deduplicator::new());
        let (notifier, notifications) = ChannelNotifier::channel();
        let tracker = GenerationTracker::new(
            "U1",
            "A123",
            queue.clone(),
            markers.clone(),
            dedup.clone(),
            Arc::new(notifier),
        );
        Fixture {
            tracker,
            queue,
            markers,
            dedup,
            notifications,
        }
    }

    fn notice(kind: NoticeKind, image_url: &str, task_id: Option<Uuid>) -> GenerationNotice {
        GenerationNotice {
            kind,
            agent_id: "A123".to_string(),
            user_id: "U1".to_string(),
            image_url: image_url.to_string(),
            prompt: "a fox".to_string(),
            task_id,
        }
    }

    #[tokio::test]
    async fn generate_sends_request_and_writes_marker() {
        let f = fixture(MemoryMarkerStore::new());
        let stale = IdempotencyKey::acknowledgment(AckAction::BootAck, "A123", "U1");
        f.dedup.check_and_insert("A123", stale).await;

        let task_id = f.tracker.generate_avatar("a fox", None).await.unwrap();

        assert_eq!(f.tracker.state().await, GenerationState::Running);
        assert!(f.dedup.is_empty().await);
        let sent = f.queue.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action_name(), "generate_avatar");
        let marker = f.markers.current().await.unwrap();
        assert_eq!(marker.agent_id, "A123");
        assert_eq!(marker.task_id, task_id);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_side_effects() {
        let mut f = fixture(MemoryMarkerStore::new());

        assert!(f.tracker.generate_avatar("  ", None).await.is_err());

        assert!(f.queue.sent().await.is_empty());
        assert!(f.markers.current().await.is_none());
        assert_eq!(f.notifications.try_recv().unwrap().severity, Severity::Error);
    }

    #[tokio::test]
    async fn send_failure_leaves_task_idle() {
        let f = fixture(MemoryMarkerStore::new());
        f.queue.fail_next_sends(1).await;

        assert!(f.tracker.generate_avatar("a fox", None).await.is_err());

        assert_eq!(f.tracker.state().await, GenerationState::Idle);
        assert!(f.markers.current().await.is_none());
    }

    #[tokio::test]
    async fn progress_then_final_completes_and_calls_back() {
        let f = fixture(MemoryMarkerStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task_id = f
            .tracker
            .generate_avatar(
                "a fox",
                Some(Box::new(move |_notice: &GenerationNotice| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        let progress = f
            .tracker
            .handle_notice(&notice(NoticeKind::Progress, "u/1.png", Some(task_id)))
            .await;
        assert_eq!(
            progress,
            NoticeOutcome::Progress {
                image_url: "u/1.png".to_string()
            }
        );
        assert_eq!(
            f.tracker.task().await.last_image_url.as_deref(),
            Some("u/1.png")
        );

        let done = f
            .tracker
            .handle_notice(&notice(NoticeKind::Final, "u/final.png", None))
            .await;
        assert!(matches!(done, NoticeOutcome::Completed { .. }));
        assert_eq!(f.tracker.state().await, GenerationState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.markers.current().await.is_none());
        assert!(!f.tracker.awaiting_notices().await);

        // A redelivered final is gated.
        let again = f
            .tracker
            .handle_notice(&notice(NoticeKind::Final, "u/final.png", None))
            .await;
        assert_eq!(again, NoticeOutcome::Ignored(IgnoreReason::FinalReceived));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_gates_late_final() {
        let f = fixture(MemoryMarkerStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        f.tracker
            .generate_avatar(
                "a fox",
                Some(Box::new(move |_notice: &GenerationNotice| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        assert!(f.tracker.cancel_generation().await);
        assert!(f.markers.current().await.is_none());

        let late = f
            .tracker
            .handle_notice(&notice(NoticeKind::Final, "u/final.png", None))
            .await;
        assert_eq!(late, NoticeOutcome::Ignored(IgnoreReason::FinalReceived));
        assert_eq!(f.tracker.state().await, GenerationState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!f.tracker.cancel_generation().await);
    }

    #[tokio::test]
    async fn cancel_keeps_marker_written_by_another_agent() {
        let f = fixture(MemoryMarkerStore::new());
        let other = GenerationTracker::new(
            "U1",
            "B1",
            f.queue.clone(),
            f.markers.clone(),
            f.dedup.clone(),
            Arc::new(crate::notify::LogNotifier),
        );
        f.tracker.generate_avatar("a fox", None).await.unwrap();
        let other_task = other.generate_avatar("an owl", None).await.unwrap();

        assert!(f.tracker.cancel_generation().await);

        let marker = f.markers.current().await.unwrap();
        assert_eq!(marker.agent_id, "B1");
        assert_eq!(marker.task_id, other_task);
    }

    #[tokio::test]
    async fn final_for_replaced_task_keeps_newer_marker() {
        let f = fixture(MemoryMarkerStore::new());
        let first = f.tracker.generate_avatar("a fox", None).await.unwrap();
        let newer = GenerationMarker::new("A123", Uuid::new_v4());
        f.markers.save(&newer).await.unwrap();

        let outcome = f
            .tracker
            .handle_notice(&notice(NoticeKind::Final, "u/final.png", Some(first)))
            .await;

        assert!(matches!(outcome, NoticeOutcome::Completed { .. }));
        assert_eq!(f.markers.current().await, Some(newer));
    }

    #[tokio::test]
    async fn mount_resumes_matching_marker_without_sending() {
        let marker = GenerationMarker::new("A123", Uuid::new_v4());
        let f = fixture(MemoryMarkerStore::with_marker(marker.clone()));

        let outcome = f.tracker.mount().await.unwrap();

        assert_eq!(outcome, MountOutcome::Resumed(marker.clone()));
        assert_eq!(f.tracker.state().await, GenerationState::Running);
        assert_eq!(f.tracker.task().await.task_id, Some(marker.task_id));
        assert!(f.queue.sent().await.is_empty());
    }

    #[tokio::test]
    async fn mount_ignores_marker_for_other_agent() {
        let marker = GenerationMarker::new("A999", Uuid::new_v4());
        let f = fixture(MemoryMarkerStore::with_marker(marker.clone()));

        assert_eq!(f.tracker.mount().await.unwrap(), MountOutcome::Idle);
        assert_eq!(f.tracker.state().await, GenerationState::Idle);
        assert_eq!(f.markers.current().await, Some(marker));
    }

    #[tokio::test]
    async fn mount_clears_expired_marker() {
        let mut marker = GenerationMarker::new("A123", Uuid::new_v4());
        marker.started_at = Utc::now() - chrono::Duration::hours(2);
        let mut f = fixture(MemoryMarkerStore::with_marker(marker.clone()));
        f.tracker = f.tracker.with_marker_ttl(Some(Duration::from_secs(1800)));

        assert_eq!(f.tracker.mount().await.unwrap(), MountOutcome::Expired(marker));
        assert_eq!(f.tracker.state().await, GenerationState::Idle);
        assert!(f.markers.current().await.is_none());
    }

    #[tokio::test]
    async fn notice_for_other_task_is_ignored() {
        let f = fixture(MemoryMarkerStore::new());
        f.tracker.generate_avatar("a fox", None).await.unwrap();

        let outcome = f
            .tracker
            .handle_notice(&notice(NoticeKind::Final, "old.png", Some(Uuid::new_v4())))
            .await;

        assert_eq!(outcome, NoticeOutcome::Ignored(IgnoreReason::OtherTask));
        assert_eq!(f.tracker.state().await, GenerationState::Running);
    }

    #[tokio::test]
    async fn settled_returns_after_cancel() {
        let Fixture { tracker, .. } = fixture(MemoryMarkerStore::new());
        let tracker = Arc::new(tracker);
        tracker.generate_avatar("a fox", None).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.settled().await })
        };
        tracker.cancel_generation().await;

        assert_eq!(waiter.await.unwrap(), GenerationState::Cancelled);
    }
}
