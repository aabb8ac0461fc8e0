//! End-to-end lifecycle tests over the in-process queue and status store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

use personactl::dispatch::MemoryDefinitionStore;
use personactl::error::LifecycleFault;
use personactl::generation::{
    GenerationMarker, GenerationState, MemoryMarkerStore, MountOutcome,
};
use personactl::inbox::PollOutcome;
use personactl::notify::{ChannelNotifier, Notification, Severity};
use personactl::protocol::{
    AckAction, Acknowledgment, CommandAction, Event, GenerationNotice, NoticeKind, Outbound,
};
use personactl::status::{AgentStatus, MemoryStatusStore};
use personactl::transport::MemoryQueue;
use personactl::{Collaborators, Coordinator, CoordinatorSettings};

struct Harness {
    coordinator: Coordinator,
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStatusStore>,
    markers: Arc<MemoryMarkerStore>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl Harness {
    fn new() -> Self {
        Self::with_markers(MemoryMarkerStore::new())
    }

    fn with_markers(markers: MemoryMarkerStore) -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStatusStore::new());
        let markers = Arc::new(markers);
        let (notifier, notifications) = ChannelNotifier::channel();
        let coordinator = Coordinator::new(
            Collaborators {
                store: store.clone(),
                queue: queue.clone(),
                inbox: queue.clone(),
                markers: markers.clone(),
                definitions: Some(Arc::new(MemoryDefinitionStore::new())),
                notifier: Arc::new(notifier),
            },
            CoordinatorSettings::default(),
        );
        Self {
            coordinator,
            queue,
            store,
            markers,
            notifications,
        }
    }

    fn drain(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}

fn ack(action: AckAction, agent_id: &str, success: bool) -> Event {
    Event::Acknowledgment(Acknowledgment {
        action,
        agent_id: agent_id.to_string(),
        user_id: "U1".to_string(),
        success,
        error_code: None,
    })
}

fn notice(kind: NoticeKind, agent_id: &str, task_id: Uuid, image_url: &str) -> Event {
    Event::Generation(GenerationNotice {
        kind,
        agent_id: agent_id.to_string(),
        user_id: "U1".to_string(),
        image_url: image_url.to_string(),
        prompt: "portrait".to_string(),
        task_id: Some(task_id),
    })
}

fn polled(outcome: PollOutcome) -> personactl::inbox::PollStats {
    match outcome {
        PollOutcome::Polled(stats) => stats,
        other => panic!("expected a completed poll, got {other:?}"),
    }
}

#[tokio::test]
async fn start_ack_and_redelivery_scenario() {
    let mut harness = Harness::new();
    let scope = harness.coordinator.scope("U1", Some("A1")).await.unwrap();

    let command = harness
        .coordinator
        .dispatcher()
        .start_agent("U1", "A1")
        .await
        .unwrap();
    assert_eq!(command.action, CommandAction::Boot);
    assert_eq!(command.execution_id.as_deref(), Some("E1"));
    assert_eq!(
        harness.coordinator.reconciler().read("A1").await,
        AgentStatus::Unknown
    );
    match &harness.queue.sent().await[..] {
        [Outbound::Lifecycle(sent)] => assert_eq!(sent, &command),
        other => panic!("unexpected outbound messages: {other:?}"),
    }
    assert_eq!(harness.drain().len(), 1);

    harness
        .queue
        .push_raw(
            "U1",
            r#"{"action":"bootACK","agentId":"A1","userId":"U1","success":"true"}"#,
        )
        .await;
    let stats = polled(scope.poller().poll_once().await);
    assert_eq!(stats.routed, 1);
    assert_eq!(
        harness.coordinator.reconciler().read("A1").await,
        AgentStatus::Running
    );
    let notifications = harness.drain();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Success);

    // Redelivery of the same acknowledgment.
    harness
        .queue
        .push_raw(
            "U1",
            r#"{"action":"bootACK","agentId":"A1","userId":"U1","success":"true"}"#,
        )
        .await;
    let stats = polled(scope.poller().poll_once().await);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.routed, 0);
    assert!(harness.drain().is_empty());
    assert_eq!(
        harness.coordinator.reconciler().read("A1").await,
        AgentStatus::Running
    );
    assert_eq!(harness.queue.pending("U1").await, 0);
}

#[tokio::test]
async fn status_settles_after_every_acknowledged_command() {
    let harness = Harness::new();
    let scope = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    let dispatcher = harness.coordinator.dispatcher();
    let reconciler = harness.coordinator.reconciler();

    let steps = [
        (CommandAction::Boot, AckAction::BootAck, true),
        (CommandAction::Stop, AckAction::StopAck, true),
        (CommandAction::Boot, AckAction::BootAck, true),
        (CommandAction::Update, AckAction::UpdateAck, false),
        (CommandAction::Boot, AckAction::BootAck, true),
    ];

    for (action, ack_action, success) in steps {
        match action {
            CommandAction::Boot => dispatcher.start_agent("U1", "A1").await.unwrap(),
            CommandAction::Stop => dispatcher.stop_agent("U1", "A1").await.unwrap(),
            CommandAction::Update => dispatcher
                .update_agent("U1", "A1", &serde_json::json!({"name": "Ada"}))
                .await
                .unwrap(),
        };
        assert_eq!(reconciler.read("A1").await, AgentStatus::Unknown);

        harness
            .queue
            .push_event("U1", &ack(ack_action, "A1", success))
            .await;
        polled(scope.poller().poll_once().await);

        let expected = if success {
            ack_action.target_status()
        } else {
            AgentStatus::Stopped
        };
        assert_eq!(reconciler.read("A1").await, expected, "after {action}");
    }

    assert!(reconciler.pending().await.is_empty());
    assert_eq!(harness.store.current("A1").await, Some(AgentStatus::Running));
}

#[tokio::test]
async fn failed_boot_compensates_to_stopped() {
    let mut harness = Harness::new();
    let scope = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    harness
        .coordinator
        .dispatcher()
        .start_agent("U1", "A1")
        .await
        .unwrap();
    harness.drain();

    harness
        .queue
        .push_raw(
            "U1",
            r#"{"action":"bootACK","agentId":"A1","userId":"U1","success":"false","errorCode":"NO_CAPACITY"}"#,
        )
        .await;
    polled(scope.poller().poll_once().await);

    assert_eq!(
        harness.coordinator.reconciler().read("A1").await,
        AgentStatus::Stopped
    );
    assert_eq!(harness.store.current("A1").await, Some(AgentStatus::Stopped));

    let notifications = harness.drain();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Error);
    let fault = notifications[0].fault.as_ref().unwrap();
    assert_eq!(fault.fault, LifecycleFault::AckFailure);
    assert!(notifications[0].message.contains("NO_CAPACITY"));
}

#[tokio::test]
async fn redelivered_batch_is_listed_once() {
    let harness = Harness::new();
    let scope = harness.coordinator.scope("U1", None).await.unwrap();
    harness
        .coordinator
        .dispatcher()
        .start_agent("U1", "A1")
        .await
        .unwrap();

    harness
        .queue
        .push_event("U1", &ack(AckAction::BootAck, "A1", true))
        .await;
    // The receipt survives the first tick, so the next receive returns it again.
    harness.queue.fail_next_deletes(1).await;

    let first = polled(scope.poller().poll_once().await);
    assert_eq!(first.routed, 1);
    assert_eq!(first.deleted, 0);
    assert_eq!(harness.queue.pending("U1").await, 1);

    let second = polled(scope.poller().poll_once().await);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.deleted, 1);

    let events = scope.poller().events().await;
    assert_eq!(events, vec![ack(AckAction::BootAck, "A1", true)]);
}

#[tokio::test]
async fn agent_scope_reaches_its_ack_behind_sibling_acks() {
    let harness = Harness::new();
    let a1 = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    let dispatcher = harness.coordinator.dispatcher();
    dispatcher.start_agent("U1", "A1").await.unwrap();

    let batch_size = harness.coordinator.settings().batch_size;
    for i in 0..batch_size {
        let agent = format!("B{i}");
        dispatcher.start_agent("U1", &agent).await.unwrap();
        harness
            .queue
            .push_event("U1", &ack(AckAction::BootAck, &agent, true))
            .await;
    }
    harness
        .queue
        .push_event("U1", &ack(AckAction::BootAck, "A1", true))
        .await;

    for _ in 0..3 {
        polled(a1.poller().poll_once().await);
    }

    let reconciler = harness.coordinator.reconciler();
    assert_eq!(reconciler.read("A1").await, AgentStatus::Running);
    assert_eq!(reconciler.read("B0").await, AgentStatus::Running);
    assert!(reconciler.pending().await.is_empty());
    assert_eq!(harness.queue.pending("U1").await, 0);
}

#[tokio::test]
async fn user_scope_leaves_generation_notices_for_the_tracking_scope() {
    let harness = Harness::new();
    let a1 = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    let user = harness.coordinator.scope("U1", None).await.unwrap();
    let tracker = a1.tracker().unwrap().clone();
    let task_id = tracker.generate_avatar("portrait", None).await.unwrap();

    harness
        .queue
        .push_event(
            "U1",
            &notice(NoticeKind::Final, "A1", task_id, "https://img/final.png"),
        )
        .await;

    let stats = polled(user.poller().poll_once().await);
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.routed, 0);
    assert_eq!(stats.deleted, 0);
    assert_eq!(harness.queue.pending("U1").await, 1);
    assert_eq!(tracker.state().await, GenerationState::Running);

    let stats = polled(a1.poller().poll_once().await);
    assert_eq!(stats.routed, 1);
    assert_eq!(tracker.state().await, GenerationState::Completed);
    assert_eq!(harness.queue.pending("U1").await, 0);
}

#[tokio::test]
async fn marker_resumes_generation_without_new_request() {
    let task_id = Uuid::new_v4();
    let harness = Harness::with_markers(MemoryMarkerStore::with_marker(GenerationMarker::new(
        "A123", task_id,
    )));
    let scope = harness.coordinator.scope("U1", Some("A123")).await.unwrap();
    let tracker = scope.tracker().unwrap().clone();

    match tracker.mount().await.unwrap() {
        MountOutcome::Resumed(marker) => assert_eq!(marker.task_id, task_id),
        other => panic!("expected resume, got {other:?}"),
    }
    assert_eq!(tracker.state().await, GenerationState::Running);
    assert!(harness.queue.sent().await.is_empty());

    harness
        .queue
        .push_event(
            "U1",
            &notice(NoticeKind::Final, "A123", task_id, "https://img/final.png"),
        )
        .await;
    polled(scope.poller().poll_once().await);

    assert_eq!(tracker.state().await, GenerationState::Completed);
    assert_eq!(
        tracker.task().await.last_image_url.as_deref(),
        Some("https://img/final.png")
    );
    assert!(harness.markers.current().await.is_none());
}

#[tokio::test]
async fn cancelled_generation_ignores_late_final() {
    let harness = Harness::new();
    let scope = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    let tracker = scope.tracker().unwrap().clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let task_id = tracker
        .generate_avatar(
            "portrait",
            Some(Box::new(move |_: &GenerationNotice| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    assert!(harness.markers.current().await.is_some());

    assert!(tracker.cancel_generation().await);
    assert!(harness.markers.current().await.is_none());

    harness
        .queue
        .push_event(
            "U1",
            &notice(NoticeKind::Final, "A1", task_id, "https://img/late.png"),
        )
        .await;
    polled(scope.poller().poll_once().await);

    assert_eq!(tracker.state().await, GenerationState::Cancelled);
    assert_eq!(tracker.task().await.last_image_url, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.queue.pending("U1").await, 0);
}

#[tokio::test]
async fn generation_progress_then_final_runs_callback_once() {
    let harness = Harness::new();
    let scope = harness.coordinator.scope("U1", Some("A1")).await.unwrap();
    let tracker = scope.tracker().unwrap().clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let task_id = tracker
        .generate_avatar(
            "portrait",
            Some(Box::new(move |_: &GenerationNotice| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();

    for event in [
        notice(NoticeKind::Progress, "A1", task_id, "https://img/1.png"),
        notice(NoticeKind::Final, "A1", task_id, "https://img/2.png"),
        notice(NoticeKind::Final, "A1", task_id, "https://img/2.png"),
    ] {
        harness.queue.push_event("U1", &event).await;
    }
    polled(scope.poller().poll_once().await);

    assert_eq!(tracker.state().await, GenerationState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        tracker.task().await.last_image_url.as_deref(),
        Some("https://img/2.png")
    );
}
