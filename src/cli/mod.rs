//! Command-line surface for personactl.

pub mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::coordinator::{Collaborators, Coordinator, CoordinatorSettings};
use crate::dispatch::{HttpDefinitionStore, MemoryDefinitionStore};
use crate::generation::{
    FileMarkerStore, GenerationState, GenerationTracker, MarkerStore, MountOutcome,
};
use crate::notify::{ChannelNotifier, Notification, Severity};
use crate::protocol::GenerationNotice;
use crate::status::{AgentStatus, HttpStatusStore, MemoryStatusStore};
use crate::transport::{HttpQueue, MemoryQueue};

/// personactl -- lifecycle commands and acknowledgments for persona agents.
#[derive(Parser, Debug)]
#[command(name = "personactl", version, about)]
pub struct Cli {
    /// TOML config file overlay (default: ~/.personactl/config.toml)
    #[arg(long, global = true, env = "PERSONACTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still wins)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Use in-process queue and status store instead of the HTTP backend
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask the executor to start an agent
    Start {
        #[command(flatten)]
        target: AgentTarget,

        /// Poll the inbox up to this many seconds for the acknowledgment
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Ask the executor to stop an agent
    Stop {
        #[command(flatten)]
        target: AgentTarget,

        /// Poll the inbox up to this many seconds for the acknowledgment
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Save an agent definition and ask the executor to reload it
    Update {
        #[command(flatten)]
        target: AgentTarget,

        /// JSON file holding the agent definition
        #[arg(long)]
        definition: PathBuf,

        /// Poll the inbox up to this many seconds for the acknowledgment
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Poll the inbox and apply events until Ctrl-C
    Watch {
        #[arg(long)]
        user: String,

        /// Also apply generation notices for this agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Request an avatar and wait for the final image (Ctrl-C cancels)
    Generate {
        #[command(flatten)]
        target: AgentTarget,

        #[arg(long)]
        prompt: String,
    },

    /// Resume waiting on a generation recorded in the marker file
    Resume {
        #[command(flatten)]
        target: AgentTarget,
    },

    /// Forget an in-flight generation for an agent
    Cancel {
        #[arg(long)]
        agent: String,
    },

    /// Probe endpoints and validate configuration
    Doctor {
        /// Exit non-zero when any check fails
        #[arg(long)]
        strict: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct AgentTarget {
    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub agent: String,
}

/// Run one parsed invocation.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Doctor { strict } = &cli.command {
        return doctor::run_doctor_command(cli.config.as_deref(), *strict).await;
    }

    let config =
        Config::from_env_with_toml(cli.config.as_deref()).context("failed to load configuration")?;

    let (notifier, rx) = ChannelNotifier::channel();
    let printer = tokio::spawn(print_notifications(rx));

    let coordinator = Coordinator::new(
        collaborators(&config, cli.offline, Arc::new(notifier)),
        CoordinatorSettings::from_config(&config),
    );
    let result = execute(cli.command, &coordinator, &config).await;
    drop(coordinator);

    // Every notifier clone is gone once the coordinator and its scopes are dropped.
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        tracing::debug!("Notification printer did not drain in time");
    }
    result
}

fn collaborators(
    config: &Config,
    offline: bool,
    notifier: Arc<ChannelNotifier>,
) -> Collaborators {
    let markers: Arc<dyn MarkerStore> =
        Arc::new(FileMarkerStore::new(&config.generation.marker_path));

    if offline {
        tracing::info!("Offline mode: commands stay in process");
        let queue = Arc::new(MemoryQueue::new());
        return Collaborators {
            store: Arc::new(MemoryStatusStore::new()),
            queue: queue.clone(),
            inbox: queue,
            markers,
            definitions: Some(Arc::new(MemoryDefinitionStore::new())),
            notifier,
        };
    }

    let queue = Arc::new(HttpQueue::new(
        &config.queue_url,
        config.http_timeout,
        config.api_token.clone(),
    ));
    Collaborators {
        store: Arc::new(HttpStatusStore::new(
            &config.runtime_url,
            config.http_timeout,
            config.api_token.clone(),
        )),
        queue: queue.clone(),
        inbox: queue,
        markers,
        definitions: Some(Arc::new(HttpDefinitionStore::new(
            &config.runtime_url,
            config.http_timeout,
            config.api_token.clone(),
        ))),
        notifier,
    }
}

async fn execute(
    command: Commands,
    coordinator: &Coordinator,
    config: &Config,
) -> anyhow::Result<()> {
    match command {
        Commands::Start { target, wait_secs } => {
            let command = coordinator
                .dispatcher()
                .start_agent(&target.user, &target.agent)
                .await?;
            print_dispatched(&command);
            await_acknowledgment(coordinator, &target, wait_secs).await
        }
        Commands::Stop { target, wait_secs } => {
            let command = coordinator
                .dispatcher()
                .stop_agent(&target.user, &target.agent)
                .await?;
            print_dispatched(&command);
            await_acknowledgment(coordinator, &target, wait_secs).await
        }
        Commands::Update {
            target,
            definition,
            wait_secs,
        } => {
            let definition = read_definition(&definition).await?;
            let command = coordinator
                .dispatcher()
                .update_agent(&target.user, &target.agent, &definition)
                .await?;
            print_dispatched(&command);
            await_acknowledgment(coordinator, &target, wait_secs).await
        }
        Commands::Watch { user, agent } => {
            let scope = coordinator.scope(&user, agent.as_deref()).await?;
            let handle = scope.spawn();
            println!("Watching inbox for {user}; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            handle.stop().await;
            println!("Handled {} event(s)", scope.poller().events().await.len());
            Ok(())
        }
        Commands::Generate { target, prompt } => {
            let scope = coordinator.scope(&target.user, Some(&target.agent)).await?;
            let tracker = scope
                .tracker()
                .context("agent-bound scope has no generation tracker")?
                .clone();
            let task_id = tracker
                .generate_avatar(&prompt, Some(print_image_callback()))
                .await?;
            println!("Generation {task_id} requested for {}", target.agent);

            let handle = scope.spawn();
            let result = wait_for_generation(&tracker).await;
            handle.stop().await;
            result
        }
        Commands::Resume { target } => {
            let scope = coordinator.scope(&target.user, Some(&target.agent)).await?;
            let tracker = scope
                .tracker()
                .context("agent-bound scope has no generation tracker")?
                .clone();
            match tracker.mount().await? {
                MountOutcome::Idle => {
                    println!("No generation in flight for {}", target.agent);
                    Ok(())
                }
                MountOutcome::Expired(marker) => {
                    println!(
                        "Generation {} for {} expired (started {}); marker cleared",
                        marker.task_id,
                        marker.agent_id,
                        marker.started_at.to_rfc3339()
                    );
                    Ok(())
                }
                MountOutcome::Resumed(marker) => {
                    println!("Resuming generation {} for {}", marker.task_id, target.agent);
                    tracker.on_complete(print_image_callback()).await;
                    let handle = scope.spawn();
                    let result = wait_for_generation(&tracker).await;
                    handle.stop().await;
                    result
                }
            }
        }
        Commands::Cancel { agent } => cancel_marker(config, &agent).await,
        Commands::Doctor { .. } => Ok(()),
    }
}

fn print_dispatched(command: &crate::protocol::Command) {
    println!(
        "Sent {} for {} (execution {})",
        command.action.as_str(),
        command.agent_id,
        command.execution_id.as_deref().unwrap_or("-")
    );
}

/// Poll until the agent leaves `Unknown`, or give up after `wait_secs`.
async fn await_acknowledgment(
    coordinator: &Coordinator,
    target: &AgentTarget,
    wait_secs: Option<u64>,
) -> anyhow::Result<()> {
    let Some(wait_secs) = wait_secs else {
        return Ok(());
    };

    let mut status = coordinator.reconciler().subscribe(&target.agent).await;
    let scope = coordinator.scope(&target.user, Some(&target.agent)).await?;
    let handle = scope.spawn();
    let settled = tokio::time::timeout(
        Duration::from_secs(wait_secs),
        async {
            status
                .wait_for(|s| *s != AgentStatus::Unknown)
                .await
                .map(|s| *s)
        },
    )
    .await;
    handle.stop().await;

    match settled {
        Ok(Ok(status)) => {
            println!("{} is {status}", target.agent);
            Ok(())
        }
        Ok(Err(_)) => anyhow::bail!("status channel closed for {}", target.agent),
        Err(_) => {
            println!(
                "No acknowledgment for {} after {wait_secs}s; status stays unknown",
                target.agent
            );
            Ok(())
        }
    }
}

async fn wait_for_generation(tracker: &Arc<GenerationTracker>) -> anyhow::Result<()> {
    tokio::select! {
        state = tracker.settled() => {
            println!("Generation {state}");
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracker.cancel_generation().await;
            println!("Generation {}", GenerationState::Cancelled);
            Ok(())
        }
    }
}

fn print_image_callback() -> crate::generation::CompletionCallback {
    Box::new(|notice: &GenerationNotice| println!("Avatar ready: {}", notice.image_url))
}

async fn read_definition(path: &Path) -> anyhow::Result<serde_json::Value> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid JSON in {}", path.display()))
}

async fn cancel_marker(config: &Config, agent_id: &str) -> anyhow::Result<()> {
    let store = FileMarkerStore::new(&config.generation.marker_path);
    match store.load().await? {
        Some(marker) if marker.agent_id == agent_id => {
            store.clear().await?;
            println!("Cancelled generation {} for {agent_id}", marker.task_id);
        }
        Some(marker) => {
            println!(
                "Marker belongs to agent {}; leaving it in place",
                marker.agent_id
            );
        }
        None => println!("No generation in flight for {agent_id}"),
    }
    Ok(())
}

async fn print_notifications(mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        println!("{}", format_notification(&notification));
    }
}

fn format_notification(notification: &Notification) -> String {
    let tag = match notification.severity {
        Severity::Info => "info",
        Severity::Success => "ok",
        Severity::Error => "error",
    };
    match &notification.fault {
        Some(fault) => format!(
            "[{tag}] {}: {} ({})",
            notification.title, notification.message, fault.code
        ),
        None => format!("[{tag}] {}: {}", notification.title, notification.message),
    }
}
