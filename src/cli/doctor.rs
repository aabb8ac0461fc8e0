//! `personactl doctor` - active health diagnostics.
//!
//! Resolves the configuration, probes the runtime and queue endpoints, and
//! reports whether a generation marker is waiting to be resumed. Each check
//! reports pass/fail with actionable guidance on failures.

use std::path::Path;

use chrono::Utc;

use crate::config::Config;
use crate::generation::{FileMarkerStore, GenerationMarker, MarkerStore};
use crate::transport::health::{EndpointHealth, EndpointHealthState, probe_endpoint};

/// Run diagnostic checks and print results.
pub async fn run_doctor_command(config_path: Option<&Path>, strict: bool) -> anyhow::Result<()> {
    println!("personactl doctor");
    println!("=================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    // ── Configuration ─────────────────────────────────────────

    let config = Config::from_env_with_toml(config_path);
    check(
        "Configuration",
        check_config(&config),
        &mut passed,
        &mut failed,
    );

    match &config {
        Ok(config) => {
            check(
                "API token",
                check_api_token(config),
                &mut passed,
                &mut failed,
            );

            // ── Endpoint reachability ─────────────────────────

            let token = config.api_token.as_ref();
            let runtime =
                probe_endpoint("runtime", &config.runtime_url, config.http_timeout, token).await;
            check(
                "Runtime API",
                endpoint_result(&runtime),
                &mut passed,
                &mut failed,
            );

            let queue =
                probe_endpoint("queue", &config.queue_url, config.http_timeout, token).await;
            check(
                "Queue gateway",
                endpoint_result(&queue),
                &mut passed,
                &mut failed,
            );

            // ── Local state ───────────────────────────────────

            check(
                "Generation marker",
                check_marker(&FileMarkerStore::new(&config.generation.marker_path), config)
                    .await,
                &mut passed,
                &mut failed,
            );
        }
        Err(_) => {
            for name in ["API token", "Runtime API", "Queue gateway", "Generation marker"] {
                check(
                    name,
                    CheckResult::Skip("configuration did not resolve".to_string()),
                    &mut passed,
                    &mut failed,
                );
            }
        }
    }

    // ── Summary ───────────────────────────────────────────────

    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 {
        println!("\n  Some checks failed. Commands against those endpoints will not succeed.");
        if strict {
            anyhow::bail!("doctor strict mode failed with {failed} check(s)");
        }
    }

    Ok(())
}

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn check_config(config: &Result<Config, crate::error::ConfigError>) -> CheckResult {
    match config {
        Ok(config) => CheckResult::Pass(format!(
            "runtime {}, queue {}, poll every {}ms (batch {})",
            config.runtime_url,
            config.queue_url,
            config.poll.interval.as_millis(),
            config.poll.batch_size
        )),
        Err(e) => CheckResult::Fail(format!("{e}")),
    }
}

fn check_api_token(config: &Config) -> CheckResult {
    if config.api_token.is_some() {
        CheckResult::Pass("configured".to_string())
    } else {
        CheckResult::Skip("PERSONACTL_API_TOKEN not set; requests are unauthenticated".to_string())
    }
}

fn endpoint_result(health: &EndpointHealth) -> CheckResult {
    let hint = match health.state {
        EndpointHealthState::Healthy => {
            return CheckResult::Pass(format!("{} ({})", health.url, health.detail));
        }
        EndpointHealthState::InvalidUrl => "fix the URL in config.toml or the environment",
        EndpointHealthState::DnsFailure => "host name does not resolve",
        EndpointHealthState::ConnectFailure => "nothing is listening; is the backend running?",
        EndpointHealthState::Timeout => "raise PERSONACTL_HTTP_TIMEOUT_MS or check the network",
        EndpointHealthState::AuthFailure => "check PERSONACTL_API_TOKEN",
        EndpointHealthState::HttpFailure => "backend returned a server error",
    };
    CheckResult::Fail(format!(
        "{} {} ({}): {hint}",
        health.url,
        health.state.as_str(),
        health.detail
    ))
}

async fn check_marker(store: &dyn MarkerStore, config: &Config) -> CheckResult {
    match store.load().await {
        Ok(None) => CheckResult::Pass("no generation in flight".to_string()),
        Ok(Some(marker)) => describe_marker(&marker, config),
        Err(e) => CheckResult::Fail(format!(
            "{} unreadable: {e}",
            config.generation.marker_path.display()
        )),
    }
}

fn describe_marker(marker: &GenerationMarker, config: &Config) -> CheckResult {
    if marker.is_expired(config.generation.marker_ttl, Utc::now()) {
        CheckResult::Pass(format!(
            "expired task {} for agent {} (cleared on next resume)",
            marker.task_id, marker.agent_id
        ))
    } else {
        CheckResult::Pass(format!(
            "task {} for agent {} is resumable (started {})",
            marker.task_id,
            marker.agent_id,
            marker.started_at.to_rfc3339()
        ))
    }
}
