//! Readiness prober
//!
//! Polls engine and daemon endpoints every 500 ms until healthy or
//! deadline. While waiting on the daemon the prober also watches the
//! daemon-exit channel so a crashed child aborts the wait immediately with
//! the log tail instead of burning the whole deadline.

use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::daemon::supervisor::DaemonSupervisor;
use crate::engine::backend::Backend;

/// How often endpoints are polled
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default deadline for an engine to come up (model load is slow)
pub const ENGINE_DEADLINE: Duration = Duration::from_secs(300);
/// Default deadline for the daemon to come up
pub const DAEMON_DEADLINE: Duration = Duration::from_secs(60);

/// Wait until the engine accepts connections, per its dialect.
pub async fn wait_for_engine(
    client: &Client,
    backend: &dyn Backend,
    base_url: &str,
    deadline: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if backend.probe(client, base_url).await {
            info!(
                engine = %backend.kind(),
                url = base_url,
                waited_secs = start.elapsed().as_secs_f64(),
                "engine is ready"
            );
            return Ok(());
        }
        if start.elapsed() >= deadline {
            bail!(
                "{} engine at {base_url} did not become ready within {}s \
                 (is the container running?)",
                backend.kind(),
                deadline.as_secs()
            );
        }
        debug!(engine = %backend.kind(), url = base_url, "engine not ready yet");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until a backend URL answers anything at all. Used for endpoints
/// without a dedicated dialect (the ollama cascade variants).
pub async fn wait_for_url(client: &Client, base_url: &str, deadline: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if client.get(base_url).send().await.is_ok() {
            info!(url = base_url, "backend is ready");
            return Ok(());
        }
        if start.elapsed() >= deadline {
            bail!(
                "backend at {base_url} did not become ready within {}s",
                deadline.as_secs()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until the daemon's health endpoint returns 200, aborting early if
/// the daemon process exits.
pub async fn wait_for_daemon(
    client: &Client,
    base_url: &str,
    supervisor: &mut DaemonSupervisor,
    deadline: Duration,
) -> Result<()> {
    let start = Instant::now();
    let health_url = format!("{base_url}/api/v1/health");
    loop {
        if let Some(status) = supervisor.try_exited() {
            bail!(
                "agent daemon exited while waiting for readiness ({status}); \
                 last lines of {}:\n{}",
                supervisor.log_path().display(),
                supervisor.log_tail()
            );
        }

        match client.get(&health_url).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                info!(
                    url = base_url,
                    waited_secs = start.elapsed().as_secs_f64(),
                    "agent daemon is ready"
                );
                return Ok(());
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "daemon health not 200 yet")
            }
            Err(e) => debug!(error = %e, "daemon health probe failed"),
        }

        if start.elapsed() >= deadline {
            bail!(
                "agent daemon did not become ready within {}s; last lines of {}:\n{}",
                deadline.as_secs(),
                supervisor.log_path().display(),
                supervisor.log_tail()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
