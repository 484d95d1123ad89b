//! Daemon supervisor
//!
//! Spawns the agent daemon as a child process with stdout/stderr captured
//! in a per-run log file, and watches for an unexpected exit. A watcher
//! task owns the child: it forwards the exit status over a single-producer
//! single-consumer channel, or kills the child when the teardown
//! coordinator says so.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Handle for killing the daemon from teardown. Separate from the
/// supervisor so the cleanup action can own it while the run phase keeps
/// watching the exit channel.
pub struct DaemonKill {
    tx: Option<oneshot::Sender<()>>,
}

impl DaemonKill {
    /// Ask the watcher to kill the child if it is still running.
    pub fn kill(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Watches the daemon child process
pub struct DaemonSupervisor {
    exit_rx: mpsc::Receiver<ExitStatus>,
    log_path: PathBuf,
}

impl DaemonSupervisor {
    /// Spawn the daemon with its output redirected to `log_path`.
    pub fn spawn(
        bin: &str,
        config_path: &Path,
        log_path: PathBuf,
    ) -> Result<(Self, DaemonKill)> {
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("failed to create daemon log file {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .context("failed to clone daemon log handle")?;

        let child = Command::new(bin)
            .arg("daemon")
            .arg("--config")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| format!("failed to start agent daemon '{bin}'"))?;

        info!(
            daemon = bin,
            pid = child.id(),
            log = %log_path.display(),
            "agent daemon started"
        );

        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch(child, exit_tx, kill_rx));

        Ok((
            Self { exit_rx, log_path },
            DaemonKill { tx: Some(kill_tx) },
        ))
    }

    /// Non-blocking check whether the daemon has exited.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.exit_rx.try_recv().ok()
    }

    /// Path of the daemon's log file
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Last lines of the daemon log, for error messages.
    pub fn log_tail(&self) -> String {
        log_tail(&self.log_path, 20)
    }
}

/// Kill any stale daemon left over from a previous run so it cannot hold
/// the listen address. Absence is not an error.
pub async fn kill_stale(bin: &str) {
    let status = Command::new("killall")
        .arg(bin)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            warn!(daemon = bin, "killed a stale daemon from a previous run")
        }
        _ => debug!(daemon = bin, "no stale daemon to kill"),
    }
}

async fn watch(
    mut child: Child,
    exit_tx: mpsc::Sender<ExitStatus>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => {
                    warn!(%status, "agent daemon exited");
                    let _ = exit_tx.send(status).await;
                }
                Err(e) => warn!(error = %e, "failed to wait on agent daemon"),
            }
        }
        _ = kill_rx => {
            debug!("terminating agent daemon");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill agent daemon");
            }
        }
    }
}

/// Last `lines` lines of a log file, joined with newlines. Unreadable logs
/// degrade to a note rather than an error.
pub fn log_tail(path: &Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(e) => format!("<could not read daemon log {}: {e}>", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_tail_returns_last_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 1..=30 {
            writeln!(file, "line {i}").unwrap();
        }

        let tail = log_tail(file.path(), 20);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "line 11");
        assert_eq!(lines[19], "line 30");
    }

    #[test]
    fn test_log_tail_short_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only line").unwrap();

        assert_eq!(log_tail(file.path(), 20), "only line");
    }

    #[test]
    fn test_log_tail_missing_file() {
        let tail = log_tail(Path::new("/nonexistent/daemon.log"), 20);
        assert!(tail.contains("could not read daemon log"));
    }

    #[tokio::test]
    async fn test_watcher_reports_child_exit() {
        // `true` exits immediately, standing in for a crashing daemon
        let child = Command::new("true").spawn().unwrap();
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let (_kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch(child, exit_tx, kill_rx));

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("watcher should report the exit")
            .expect("exit status should be forwarded");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_watcher_kill_stops_child() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, exit_tx, kill_rx));

        kill_tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), watcher)
            .await
            .expect("watcher should finish after the kill")
            .unwrap();
        // A kill is not reported as a natural exit
        assert!(exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_writes_log_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("daemon.log");

        // `true` ignores the daemon args and exits zero immediately
        let (mut supervisor, _kill) =
            DaemonSupervisor::spawn("true", Path::new("config.yaml"), log_path.clone()).unwrap();

        let mut exited = None;
        for _ in 0..50 {
            if let Some(status) = supervisor.try_exited() {
                exited = Some(status);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(exited.is_some(), "child exit was never reported");
        assert!(log_path.exists());
    }
}
