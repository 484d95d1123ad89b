//! Backend lifecycle manager
//!
//! Starts and stops an inference engine in a container. Two launchers
//! cover the same requirement (start a long-lived subsystem, keep its
//! output visible, tear it down deterministically):
//!
//! - **child** (default, portable): the container runs as an in-process
//!   child with stdout/stderr piped to a per-run log file;
//! - **window**: the container runs inside a detached terminal-multiplexer
//!   window, so its output stays interactively inspectable next to the
//!   orchestrator.
//!
//! Command construction is pure and unit-tested; process execution is
//! confined to the `run` helper.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::condition::{EngineKind, LaunchMode};

/// Environment variable overriding the container startup command verbatim.
pub const LAUNCH_OVERRIDE_ENV: &str = "ENGINE_LAUNCH_COMMAND";
/// Privilege credential for the container runtime.
pub const SUDO_PASSWORD_ENV: &str = "SUDO_PASSWORD";

/// A started engine; consumed by [`teardown`].
pub enum EngineHandle {
    /// In-process child running the container command
    Child {
        /// The launcher shell process
        child: Child,
    },
    /// Detached multiplexer window owns the container
    Window,
}

/// Extract the host port from a backend URL. The engine URLs always carry
/// an explicit port; a bare URL is a config mistake worth failing on.
pub fn host_port(backend_url: &str) -> Result<u16> {
    let url =
        Url::parse(backend_url).with_context(|| format!("invalid backend URL '{backend_url}'"))?;
    url.port()
        .ok_or_else(|| anyhow::anyhow!("backend URL '{backend_url}' carries no explicit port"))
}

/// `docker run` arguments (without the runtime prefix) for an engine kind.
pub fn docker_run_args(kind: EngineKind, host_port: u16, model: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "--rm",
        "--gpus",
        "all",
        "--name",
        kind.container_name(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("-p".into());
    args.push(format!("{host_port}:{}", kind.container_port()));
    args.push("-v".into());
    args.push("$HOME/.cache/huggingface:/root/.cache/huggingface".into());

    match kind {
        EngineKind::Sglang => {
            args.extend(
                ["--shm-size", "32g", "--ipc=host", "lmsysorg/sglang:latest"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            args.extend(
                [
                    "python3",
                    "-m",
                    "sglang.launch_server",
                    "--model-path",
                    model,
                    "--host",
                    "0.0.0.0",
                    "--port",
                    "30000",
                    "--mem-fraction-static",
                    "0.85",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
        }
        EngineKind::Vllm => {
            args.extend(
                ["--ipc=host", "vllm/vllm-openai:latest", "--model", model]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
    }

    args
}

/// Full shell command that starts the container through the privileged
/// runtime, or the operator's verbatim override.
pub fn launch_command(
    kind: EngineKind,
    host_port: u16,
    model: &str,
    override_cmd: Option<&str>,
) -> String {
    if let Some(cmd) = override_cmd {
        return cmd.to_string();
    }
    format!(
        "echo \"${SUDO_PASSWORD_ENV}\" | sudo -S docker {}",
        docker_run_args(kind, host_port, model).join(" ")
    )
}

/// Bring the engine up: remove any stale container by name, then start the
/// container under the configured launcher.
pub async fn start(
    kind: EngineKind,
    mode: LaunchMode,
    backend_url: &str,
    model: &str,
    log_path: &Path,
) -> Result<EngineHandle> {
    if std::env::var_os(SUDO_PASSWORD_ENV).is_none() {
        bail!("{SUDO_PASSWORD_ENV} must be set to start the engine container");
    }

    // A leftover container from a previous run would collide on name/port.
    remove_container(kind).await;

    let port = host_port(backend_url)?;
    let override_cmd = std::env::var(LAUNCH_OVERRIDE_ENV).ok();
    let command = launch_command(kind, port, model, override_cmd.as_deref());

    match mode {
        LaunchMode::Child => start_child(kind, &command, log_path).await,
        LaunchMode::Window => start_window(kind, &command).await,
    }
}

async fn start_child(kind: EngineKind, command: &str, log_path: &Path) -> Result<EngineHandle> {
    let log = std::fs::File::create(log_path)
        .with_context(|| format!("failed to create engine log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("failed to clone engine log handle")?;

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .context("failed to start the engine container")?;

    info!(
        engine = %kind,
        container = kind.container_name(),
        log = %log_path.display(),
        "engine container starting as child process"
    );
    Ok(EngineHandle::Child { child })
}

async fn start_window(kind: EngineKind, command: &str) -> Result<EngineHandle> {
    if std::env::var_os("TMUX").is_none() {
        bail!(
            "the window launcher requires running inside tmux so the \
             engine output stays inspectable in a sibling window"
        );
    }
    let sudo_password = std::env::var(SUDO_PASSWORD_ENV)
        .with_context(|| format!("{SUDO_PASSWORD_ENV} must be set to start the engine container"))?;

    // The new window must be able to invoke the privileged runtime
    run(
        "tmux",
        &["set-environment", SUDO_PASSWORD_ENV, &sudo_password],
    )
    .await
    .context("failed to propagate the container-runtime credential into tmux")?;

    // Trailing shell keeps the window alive if the container exits
    let window_command = format!("{command}; exec bash");
    run(
        "tmux",
        &[
            "new-window",
            "-d",
            "-n",
            kind.container_name(),
            &window_command,
        ],
    )
    .await
    .context("failed to open the engine window")?;

    info!(
        engine = %kind,
        window = kind.container_name(),
        "engine container starting in detached tmux window"
    );
    Ok(EngineHandle::Window)
}

/// Force-remove the engine container by name. Absence is not an error.
pub async fn remove_container(kind: EngineKind) {
    let cmd = format!(
        "echo \"${SUDO_PASSWORD_ENV}\" | sudo -S docker rm -f {}",
        kind.container_name()
    );
    if let Err(e) = run("sh", &["-c", &cmd]).await {
        debug!(container = kind.container_name(), error = %e, "container removal skipped");
    }
}

/// Kill the engine window. Absence is not an error.
pub async fn kill_window(kind: EngineKind) {
    if let Err(e) = run("tmux", &["kill-window", "-t", kind.container_name()]).await {
        debug!(window = kind.container_name(), error = %e, "window kill skipped");
    }
}

/// Release the container plus whatever hosts it, tolerating targets that
/// are already gone.
pub async fn teardown(kind: EngineKind, handle: EngineHandle) {
    info!(engine = %kind, "tearing down engine");
    remove_container(kind).await;
    match handle {
        EngineHandle::Child { mut child } => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "engine launcher already gone");
            }
        }
        EngineHandle::Window => kill_window(kind).await,
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        warn!(program, ?args, %status, "command exited nonzero");
        bail!("{program} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_extraction() {
        assert_eq!(host_port("http://localhost:30000").unwrap(), 30000);
        assert_eq!(host_port("http://10.0.0.5:8000/v1").unwrap(), 8000);
        assert!(host_port("http://localhost").is_err());
        assert!(host_port("not a url").is_err());
    }

    #[test]
    fn test_sglang_docker_args() {
        let args =
            docker_run_args(EngineKind::Sglang, 30123, "mistralai/Mistral-7B-Instruct-v0.3");
        let joined = args.join(" ");

        assert!(joined.contains("--name turnbench-sglang"));
        assert!(joined.contains("-p 30123:30000"));
        assert!(joined.contains("--shm-size 32g"));
        assert!(joined.contains("--ipc=host"));
        assert!(joined.contains("lmsysorg/sglang:latest"));
        assert!(joined.contains("sglang.launch_server"));
        assert!(joined.contains("--model-path mistralai/Mistral-7B-Instruct-v0.3"));
        assert!(joined.contains("--mem-fraction-static 0.85"));
    }

    #[test]
    fn test_vllm_docker_args() {
        let args = docker_run_args(EngineKind::Vllm, 8000, "mistralai/Mistral-7B-Instruct-v0.3");
        let joined = args.join(" ");

        assert!(joined.contains("--name turnbench-vllm"));
        assert!(joined.contains("-p 8000:8000"));
        assert!(joined.contains("vllm/vllm-openai:latest"));
        assert!(joined.contains("--model mistralai/Mistral-7B-Instruct-v0.3"));
        assert!(!joined.contains("sglang"));
    }

    #[test]
    fn test_launch_command_uses_privileged_runtime() {
        let cmd = launch_command(EngineKind::Sglang, 30000, "m", None);
        assert!(cmd.starts_with("echo \"$SUDO_PASSWORD\" | sudo -S docker run"));
    }

    #[test]
    fn test_launch_command_override_wins() {
        let cmd = launch_command(EngineKind::Vllm, 8000, "m", Some("./start-engine.sh"));
        assert_eq!(cmd, "./start-engine.sh");
    }
}
