//! CLI argument parsing and the end-to-end run driver
//!
//! One orchestrator process drives exactly one experimental condition:
//! config synthesis, engine/daemon bring-up in dependency order, workload
//! execution under optional noise, result writing, then teardown. Teardown
//! runs on every exit path, including a fatal signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::info;

use crate::condition::{
    CachePolicy, CascadeCondition, CascadeMode, Condition, EngineKind, LaunchMode, StoryCondition,
    Workload,
};
use crate::daemon::client::HttpDaemonClient;
use crate::daemon::supervisor::{self, DaemonSupervisor};
use crate::engine::{backend_for, lifecycle, probe};
use crate::metrics::{self, CascadeReport, HostInfo, RunResult, StoryReport};
use crate::noise::{NoiseGenerator, DEFAULT_SEED};
use crate::teardown::{self, Teardown};
use crate::workload::{cascade, story};
use crate::{condition::ConditionError, config};

/// Latency experiment driver for multi-turn agentic LLM workflows
#[derive(Parser, Debug)]
#[command(name = "turnbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two agents alternate story turns under a KV-cache policy
    Story(StoryArgs),
    /// Three-stage pipelines under baseline or cascade model routing
    Cascade(CascadeArgs),
}

/// Flags shared by both workloads
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Inference engine flavor: sglang | vllm
    #[arg(long, default_value = "sglang")]
    pub backend_type: String,

    /// Poisson arrival rate for background noise, requests/second (0 = off)
    #[arg(long, default_value_t = 0.0)]
    pub noise_rate: f64,

    /// Seed for the noise arrival process
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub noise_seed: u64,

    /// Start an sglang container in a detached tmux window before the run
    #[arg(long)]
    pub start_sglang: bool,

    /// Start a vllm container in a detached tmux window before the run
    #[arg(long)]
    pub start_vllm: bool,

    /// How a started engine is hosted: child | window
    #[arg(long, default_value = "child")]
    pub engine_launcher: String,

    /// File to write the run result to (logged to stderr when omitted)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Agent daemon executable
    #[arg(long, env = "TURNBENCH_DAEMON_BIN", default_value = "agentd")]
    pub daemon_bin: String,

    /// Agent daemon control API base URL
    #[arg(long, default_value = "http://localhost:8081")]
    pub daemon_url: String,
}

impl CommonArgs {
    fn resolve(
        &self,
        workload: Workload,
    ) -> Result<Condition, ConditionError> {
        let engine: EngineKind = self.backend_type.parse()?;

        if self.start_sglang && self.start_vllm {
            return Err(ConditionError::ConflictingStartFlags);
        }
        if self.start_sglang && engine != EngineKind::Sglang {
            return Err(ConditionError::StartFlagMismatch {
                engine: EngineKind::Sglang,
            });
        }
        if self.start_vllm && engine != EngineKind::Vllm {
            return Err(ConditionError::StartFlagMismatch {
                engine: EngineKind::Vllm,
            });
        }

        let condition = Condition {
            engine,
            noise_rate: self.noise_rate,
            noise_seed: self.noise_seed,
            start_engine: self.start_sglang || self.start_vllm,
            engine_launch: self.engine_launcher.parse::<LaunchMode>()?,
            daemon_bin: self.daemon_bin.clone(),
            daemon_url: self.daemon_url.clone(),
            output: self.output.clone(),
            workload,
        };
        condition.validate()?;
        Ok(condition)
    }
}

/// Story workload flags
#[derive(Args, Debug)]
pub struct StoryArgs {
    /// Number of turns
    #[arg(long, default_value_t = 100)]
    pub turns: usize,

    /// Tokens generated per turn
    #[arg(long, default_value_t = 8)]
    pub k: u32,

    /// Cache strategy shorthand: flush | preserve
    #[arg(long, conflicts_with = "policy")]
    pub cache_strategy: Option<String>,

    /// Daemon cache policy: aggressive_flush | preserve | preserve_on_small_turns
    #[arg(long)]
    pub policy: Option<String>,

    /// Token threshold for preserve_on_small_turns
    #[arg(long, default_value_t = 100)]
    pub small_turn_threshold: u32,

    /// Inference backend URL (default depends on --backend-type)
    #[arg(long)]
    pub backend: Option<String>,

    /// Model served by the backend
    #[arg(long, default_value = "mistralai/Mistral-7B-Instruct-v0.3")]
    pub model: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl StoryArgs {
    /// Resolve flags into a validated condition.
    pub fn into_condition(self) -> Result<Condition, ConditionError> {
        let policy = match (&self.cache_strategy, &self.policy) {
            (Some(_), Some(_)) => return Err(ConditionError::ConflictingPolicyFlags),
            (Some(strategy), None) => CachePolicy::from_strategy(strategy)?,
            (None, Some(policy)) => policy.parse()?,
            (None, None) => CachePolicy::AggressiveFlush,
        };

        let engine: EngineKind = self.common.backend_type.parse()?;
        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| engine.default_backend_url().to_string());

        self.common.resolve(Workload::Story(StoryCondition {
            turns: self.turns,
            k: self.k,
            policy,
            small_turn_threshold: self.small_turn_threshold,
            backend,
            model: self.model.clone(),
        }))
    }
}

/// Cascade workload flags
#[derive(Args, Debug)]
pub struct CascadeArgs {
    /// Backend assignment mode: baseline | cascade | baseline-ollama | cascade-ollama
    #[arg(long, default_value = "baseline")]
    pub mode: String,

    /// Number of three-stage pipelines to run
    #[arg(long, default_value_t = 20)]
    pub num_tasks: usize,

    /// URL of the large-model backend
    #[arg(long)]
    pub backend_large: Option<String>,

    /// URL of the small-model backend (cascade mode)
    #[arg(long)]
    pub backend_small: Option<String>,

    /// URL of the shared ollama backend (ollama modes)
    #[arg(long)]
    pub backend_ollama: Option<String>,

    /// Large model identifier
    #[arg(long, default_value = "mistralai/Mistral-7B-Instruct-v0.3")]
    pub model_large: String,

    /// Small model identifier
    #[arg(long, default_value = "Qwen/Qwen2.5-0.5B-Instruct")]
    pub model_small: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl CascadeArgs {
    /// Resolve flags into a validated condition.
    pub fn into_condition(self) -> Result<Condition, ConditionError> {
        let mode: CascadeMode = self.mode.parse()?;
        let engine: EngineKind = self.common.backend_type.parse()?;

        let backend_large = match mode {
            // Baseline falls back to the engine default; split cascade must
            // name both backends explicitly.
            CascadeMode::Baseline => Some(
                self.backend_large
                    .clone()
                    .unwrap_or_else(|| engine.default_backend_url().to_string()),
            ),
            CascadeMode::Cascade => self.backend_large.clone(),
            CascadeMode::BaselineOllama | CascadeMode::CascadeOllama => None,
        };
        let backend_small = match mode {
            CascadeMode::Cascade => self.backend_small.clone(),
            _ => None,
        };
        let backend_ollama = match mode {
            CascadeMode::BaselineOllama | CascadeMode::CascadeOllama => Some(
                self.backend_ollama
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
            ),
            _ => None,
        };

        self.common.resolve(Workload::Cascade(CascadeCondition {
            mode,
            num_tasks: self.num_tasks,
            backend_small,
            backend_large,
            backend_ollama,
            model_small: self.model_small.clone(),
            model_large: self.model_large.clone(),
        }))
    }
}

impl Cli {
    /// Run the condition end-to-end. Teardown runs on success, failure and
    /// fatal signals alike; the exit code is nonzero on any fatal error.
    pub async fn run(self) -> Result<()> {
        let condition = match self.command {
            Command::Story(args) => args.into_condition()?,
            Command::Cascade(args) => args.into_condition()?,
        };
        condition.check_environment()?;

        if let Some(output) = &condition.output {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
        }

        let mut teardown = Teardown::new();
        let result = tokio::select! {
            result = drive(&condition, &mut teardown) => result,
            signal = teardown::shutdown_signal() => {
                Err(anyhow::anyhow!("interrupted by {signal}"))
            }
        };
        teardown.run().await;

        if let Err(e) = &result {
            tracing::error!("experiment failed: {e:#}");
        }
        result
    }
}

/// The run phase proper. Every acquired resource registers its release
/// with the teardown registry before the next step runs.
async fn drive(condition: &Condition, teardown: &mut Teardown) -> Result<()> {
    let started_at = Utc::now();
    let workload_kind = condition.workload_kind();
    info!(
        workload = workload_kind.as_str(),
        engine = %condition.engine,
        noise_rate = condition.noise_rate,
        "starting experiment"
    );

    // Workflow config for the daemon
    let config_path = config::config_path(condition.output.as_deref(), workload_kind, started_at);
    tokio::fs::write(&config_path, config::render(condition))
        .await
        .with_context(|| format!("failed to write workflow config {}", config_path.display()))?;
    info!(path = %config_path.display(), "workflow config written");
    {
        let path = config_path.clone();
        teardown.register("remove workflow config", move || async move {
            tokio::fs::remove_file(&path).await.map_err(Into::into)
        });
    }

    // Engine bring-up, when this orchestrator owns it
    if condition.start_engine {
        let (backend_url, model) = condition.engine_launch_target();
        let engine_log =
            config::engine_log_path(condition.output.as_deref(), workload_kind, started_at);
        let handle = lifecycle::start(
            condition.engine,
            condition.engine_launch,
            backend_url,
            model,
            &engine_log,
        )
        .await?;
        let kind = condition.engine;
        teardown.register("remove engine container", move || async move {
            lifecycle::teardown(kind, handle).await;
            Ok(())
        });
    }

    // Backends must accept connections before the daemon starts
    let probe_client = Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .context("failed to build probe client")?;
    wait_for_backends(condition, &probe_client).await?;

    // Daemon bring-up
    supervisor::kill_stale(&condition.daemon_bin).await;
    let log_path = config::daemon_log_path(condition.output.as_deref(), workload_kind, started_at);
    let (mut daemon, daemon_kill) =
        DaemonSupervisor::spawn(&condition.daemon_bin, &config_path, log_path)?;
    teardown.register("terminate agent daemon", move || async move {
        daemon_kill.kill();
        Ok(())
    });
    probe::wait_for_daemon(
        &probe_client,
        &condition.daemon_url,
        &mut daemon,
        probe::DAEMON_DEADLINE,
    )
    .await?;

    // Optional background noise, cancelled when the workload ends
    let (noise_stop, _) = broadcast::channel(1);
    if condition.noise_rate > 0.0 {
        let (noise_url, noise_model) = condition.noise_target();
        let generator = Arc::new(NoiseGenerator::new(
            backend_for(condition.engine),
            noise_url.to_string(),
            noise_model.to_string(),
            condition.noise_rate,
            condition.noise_seed,
        ));
        tokio::spawn(generator.run(noise_stop.subscribe()));
        let stop = noise_stop.clone();
        teardown.register("stop noise generator", move || async move {
            let _ = stop.send(());
            Ok(())
        });
    }

    // The workload itself: sequential, one daemon RPC in flight at a time
    info!("running experiment...");
    let api = HttpDaemonClient::new(condition.daemon_url.clone());
    let workload_result = match &condition.workload {
        Workload::Story(story_condition) => {
            story::run(&api, condition.engine, story_condition)
                .await
                .map(|(records, summary)| Report::Story(StoryReport {
                    per_turn_metrics: records,
                    summary,
                }))
        }
        Workload::Cascade(cascade_condition) => cascade::run(&api, cascade_condition)
            .await
            .map(|(records, summary)| Report::Cascade(CascadeReport {
                per_stage_metrics: records,
                summary,
            })),
    };
    let _ = noise_stop.send(());

    // A daemon crash mid-workload surfaces as an RPC error; point at the log
    let report = match workload_result {
        Ok(report) => report,
        Err(e) => {
            if let Some(status) = daemon.try_exited() {
                return Err(e.context(format!(
                    "agent daemon exited mid-workload ({status}); last lines of {}:\n{}",
                    daemon.log_path().display(),
                    daemon.log_tail()
                )));
            }
            return Err(e);
        }
    };

    // Serialize the run result before teardown releases anything
    let host = HostInfo::detect();
    match report {
        Report::Story(report) => metrics::write_result(
            &RunResult {
                condition: condition.clone(),
                started_at,
                report,
                host,
            },
            condition.output.as_deref(),
        )?,
        Report::Cascade(report) => metrics::write_result(
            &RunResult {
                condition: condition.clone(),
                started_at,
                report,
                host,
            },
            condition.output.as_deref(),
        )?,
    }

    info!("experiment completed successfully");
    Ok(())
}

enum Report {
    Story(StoryReport),
    Cascade(CascadeReport),
}

/// Probe every backend the condition uses: dialect-specific for the story
/// engine, any-response for the cascade endpoints.
async fn wait_for_backends(condition: &Condition, client: &Client) -> Result<()> {
    match &condition.workload {
        Workload::Story(story_condition) => {
            let backend = backend_for(condition.engine);
            probe::wait_for_engine(
                client,
                backend.as_ref(),
                &story_condition.backend,
                probe::ENGINE_DEADLINE,
            )
            .await
        }
        Workload::Cascade(cascade_condition) => {
            let urls = [
                cascade_condition.backend_small.as_deref(),
                cascade_condition.backend_large.as_deref(),
                cascade_condition.backend_ollama.as_deref(),
            ];
            for url in urls.into_iter().flatten() {
                probe::wait_for_url(client, url, probe::ENGINE_DEADLINE).await?;
            }
            Ok(())
        }
    }
}
