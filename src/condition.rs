//! Experimental condition model
//!
//! A [`Condition`] is the immutable, validated record of one experimental
//! run. It is built from CLI flags before any external action is taken;
//! every invalid flag combination is rejected here with a [`ConditionError`]
//! naming the offending option.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Validation errors for an experimental condition
#[derive(Debug, Error)]
pub enum ConditionError {
    /// Unrecognized cache strategy shorthand
    #[error("invalid --cache-strategy '{0}': expected 'flush' or 'preserve'")]
    InvalidCacheStrategy(String),

    /// Unrecognized daemon cache policy
    #[error(
        "invalid --policy '{0}': expected 'aggressive_flush', 'preserve' \
         or 'preserve_on_small_turns'"
    )]
    InvalidPolicy(String),

    /// Both policy spellings supplied at once
    #[error("--cache-strategy and --policy are mutually exclusive")]
    ConflictingPolicyFlags,

    /// Unrecognized backend type
    #[error("invalid --backend-type '{0}': expected 'sglang' or 'vllm'")]
    InvalidBackendType(String),

    /// Unrecognized cascade mode
    #[error(
        "invalid --mode '{0}': expected 'baseline', 'cascade', \
         'baseline-ollama' or 'cascade-ollama'"
    )]
    InvalidMode(String),

    /// Unrecognized engine launcher
    #[error("invalid --engine-launcher '{0}': expected 'child' or 'window'")]
    InvalidLaunchMode(String),

    /// Zero or negative numeric knob
    #[error("{flag} must be at least 1")]
    NotPositive {
        /// The offending flag
        flag: &'static str,
    },

    /// Negative noise rate
    #[error("--noise-rate must be >= 0, got {0}")]
    NegativeNoiseRate(f64),

    /// Both engine start flags set
    #[error("--start-sglang and --start-vllm are mutually exclusive")]
    ConflictingStartFlags,

    /// Start flag disagrees with the backend type
    #[error("--start-{engine} requires --backend-type {engine}")]
    StartFlagMismatch {
        /// The engine named by the start flag
        engine: EngineKind,
    },

    /// Start flag used with a cascade mode that needs more than one engine
    #[error("starting the engine is only supported for single-backend modes, not '{0}'")]
    StartEngineUnsupported(CascadeMode),

    /// Cascade mode without both backend URLs
    #[error("--mode cascade requires both --backend-small and --backend-large")]
    MissingCascadeBackend,

    /// Required environment variable absent
    #[error("{var} must be set: {reason}")]
    MissingEnv {
        /// The variable name
        var: &'static str,
        /// Why it is required
        reason: &'static str,
    },
}

/// Which workload this condition drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Two agents alternating story turns
    Story,
    /// Three-stage analysis/synthesis/summary pipelines
    Cascade,
}

impl WorkloadKind {
    /// Short name used in file names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Story => "story",
            WorkloadKind::Cascade => "cascade",
        }
    }
}

/// Daemon KV-cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Flush the cache between tasks
    AggressiveFlush,
    /// Preserve the cache across tasks
    Preserve,
    /// Preserve only while turns stay under a token threshold
    PreserveOnSmallTurns,
}

impl CachePolicy {
    /// The daemon's spelling of this policy
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::AggressiveFlush => "aggressive_flush",
            CachePolicy::Preserve => "preserve",
            CachePolicy::PreserveOnSmallTurns => "preserve_on_small_turns",
        }
    }

    /// Parse the `--cache-strategy` shorthand (`flush` | `preserve`)
    pub fn from_strategy(s: &str) -> Result<Self, ConditionError> {
        match s {
            "flush" => Ok(CachePolicy::AggressiveFlush),
            "preserve" => Ok(CachePolicy::Preserve),
            other => Err(ConditionError::InvalidCacheStrategy(other.to_string())),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggressive_flush" => Ok(CachePolicy::AggressiveFlush),
            "preserve" => Ok(CachePolicy::Preserve),
            "preserve_on_small_turns" => Ok(CachePolicy::PreserveOnSmallTurns),
            other => Err(ConditionError::InvalidPolicy(other.to_string())),
        }
    }
}

/// Inference engine flavor behind the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// SGLang server (ollama-compatible chat path, prefix-aware radix cache)
    Sglang,
    /// vLLM OpenAI-compatible server (prefix-hash block cache, no flush knob)
    Vllm,
}

impl EngineKind {
    /// Backend type tag as the daemon config spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sglang => "sglang",
            EngineKind::Vllm => "vllm",
        }
    }

    /// Default backend URL when `--backend` is not supplied
    pub fn default_backend_url(&self) -> &'static str {
        match self {
            EngineKind::Sglang => "http://localhost:30000",
            EngineKind::Vllm => "http://localhost:8000",
        }
    }

    /// Fixed container name used when this orchestrator starts the engine
    pub fn container_name(&self) -> &'static str {
        match self {
            EngineKind::Sglang => "turnbench-sglang",
            EngineKind::Vllm => "turnbench-vllm",
        }
    }

    /// Port the engine listens on inside its container
    pub fn container_port(&self) -> u16 {
        match self {
            EngineKind::Sglang => 30000,
            EngineKind::Vllm => 8000,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sglang" => Ok(EngineKind::Sglang),
            "vllm" => Ok(EngineKind::Vllm),
            other => Err(ConditionError::InvalidBackendType(other.to_string())),
        }
    }
}

/// How a started engine is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// In-process child with output piped to a per-run log file
    Child,
    /// Detached terminal-multiplexer window (engine output stays
    /// interactively inspectable; requires a tmux session)
    Window,
}

impl FromStr for LaunchMode {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child" => Ok(LaunchMode::Child),
            "window" => Ok(LaunchMode::Window),
            other => Err(ConditionError::InvalidLaunchMode(other.to_string())),
        }
    }
}

/// Backend assignment mode for the cascade workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CascadeMode {
    /// All three stages on the large-model server
    Baseline,
    /// Router and summarizer on the small model, synthesizer on the large
    Cascade,
    /// Baseline routing against a single ollama endpoint
    BaselineOllama,
    /// Cascade routing against a single ollama endpoint
    CascadeOllama,
}

impl CascadeMode {
    /// The CLI spelling of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeMode::Baseline => "baseline",
            CascadeMode::Cascade => "cascade",
            CascadeMode::BaselineOllama => "baseline-ollama",
            CascadeMode::CascadeOllama => "cascade-ollama",
        }
    }
}

impl std::fmt::Display for CascadeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CascadeMode {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(CascadeMode::Baseline),
            "cascade" => Ok(CascadeMode::Cascade),
            "baseline-ollama" => Ok(CascadeMode::BaselineOllama),
            "cascade-ollama" => Ok(CascadeMode::CascadeOllama),
            other => Err(ConditionError::InvalidMode(other.to_string())),
        }
    }
}

/// Story-workload knobs
#[derive(Debug, Clone, Serialize)]
pub struct StoryCondition {
    /// Number of turns to run
    pub turns: usize,
    /// Tokens generated per turn
    pub k: u32,
    /// Daemon cache policy
    pub policy: CachePolicy,
    /// Token threshold for `preserve_on_small_turns`
    pub small_turn_threshold: u32,
    /// Inference backend URL
    pub backend: String,
    /// Model served by the backend (unprefixed)
    pub model: String,
}

/// Cascade-workload knobs
#[derive(Debug, Clone, Serialize)]
pub struct CascadeCondition {
    /// Backend assignment mode
    pub mode: CascadeMode,
    /// Number of three-stage pipelines to run
    pub num_tasks: usize,
    /// Small-model backend URL (cascade mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_small: Option<String>,
    /// Large-model backend URL (baseline and cascade modes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_large: Option<String>,
    /// Shared ollama backend URL (ollama modes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_ollama: Option<String>,
    /// Small model identifier (unprefixed)
    pub model_small: String,
    /// Large model identifier (unprefixed)
    pub model_large: String,
}

/// Workload-specific part of a condition
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "workload", rename_all = "snake_case")]
pub enum Workload {
    /// Story-finishing knobs
    Story(StoryCondition),
    /// Model-cascade knobs
    Cascade(CascadeCondition),
}

/// Immutable record of one experimental run
#[derive(Debug, Clone, Serialize)]
pub struct Condition {
    /// Engine flavor (affects probes, noise request shape, flush emulation)
    pub engine: EngineKind,
    /// Poisson arrival rate for background noise, requests/second (0 = off)
    pub noise_rate: f64,
    /// Seed for the noise arrival process
    pub noise_seed: u64,
    /// Whether this orchestrator brings the engine up and down
    pub start_engine: bool,
    /// How a started engine is hosted
    pub engine_launch: LaunchMode,
    /// Agent daemon executable
    pub daemon_bin: String,
    /// Agent daemon control API base URL
    pub daemon_url: String,
    /// Run-result artifact path; stderr log when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Workload kind plus its knobs
    #[serde(flatten)]
    pub workload: Workload,
}

impl Condition {
    /// Which workload this condition drives
    pub fn workload_kind(&self) -> WorkloadKind {
        match self.workload {
            Workload::Story(_) => WorkloadKind::Story,
            Workload::Cascade(_) => WorkloadKind::Cascade,
        }
    }

    /// Cross-field invariants; every violation is reported before any
    /// external action.
    pub fn validate(&self) -> Result<(), ConditionError> {
        if self.noise_rate < 0.0 {
            return Err(ConditionError::NegativeNoiseRate(self.noise_rate));
        }

        match &self.workload {
            Workload::Story(story) => {
                if story.turns == 0 {
                    return Err(ConditionError::NotPositive { flag: "--turns" });
                }
                if story.k == 0 {
                    return Err(ConditionError::NotPositive { flag: "--k" });
                }
                if story.policy == CachePolicy::PreserveOnSmallTurns
                    && story.small_turn_threshold < 1
                {
                    return Err(ConditionError::NotPositive {
                        flag: "--small-turn-threshold",
                    });
                }
            }
            Workload::Cascade(cascade) => {
                if cascade.num_tasks == 0 {
                    return Err(ConditionError::NotPositive { flag: "--num-tasks" });
                }
                if cascade.mode == CascadeMode::Cascade
                    && (cascade.backend_small.is_none() || cascade.backend_large.is_none())
                {
                    return Err(ConditionError::MissingCascadeBackend);
                }
                if self.start_engine && cascade.mode != CascadeMode::Baseline {
                    return Err(ConditionError::StartEngineUnsupported(cascade.mode));
                }
            }
        }

        Ok(())
    }

    /// Environment prerequisites for starting the engine. Separate from
    /// [`validate`](Self::validate) so flag invariants stay testable without
    /// touching the process environment.
    pub fn check_environment(&self) -> Result<(), ConditionError> {
        if self.start_engine {
            if self.engine_launch == LaunchMode::Window && std::env::var_os("TMUX").is_none() {
                return Err(ConditionError::MissingEnv {
                    var: "TMUX",
                    reason: "the window launcher needs a tmux session so the \
                             engine output stays inspectable in a sibling window",
                });
            }
            if std::env::var_os("SUDO_PASSWORD").is_none() {
                return Err(ConditionError::MissingEnv {
                    var: "SUDO_PASSWORD",
                    reason: "the engine container is started through a privileged \
                             container runtime",
                });
            }
        }
        Ok(())
    }

    /// Backend URL and model the engine launcher should bring up.
    /// Only meaningful when `start_engine` is set.
    pub fn engine_launch_target(&self) -> (&str, &str) {
        match &self.workload {
            Workload::Story(story) => (&story.backend, &story.model),
            Workload::Cascade(cascade) => {
                // validate() restricts start_engine to baseline mode
                let url = cascade
                    .backend_large
                    .as_deref()
                    .unwrap_or_else(|| self.engine.default_backend_url());
                (url, &cascade.model_large)
            }
        }
    }

    /// Backend the noise generator should load. Ollama modes share the
    /// sglang chat dialect.
    pub fn noise_target(&self) -> (&str, &str) {
        match &self.workload {
            Workload::Story(story) => (&story.backend, &story.model),
            Workload::Cascade(cascade) => match cascade.mode {
                CascadeMode::Baseline | CascadeMode::Cascade => (
                    cascade
                        .backend_large
                        .as_deref()
                        .unwrap_or_else(|| self.engine.default_backend_url()),
                    &cascade.model_large,
                ),
                CascadeMode::BaselineOllama | CascadeMode::CascadeOllama => (
                    cascade.backend_ollama.as_deref().unwrap_or_default(),
                    &cascade.model_large,
                ),
            },
        }
    }
}

/// Prefix a model identifier with the backend type tag the daemon expects,
/// unless it already carries one.
pub fn qualified_model(model: &str, backend_type: &str) -> String {
    if model.contains(':') {
        model.to_string()
    } else {
        format!("{backend_type}:{model}")
    }
}
