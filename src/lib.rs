//! turnbench - latency experiment driver for agentic LLM workflows
//!
//! The orchestrator composes a workflow configuration for one experimental
//! condition, brings up an inference engine and the agent daemon in order,
//! drives a fixed multi-turn workload (optionally under concurrent Poisson
//! background load), records streaming per-turn latency metrics, and tears
//! everything down on every exit path.
//!
//! # Architecture
//!
//! - **condition**: validated model of one experimental condition
//! - **config**: synthesizes the workflow description fed to the agent daemon
//! - **engine**: inference-backend lifecycle, dialects, and readiness probes
//! - **daemon**: agent-daemon HTTP client and child-process supervisor
//! - **workload**: the story-finishing and model-cascade runners
//! - **noise**: Poisson-arrival background request stream
//! - **metrics**: per-turn records, aggregate summaries, result writer
//! - **teardown**: ordered cleanup that runs on every exit path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod condition;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod metrics;
pub mod noise;
pub mod teardown;
pub mod workload;

// Re-export commonly used types
pub use cli::Cli;
pub use condition::{CachePolicy, CascadeMode, Condition, EngineKind, WorkloadKind};
pub use metrics::{RunResult, StageRecord, TurnRecord};
