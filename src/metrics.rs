//! Metrics aggregation and run-result serialization
//!
//! Turn records accumulate in execution order; summaries are computed once
//! at the end and the whole run result is serialized as one indented JSON
//! object, written atomically.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::condition::Condition;

/// Metrics for one executed story turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    /// Turn index, 1-based and consecutive
    pub turn: usize,
    /// Agent profile that produced this turn
    pub agent: String,
    /// Wall-clock time for the whole task execution
    pub elapsed_ms: f64,
    /// Time to first token, as reported by the daemon
    pub ttft_ms: f64,
    /// Time per output token, as reported by the daemon
    pub tpot_ms: f64,
    /// Generated content length in characters
    pub content_chars: usize,
    /// Generated content (needed to build the next prompt)
    pub content: String,
    /// Story context size after this turn, in bytes
    pub context_size: usize,
}

/// Pipeline stage of the cascade workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Issue analysis (fast model in cascade mode)
    Analysis,
    /// Code generation (large model)
    Synthesis,
    /// Fix summary (fast model in cascade mode)
    Summary,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 3] = [Stage::Analysis, Stage::Synthesis, Stage::Summary];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Analysis => "analysis",
            Stage::Synthesis => "synthesis",
            Stage::Summary => "summary",
        };
        f.write_str(name)
    }
}

/// Metrics for one executed cascade stage
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// Task number, 1-based
    pub task: usize,
    /// Which pipeline stage
    pub stage: Stage,
    /// Wall-clock time for the stage
    pub elapsed_ms: f64,
    /// Time to first token, as reported by the daemon
    pub ttft_ms: f64,
    /// Time per output token, as reported by the daemon
    pub tpot_ms: f64,
}

/// Arithmetic mean; zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentile from unsorted values using linear interpolation.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() == 1 {
        return sorted[0];
    }

    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;

    if upper >= sorted.len() {
        sorted[sorted.len() - 1]
    } else {
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Aggregate summary of a story run
#[derive(Debug, Clone, Serialize)]
pub struct StorySummary {
    /// Turns actually executed
    pub turns: usize,
    /// Tokens-per-turn knob
    pub k: u32,
    /// Total wall-clock time of the workload
    pub total_time_seconds: f64,
    /// Mean wall-clock turn time
    pub avg_turn_time_ms: f64,
    /// Mean time to first token
    pub avg_ttft_ms: f64,
    /// Mean time per output token
    pub avg_tpot_ms: f64,
    /// Median TTFT
    pub ttft_p50_ms: f64,
    /// 99th percentile TTFT
    pub ttft_p99_ms: f64,
    /// Median TPOT
    pub tpot_p50_ms: f64,
    /// 99th percentile TPOT
    pub tpot_p99_ms: f64,
    /// Per-turn wall-clock latencies
    pub latency_ms: Vec<f64>,
    /// Per-turn TTFTs
    pub ttft_ms: Vec<f64>,
    /// Per-turn TPOTs
    pub tpot_ms: Vec<f64>,
    /// The concatenated story
    pub final_story: String,
    /// Its length in characters
    pub final_story_chars: usize,
}

impl StorySummary {
    /// Compute the summary from the ordered turn records.
    pub fn from_records(
        records: &[TurnRecord],
        k: u32,
        total: Duration,
        final_story: String,
    ) -> Self {
        let latency_ms: Vec<f64> = records.iter().map(|r| r.elapsed_ms).collect();
        let ttft_ms: Vec<f64> = records.iter().map(|r| r.ttft_ms).collect();
        let tpot_ms: Vec<f64> = records.iter().map(|r| r.tpot_ms).collect();

        Self {
            turns: records.len(),
            k,
            total_time_seconds: total.as_secs_f64(),
            avg_turn_time_ms: mean(&latency_ms),
            avg_ttft_ms: mean(&ttft_ms),
            avg_tpot_ms: mean(&tpot_ms),
            ttft_p50_ms: percentile(&ttft_ms, 0.50),
            ttft_p99_ms: percentile(&ttft_ms, 0.99),
            tpot_p50_ms: percentile(&tpot_ms, 0.50),
            tpot_p99_ms: percentile(&tpot_ms, 0.99),
            final_story_chars: final_story.chars().count(),
            latency_ms,
            ttft_ms,
            tpot_ms,
            final_story,
        }
    }
}

/// Aggregate summary of a cascade run
#[derive(Debug, Clone, Serialize)]
pub struct CascadeSummary {
    /// Fully completed tasks
    pub num_tasks: usize,
    /// Total wall-clock time of the workload
    pub total_time_seconds: f64,
    /// Mean analysis-stage latency
    pub avg_analysis_ms: f64,
    /// Mean synthesis-stage latency
    pub avg_synthesis_ms: f64,
    /// Mean summary-stage latency
    pub avg_summary_ms: f64,
    /// Mean whole-task latency
    pub avg_total_ms: f64,
    /// Per-task analysis latencies
    pub analysis_ms: Vec<f64>,
    /// Per-task synthesis latencies
    pub synthesis_ms: Vec<f64>,
    /// Per-task summary latencies
    pub summary_ms: Vec<f64>,
    /// Per-task totals
    pub total_ms: Vec<f64>,
}

impl CascadeSummary {
    /// Compute the summary from stage records and per-task totals.
    pub fn from_records(records: &[StageRecord], total_ms: Vec<f64>, total: Duration) -> Self {
        let stage_latencies = |stage: Stage| -> Vec<f64> {
            records
                .iter()
                .filter(|r| r.stage == stage)
                .map(|r| r.elapsed_ms)
                .collect()
        };
        let analysis_ms = stage_latencies(Stage::Analysis);
        let synthesis_ms = stage_latencies(Stage::Synthesis);
        let summary_ms = stage_latencies(Stage::Summary);

        Self {
            num_tasks: total_ms.len(),
            total_time_seconds: total.as_secs_f64(),
            avg_analysis_ms: mean(&analysis_ms),
            avg_synthesis_ms: mean(&synthesis_ms),
            avg_summary_ms: mean(&summary_ms),
            avg_total_ms: mean(&total_ms),
            analysis_ms,
            synthesis_ms,
            summary_ms,
            total_ms,
        }
    }
}

/// Story-run payload of the run result
#[derive(Debug, Serialize)]
pub struct StoryReport {
    /// Ordered turn records
    pub per_turn_metrics: Vec<TurnRecord>,
    /// Aggregate summary
    pub summary: StorySummary,
}

/// Cascade-run payload of the run result
#[derive(Debug, Serialize)]
pub struct CascadeReport {
    /// Ordered stage records
    pub per_stage_metrics: Vec<StageRecord>,
    /// Aggregate summary
    pub summary: CascadeSummary,
}

/// Host descriptor embedded in the run result
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    /// Operating system
    pub os: &'static str,
    /// CPU architecture
    pub arch: &'static str,
    /// Logical CPU count
    pub num_cpus: usize,
}

impl HostInfo {
    /// Describe the machine the orchestrator runs on.
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            num_cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Top-level object serialized at the end of a run
#[derive(Debug, Serialize)]
pub struct RunResult<R> {
    /// The condition, echoed verbatim
    pub condition: Condition,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Workload-specific records and summary
    #[serde(flatten)]
    pub report: R,
    /// Host descriptor
    pub host: HostInfo,
}

/// Serialize the run result. Written atomically (temp file + rename) to
/// `output`, or logged to stderr when no path was configured.
pub fn write_result<R: Serialize>(result: &RunResult<R>, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("failed to serialize run result")?;

    match output {
        Some(path) => {
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &json)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            std::fs::rename(&tmp, path)
                .with_context(|| format!("failed to move results into {}", path.display()))?;
            tracing::info!(path = %path.display(), "results written");
        }
        None => {
            tracing::info!("results:\n{json}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(turn: usize, elapsed: f64, ttft: f64, tpot: f64) -> TurnRecord {
        TurnRecord {
            turn,
            agent: if turn % 2 == 1 {
                "story_agent_a".into()
            } else {
                "story_agent_b".into()
            },
            elapsed_ms: elapsed,
            ttft_ms: ttft,
            tpot_ms: tpot,
            content_chars: 12,
            content: "and then some".into(),
            context_size: turn * 14,
        }
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[4.0]), 4.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn test_percentile() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 10.0);
        assert!((percentile(&values, 0.5) - 5.5).abs() < 1e-9);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[42.0], 0.99), 42.0);
    }

    #[test]
    fn test_story_summary_averages_match_arithmetic_mean() {
        let records = vec![
            record(1, 100.0, 40.0, 10.0),
            record(2, 200.0, 60.0, 12.0),
            record(3, 300.0, 80.0, 14.0),
        ];
        let summary = StorySummary::from_records(
            &records,
            8,
            Duration::from_secs_f64(0.6),
            "once upon a time".into(),
        );

        assert_eq!(summary.turns, 3);
        assert!((summary.avg_ttft_ms - 60.0).abs() < 1e-9);
        assert!((summary.avg_tpot_ms - 12.0).abs() < 1e-9);
        assert!((summary.avg_turn_time_ms - 200.0).abs() < 1e-9);
        assert_eq!(summary.latency_ms, vec![100.0, 200.0, 300.0]);
        assert_eq!(summary.final_story_chars, 16);
        assert!((summary.total_time_seconds - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_cascade_summary_groups_stages() {
        let mut records = Vec::new();
        for task in 1..=2 {
            records.push(StageRecord {
                task,
                stage: Stage::Analysis,
                elapsed_ms: 10.0 * task as f64,
                ttft_ms: 5.0,
                tpot_ms: 1.0,
            });
            records.push(StageRecord {
                task,
                stage: Stage::Synthesis,
                elapsed_ms: 100.0 * task as f64,
                ttft_ms: 50.0,
                tpot_ms: 2.0,
            });
            records.push(StageRecord {
                task,
                stage: Stage::Summary,
                elapsed_ms: 20.0 * task as f64,
                ttft_ms: 8.0,
                tpot_ms: 1.5,
            });
        }

        let summary =
            CascadeSummary::from_records(&records, vec![130.0, 260.0], Duration::from_secs(1));
        assert_eq!(summary.num_tasks, 2);
        assert!((summary.avg_analysis_ms - 15.0).abs() < 1e-9);
        assert!((summary.avg_synthesis_ms - 150.0).abs() < 1e-9);
        assert!((summary.avg_summary_ms - 30.0).abs() < 1e-9);
        assert!((summary.avg_total_ms - 195.0).abs() < 1e-9);
        assert_eq!(summary.analysis_ms, vec![10.0, 20.0]);
    }

    #[test]
    fn test_write_result_is_atomic_and_pretty() {
        use crate::condition::{
            CachePolicy, Condition, EngineKind, LaunchMode, StoryCondition, Workload,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");

        let result = RunResult {
            condition: Condition {
                engine: EngineKind::Sglang,
                noise_rate: 0.0,
                noise_seed: 42,
                start_engine: false,
                engine_launch: LaunchMode::Child,
                daemon_bin: "agentd".into(),
                daemon_url: "http://localhost:8081".into(),
                output: Some(path.clone()),
                workload: Workload::Story(StoryCondition {
                    turns: 1,
                    k: 8,
                    policy: CachePolicy::Preserve,
                    small_turn_threshold: 100,
                    backend: "http://localhost:30000".into(),
                    model: "m".into(),
                }),
            },
            started_at: Utc::now(),
            report: StoryReport {
                per_turn_metrics: vec![record(1, 100.0, 40.0, 10.0)],
                summary: StorySummary::from_records(
                    &[record(1, 100.0, 40.0, 10.0)],
                    8,
                    Duration::from_secs(1),
                    "story".into(),
                ),
            },
            host: HostInfo::detect(),
        };

        write_result(&result, Some(&path)).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["condition"]["workload"], "story");
        assert_eq!(value["summary"]["avg_ttft_ms"], 40.0);
        assert_eq!(value["per_turn_metrics"][0]["turn"], 1);
        assert!(written.contains('\n'), "expected indented output");
        assert!(!dir.path().join("result.json.tmp").exists());
    }
}
