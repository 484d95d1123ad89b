//! Workflow config synthesizer
//!
//! Emits the hierarchical text document the agent daemon consumes at
//! startup. The exact line layout (indentation, quoting, where the
//! threshold line sits) is the daemon's interface contract, so the emitter
//! builds the document directly instead of going through a serializer.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::condition::{
    qualified_model, CachePolicy, CascadeCondition, CascadeMode, Condition, EngineKind,
    StoryCondition, Workload, WorkloadKind,
};

/// Story workflow name as the daemon sees it
pub const STORY_WORKFLOW: &str = "story_finishing_game";
/// Cascade workflow name as the daemon sees it
pub const CASCADE_WORKFLOW: &str = "task_processor";

/// Render the workflow config for a condition.
pub fn render(condition: &Condition) -> String {
    match &condition.workload {
        Workload::Story(story) => story_config(condition.engine, story, &condition.daemon_url),
        Workload::Cascade(cascade) => cascade_config(cascade, &condition.daemon_url),
    }
}

/// Story config: one shared server, two agent profiles, one workflow with
/// `turns` task slots alternating between them.
///
/// On the vllm path each slot carries `use_context: false` so the
/// orchestrator supplies the full prompt itself and the input content stays
/// identical across cache policies; sglang keeps the daemon-side context
/// concatenation (`use_context: true`) for comparability with earlier runs.
pub fn story_config(engine: EngineKind, story: &StoryCondition, daemon_url: &str) -> String {
    let server = format!("{}_shared", engine.as_str());
    let use_context = match engine {
        EngineKind::Sglang => true,
        EngineKind::Vllm => false,
    };

    let mut out = format!(
        r#"log_format: pretty
log_level: debug
agentic_serving:
  mode: daemon
  daemon:
    listen_address: "{listen}"
  llm_servers:
    - name: "{server}"
      backend:
        type: "{backend_type}"
        endpoint: "{endpoint}"
      model: "{model}"
      context:
        shared: true
      cache:
        policy: "{policy}"
"#,
        listen = listen_address(daemon_url),
        server = server,
        backend_type = engine.as_str(),
        endpoint = story.backend,
        model = qualified_model(&story.model, engine.as_str()),
        policy = story.policy.as_str(),
    );

    if story.policy == CachePolicy::PreserveOnSmallTurns {
        let _ = writeln!(
            out,
            "        small_turn_threshold: {}",
            story.small_turn_threshold
        );
    }

    let _ = write!(
        out,
        r#"  agent_profiles:
    - name: "story_agent_a"
      llm_server: "{server}"
    - name: "story_agent_b"
      llm_server: "{server}"
  workflows:
    - name: "{workflow}"
      tasks:
"#,
        server = server,
        workflow = STORY_WORKFLOW,
    );

    for i in 0..story.turns {
        let agent = if i % 2 == 0 {
            "story_agent_a"
        } else {
            "story_agent_b"
        };
        let _ = writeln!(out, "        - agent_profile: {agent}");
        let _ = writeln!(out, "          use_context: {use_context}");
    }

    out
}

/// Cascade config: one or two servers depending on mode, three agent
/// profiles, one workflow with the three slots in pipeline order.
pub fn cascade_config(cascade: &CascadeCondition, daemon_url: &str) -> String {
    let mut out = format!(
        r#"log_format: pretty
log_level: info
agentic_serving:
  mode: daemon
  daemon:
    listen_address: "{listen}"
  llm_servers:
"#,
        listen = listen_address(daemon_url),
    );

    let fast_server = match cascade.mode {
        CascadeMode::Baseline => {
            let url = cascade.backend_large.as_deref().unwrap_or_default();
            push_server(&mut out, "large_model", "sglang", url, &cascade.model_large);
            "large_model"
        }
        CascadeMode::Cascade => {
            let small = cascade.backend_small.as_deref().unwrap_or_default();
            let large = cascade.backend_large.as_deref().unwrap_or_default();
            push_server(&mut out, "small_model", "sglang", small, &cascade.model_small);
            push_server(&mut out, "large_model", "sglang", large, &cascade.model_large);
            "small_model"
        }
        CascadeMode::BaselineOllama => {
            let url = cascade.backend_ollama.as_deref().unwrap_or_default();
            push_server(&mut out, "large_model", "ollama", url, &cascade.model_large);
            "large_model"
        }
        CascadeMode::CascadeOllama => {
            let url = cascade.backend_ollama.as_deref().unwrap_or_default();
            push_server(&mut out, "small_model", "ollama", url, &cascade.model_small);
            push_server(&mut out, "large_model", "ollama", url, &cascade.model_large);
            "small_model"
        }
    };

    let _ = write!(
        out,
        r#"  agent_profiles:
    - name: "router"
      llm_server: "{fast}"
    - name: "synthesizer"
      llm_server: "large_model"
    - name: "summarizer"
      llm_server: "{fast}"
  workflows:
    - name: "{workflow}"
      tasks:
        - agent_profile: "router"
        - agent_profile: "synthesizer"
        - agent_profile: "summarizer"
"#,
        fast = fast_server,
        workflow = CASCADE_WORKFLOW,
    );

    out
}

fn push_server(out: &mut String, name: &str, backend_type: &str, endpoint: &str, model: &str) {
    let _ = write!(
        out,
        r#"    - name: "{name}"
      backend:
        type: "{backend_type}"
        endpoint: "{endpoint}"
      model: "{model}"
"#,
        name = name,
        backend_type = backend_type,
        endpoint = endpoint,
        model = qualified_model(model, backend_type),
    );
}

/// `localhost:8081` form of the daemon URL for the config's listen address.
fn listen_address(daemon_url: &str) -> &str {
    daemon_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
}

/// Where the workflow config file lives: next to the output artifact when
/// one is configured, otherwise the current directory.
pub fn config_path(
    output: Option<&Path>,
    workload: WorkloadKind,
    started_at: DateTime<Utc>,
) -> PathBuf {
    scratch_dir(output).join(format!(
        "turnbench_{}_{}.yaml",
        workload.as_str(),
        started_at.timestamp()
    ))
}

/// Per-run daemon log file, same directory rule as the config file.
pub fn daemon_log_path(
    output: Option<&Path>,
    workload: WorkloadKind,
    started_at: DateTime<Utc>,
) -> PathBuf {
    scratch_dir(output).join(format!(
        "turnbench_{}_{}_daemon.log",
        workload.as_str(),
        started_at.timestamp()
    ))
}

/// Per-run engine log file for the child launcher, same directory rule.
pub fn engine_log_path(
    output: Option<&Path>,
    workload: WorkloadKind,
    started_at: DateTime<Utc>,
) -> PathBuf {
    scratch_dir(output).join(format!(
        "turnbench_{}_{}_engine.log",
        workload.as_str(),
        started_at.timestamp()
    ))
}

fn scratch_dir(output: Option<&Path>) -> PathBuf {
    output
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAEMON_URL: &str = "http://localhost:8081";

    fn story(turns: usize, policy: CachePolicy, threshold: u32) -> StoryCondition {
        StoryCondition {
            turns,
            k: 8,
            policy,
            small_turn_threshold: threshold,
            backend: "http://localhost:30000".into(),
            model: "mistralai/Mistral-7B-Instruct-v0.3".into(),
        }
    }

    fn task_lines(config: &str) -> Vec<&str> {
        config
            .lines()
            .filter(|l| l.contains("agent_profile:"))
            .map(str::trim)
            .collect()
    }

    #[test]
    fn test_story_config_basic_fields() {
        let config = story_config(
            EngineKind::Sglang,
            &story(5, CachePolicy::AggressiveFlush, 100),
            DAEMON_URL,
        );

        for expected in [
            "log_format: pretty",
            "log_level: debug",
            "mode: daemon",
            "listen_address: \"localhost:8081\"",
            "name: \"sglang_shared\"",
            "type: \"sglang\"",
            "endpoint: \"http://localhost:30000\"",
            "model: \"sglang:mistralai/Mistral-7B-Instruct-v0.3\"",
            "policy: \"aggressive_flush\"",
            "name: \"story_agent_a\"",
            "name: \"story_agent_b\"",
            "name: \"story_finishing_game\"",
        ] {
            assert!(config.contains(expected), "config missing {expected:?}:\n{config}");
        }
    }

    #[test]
    fn test_story_config_task_count_and_alternation() {
        for turns in [1, 4, 5, 100] {
            let config = story_config(
                EngineKind::Sglang,
                &story(turns, CachePolicy::Preserve, 100),
                DAEMON_URL,
            );
            let tasks = task_lines(&config);
            assert_eq!(tasks.len(), turns, "expected {turns} task slots");
            for (i, line) in tasks.iter().enumerate() {
                let expected = if i % 2 == 0 {
                    "story_agent_a"
                } else {
                    "story_agent_b"
                };
                assert!(line.contains(expected), "slot {i}: {line}");
            }
        }
    }

    #[test]
    fn test_story_config_use_context_per_engine() {
        let sglang = story_config(
            EngineKind::Sglang,
            &story(4, CachePolicy::Preserve, 100),
            DAEMON_URL,
        );
        assert_eq!(sglang.matches("use_context: true").count(), 4);
        assert_eq!(sglang.matches("use_context: false").count(), 0);

        let vllm = story_config(
            EngineKind::Vllm,
            &story(4, CachePolicy::Preserve, 100),
            DAEMON_URL,
        );
        assert_eq!(vllm.matches("use_context: false").count(), 4);
        assert!(vllm.contains("name: \"vllm_shared\""));
        assert!(vllm.contains("model: \"vllm:mistralai/Mistral-7B-Instruct-v0.3\""));
    }

    #[test]
    fn test_story_config_threshold_line_iff_policy() {
        let with = story_config(
            EngineKind::Sglang,
            &story(3, CachePolicy::PreserveOnSmallTurns, 32),
            DAEMON_URL,
        );
        assert!(with.contains("policy: \"preserve_on_small_turns\""));
        assert!(with.contains("small_turn_threshold: 32"));

        for policy in [CachePolicy::AggressiveFlush, CachePolicy::Preserve] {
            let without = story_config(EngineKind::Sglang, &story(3, policy, 32), DAEMON_URL);
            assert!(!without.contains("small_turn_threshold"));
        }
    }

    fn cascade(mode: CascadeMode) -> CascadeCondition {
        CascadeCondition {
            mode,
            num_tasks: 5,
            backend_small: Some("http://localhost:30001".into()),
            backend_large: Some("http://localhost:30000".into()),
            backend_ollama: Some("http://localhost:11434".into()),
            model_small: "Qwen/Qwen2.5-0.5B-Instruct".into(),
            model_large: "mistralai/Mistral-7B-Instruct-v0.3".into(),
        }
    }

    fn profile_binding<'a>(config: &'a str, profile: &str) -> &'a str {
        let lines: Vec<&str> = config.lines().collect();
        let idx = lines
            .iter()
            .position(|l| l.contains(&format!("name: \"{profile}\"")))
            .unwrap_or_else(|| panic!("profile {profile} not found"));
        lines[idx + 1].trim()
    }

    #[test]
    fn test_cascade_baseline_binds_everything_to_one_server() {
        let mut condition = cascade(CascadeMode::Baseline);
        condition.backend_large = Some("http://X".into());
        let config = cascade_config(&condition, DAEMON_URL);

        assert_eq!(config.matches("- name: \"large_model\"").count(), 1);
        assert!(!config.contains("small_model"));
        assert!(config.contains("endpoint: \"http://X\""));
        for profile in ["router", "synthesizer", "summarizer"] {
            assert_eq!(
                profile_binding(&config, profile),
                "llm_server: \"large_model\""
            );
        }

        let tasks = task_lines(&config);
        assert_eq!(tasks.len(), 3);
        assert!(tasks[0].contains("router"));
        assert!(tasks[1].contains("synthesizer"));
        assert!(tasks[2].contains("summarizer"));
    }

    #[test]
    fn test_cascade_mode_splits_fast_and_slow_stages() {
        let config = cascade_config(&cascade(CascadeMode::Cascade), DAEMON_URL);

        assert!(config.contains("- name: \"small_model\""));
        assert!(config.contains("- name: \"large_model\""));
        assert!(config.contains("endpoint: \"http://localhost:30001\""));
        assert!(config.contains("endpoint: \"http://localhost:30000\""));
        assert!(config.contains("model: \"sglang:Qwen/Qwen2.5-0.5B-Instruct\""));
        assert_eq!(
            profile_binding(&config, "router"),
            "llm_server: \"small_model\""
        );
        assert_eq!(
            profile_binding(&config, "synthesizer"),
            "llm_server: \"large_model\""
        );
        assert_eq!(
            profile_binding(&config, "summarizer"),
            "llm_server: \"small_model\""
        );
    }

    #[test]
    fn test_cascade_ollama_modes_share_one_endpoint() {
        let baseline = cascade_config(&cascade(CascadeMode::BaselineOllama), DAEMON_URL);
        assert!(baseline.contains("type: \"ollama\""));
        assert!(baseline.contains("model: \"ollama:mistralai/Mistral-7B-Instruct-v0.3\""));
        assert!(!baseline.contains("small_model"));

        let split = cascade_config(&cascade(CascadeMode::CascadeOllama), DAEMON_URL);
        assert_eq!(
            split
                .matches("endpoint: \"http://localhost:11434\"")
                .count(),
            2
        );
        assert_eq!(
            profile_binding(&split, "router"),
            "llm_server: \"small_model\""
        );
    }

    #[test]
    fn test_config_paths_follow_output_artifact() {
        let started = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let with_output = config_path(
            Some(Path::new("results/story/run1.json")),
            WorkloadKind::Story,
            started,
        );
        assert_eq!(
            with_output,
            PathBuf::from("results/story/turnbench_story_1700000000.yaml")
        );

        let without_output = daemon_log_path(None, WorkloadKind::Cascade, started);
        assert_eq!(
            without_output,
            PathBuf::from("./turnbench_cascade_1700000000_daemon.log")
        );
    }
}
