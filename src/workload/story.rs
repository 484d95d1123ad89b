//! Story-finishing workload
//!
//! Two agents alternate for `turns` turns; each turn generates `k` tokens
//! given the story so far. The prompt is built from the orchestrator's own
//! growing `story_context` rather than the daemon's context concatenation,
//! so the semantic input is identical across cache policies and only the
//! KV-cache behavior at the daemon/engine varies.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::condition::{CachePolicy, EngineKind, StoryCondition};
use crate::config::STORY_WORKFLOW;
use crate::daemon::client::{TaskSpec, WorkflowApi};
use crate::metrics::{StorySummary, TurnRecord};

/// Task slots the daemon runs per workflow execution before the
/// orchestrator requests a fresh handle (the two-agent pattern)
const SLOTS_PER_EXECUTION: usize = 2;

/// Prompt template, parameterized by the turn budget and the story so far.
pub fn construct_prompt(context: &str, k: u32) -> String {
    format!(
        "We are playing a story finishing game. It is your turn. You are only \n\
         allowed to give me the next {k} tokens. You must give me exactly the next {k} \n\
         tokens to finish the story. The story starts as follows:\n\
         \n\
         Once upon a time {context}"
    )
}

/// Cache-flush emulation for vllm, which exposes no explicit flush knob:
/// a unique per-turn disambiguator defeats its prefix-hash cache so a
/// `flush` condition actually re-prefills. Pure so both the behavior and
/// its fixtures stay explicit.
pub fn decorate_prompt(
    engine: EngineKind,
    policy: CachePolicy,
    turn: usize,
    prompt: String,
) -> String {
    if engine == EngineKind::Vllm && policy == CachePolicy::AggressiveFlush {
        format!("Request {turn}.\n\n{prompt}")
    } else {
        prompt
    }
}

/// Drive the story workload to completion, returning the ordered turn
/// records and their summary.
pub async fn run(
    api: &dyn WorkflowApi,
    engine: EngineKind,
    story: &StoryCondition,
) -> Result<(Vec<TurnRecord>, StorySummary)> {
    let mut story_context = String::new();
    let mut records: Vec<TurnRecord> = Vec::with_capacity(story.turns);
    let start = Instant::now();
    let mut executions = 0usize;

    while records.len() < story.turns {
        executions += 1;
        if executions > story.turns {
            // A daemon that always reports complete must not spin silently
            bail!(
                "daemon reported workflow complete after {} of {} turns",
                records.len(),
                story.turns
            );
        }

        // Fresh execution handle: this boundary is where the daemon's
        // cache policy takes effect.
        let execution_id = api
            .start_workflow(STORY_WORKFLOW)
            .await
            .context("failed to start workflow")?;

        for _ in 0..SLOTS_PER_EXECUTION {
            if records.len() >= story.turns {
                break;
            }

            let next = api
                .next_task(&execution_id)
                .await
                .context("failed to get next task")?;
            if next.complete {
                break;
            }

            let turn = records.len() + 1;
            let prompt = decorate_prompt(
                engine,
                story.policy,
                turn,
                construct_prompt(&story_context, story.k),
            );

            let turn_start = Instant::now();
            let result = api
                .execute_task(TaskSpec {
                    execution_id: &execution_id,
                    task_index: next.task_index,
                    prompt,
                    max_tokens: story.k,
                    timeout: None,
                })
                .await
                .with_context(|| format!("failed to execute task {}", next.task_index))?;
            let elapsed = turn_start.elapsed();

            let content = result.content.trim();
            if !content.is_empty() {
                if story_context.is_empty() {
                    story_context = content.to_string();
                } else {
                    story_context.push(' ');
                    story_context.push_str(content);
                }
            }

            let agent = if next.task_index % 2 == 0 {
                "story_agent_a"
            } else {
                "story_agent_b"
            };
            records.push(TurnRecord {
                turn,
                agent: agent.to_string(),
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                ttft_ms: result.ttft_ms,
                tpot_ms: result.tpot_ms,
                content_chars: content.chars().count(),
                content: content.to_string(),
                context_size: story_context.len(),
            });

            info!(
                turn,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                ttft_ms = result.ttft_ms,
                tpot_ms = result.tpot_ms,
                "turn complete: {content}"
            );

            if turn % 10 == 0 {
                info!(
                    turn,
                    context_chars = story_context.len(),
                    "story so far: {}...",
                    preview(&story_context, 120)
                );
            }
        }
    }

    let summary = StorySummary::from_records(&records, story.k, start.elapsed(), story_context);
    Ok((records, summary))
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_template_mentions_budget_and_context() {
        let prompt = construct_prompt("", 8);
        assert!(prompt.contains("We are playing a story finishing game"));
        assert!(prompt.contains("next 8 tokens"));
        assert!(prompt.ends_with("Once upon a time "));

        let prompt = construct_prompt("there was a dragon", 16);
        assert!(prompt.contains("next 16 tokens"));
        assert!(prompt.contains("Once upon a time there was a dragon"));
    }

    #[test]
    fn test_decorate_prompt_only_for_vllm_flush() {
        let base = || construct_prompt("", 4);

        let decorated = decorate_prompt(EngineKind::Vllm, CachePolicy::AggressiveFlush, 3, base());
        assert!(decorated.starts_with("Request 3.\n\n"));

        for (engine, policy) in [
            (EngineKind::Vllm, CachePolicy::Preserve),
            (EngineKind::Sglang, CachePolicy::AggressiveFlush),
            (EngineKind::Sglang, CachePolicy::Preserve),
            (EngineKind::Sglang, CachePolicy::PreserveOnSmallTurns),
        ] {
            let untouched = decorate_prompt(engine, policy, 3, base());
            assert_eq!(untouched, base(), "{engine:?}/{policy:?} must not decorate");
        }
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("héllo wörld", 5), "héllo");
        assert_eq!(preview("ab", 5), "ab");
    }
}
