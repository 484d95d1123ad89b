//! Model-cascade workload
//!
//! Each task is a three-stage pipeline over one software-engineering
//! issue: analysis (fast model in cascade mode), code synthesis (large
//! model), and a short summary (fast model). Issues are drawn round-robin
//! from a fixed pool so `--num-tasks` can exceed the pool size.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::condition::CascadeCondition;
use crate::config::CASCADE_WORKFLOW;
use crate::daemon::client::{TaskSpec, WorkflowApi};
use crate::metrics::{CascadeSummary, Stage, StageRecord};

/// One issue from the fixed pool
pub struct Issue {
    /// The reported problem
    pub issue: &'static str,
    /// The code it concerns
    pub code: &'static str,
}

impl Stage {
    /// Per-stage generation budget
    pub fn max_tokens(&self) -> u32 {
        match self {
            Stage::Analysis => 50,
            Stage::Synthesis => 150,
            Stage::Summary => 30,
        }
    }

    /// Per-stage RPC deadline
    pub fn timeout(&self) -> Duration {
        match self {
            Stage::Analysis | Stage::Summary => Duration::from_secs(120),
            Stage::Synthesis => Duration::from_secs(180),
        }
    }
}

fn stage_prompt(stage: Stage, issue: &Issue) -> String {
    match stage {
        Stage::Analysis => format!(
            "Analyze this software engineering issue and identify the problem:\n\n\
             Issue: {}\n\nCurrent code:\n```python\n{}\n```\n\n\
             Provide a brief analysis: what is the problem, what needs to be fixed, \
             and what approach should be taken?",
            issue.issue, issue.code
        ),
        Stage::Synthesis => format!(
            "Based on the analysis, generate the fixed code for this issue:\n\n\
             Issue: {}\n\nOriginal code:\n```python\n{}\n```\n\n\
             Provide the complete fixed function with proper error handling and edge cases.",
            issue.issue, issue.code
        ),
        Stage::Summary => format!(
            "Summarize the fix that was applied to resolve this issue in 2-3 sentences:\n\n\
             Issue: {}",
            issue.issue
        ),
    }
}

/// Drive `num_tasks` pipelines, returning the ordered stage records and
/// their summary.
pub async fn run(
    api: &dyn WorkflowApi,
    cascade: &CascadeCondition,
) -> Result<(Vec<StageRecord>, CascadeSummary)> {
    let start = Instant::now();
    let mut records: Vec<StageRecord> = Vec::with_capacity(cascade.num_tasks * 3);
    let mut total_ms: Vec<f64> = Vec::with_capacity(cascade.num_tasks);

    'tasks: for task_no in 1..=cascade.num_tasks {
        let issue = &ISSUES[(task_no - 1) % ISSUES.len()];
        info!(
            task = task_no,
            total = cascade.num_tasks,
            "processing issue: {}",
            issue.issue
        );

        let execution_id = api
            .start_workflow(CASCADE_WORKFLOW)
            .await
            .context("failed to start workflow")?;

        let task_start = Instant::now();
        let mut pending: Vec<StageRecord> = Vec::with_capacity(3);

        for stage in Stage::ALL {
            let next = api
                .next_task(&execution_id)
                .await
                .with_context(|| format!("failed to get {stage} task"))?;
            if next.complete {
                // Partial stage records of this task are discarded; the
                // fully recorded tasks stand.
                warn!(
                    task = task_no,
                    %stage,
                    "daemon reported workflow complete early, stopping"
                );
                break 'tasks;
            }

            let stage_start = Instant::now();
            let result = api
                .execute_task(TaskSpec {
                    execution_id: &execution_id,
                    task_index: next.task_index,
                    prompt: stage_prompt(stage, issue),
                    max_tokens: stage.max_tokens(),
                    timeout: Some(stage.timeout()),
                })
                .await
                .with_context(|| format!("failed to execute {stage} task"))?;

            pending.push(StageRecord {
                task: task_no,
                stage,
                elapsed_ms: stage_start.elapsed().as_secs_f64() * 1000.0,
                ttft_ms: result.ttft_ms,
                tpot_ms: result.tpot_ms,
            });
        }

        let task_elapsed_ms = task_start.elapsed().as_secs_f64() * 1000.0;
        info!(
            task = task_no,
            analysis_ms = pending[0].elapsed_ms,
            synthesis_ms = pending[1].elapsed_ms,
            summary_ms = pending[2].elapsed_ms,
            total_ms = task_elapsed_ms,
            "task complete"
        );
        records.extend(pending);
        total_ms.push(task_elapsed_ms);
    }

    let summary = CascadeSummary::from_records(&records, total_ms, start.elapsed());
    Ok((records, summary))
}

/// Realistic software-engineering issues paired with starting code.
pub const ISSUES: [Issue; 20] = [
    Issue {
        issue: "The `validate_email` function incorrectly accepts emails with consecutive dots (e.g., 'user..name@example.com'). Please fix the validation logic.",
        code: "def validate_email(email):\n    return '@' in email and '.' in email.split('@')[1]",
    },
    Issue {
        issue: "The API endpoint `/api/users/{id}` returns 500 error when user ID is not found. It should return 404 with a proper error message instead.",
        code: "def get_user(user_id):\n    user = db.query(User).filter(User.id == user_id).first()\n    return user.to_dict()",
    },
    Issue {
        issue: "The `calculate_total` function doesn't handle negative prices correctly. Negative prices should be treated as discounts and subtracted from the total.",
        code: "def calculate_total(items):\n    return sum(item['price'] for item in items)",
    },
    Issue {
        issue: "The `parse_date` function fails when given dates in 'YYYY-MM-DD' format. Add support for this ISO 8601 format.",
        code: "def parse_date(date_str):\n    return datetime.strptime(date_str, '%m/%d/%Y')",
    },
    Issue {
        issue: "The `find_duplicates` function has O(n²) time complexity. Optimize it to use a hash set for O(n) performance.",
        code: "def find_duplicates(arr):\n    duplicates = []\n    for i in range(len(arr)):\n        for j in range(i+1, len(arr)):\n            if arr[i] == arr[j]:\n                duplicates.append(arr[i])\n    return duplicates",
    },
    Issue {
        issue: "The `sanitize_input` function doesn't escape HTML special characters. This creates an XSS vulnerability. Please fix it.",
        code: "def sanitize_input(text):\n    return text.strip()",
    },
    Issue {
        issue: "The `merge_dicts` function overwrites values when keys conflict. It should merge nested dictionaries recursively instead.",
        code: "def merge_dicts(dict1, dict2):\n    result = dict1.copy()\n    result.update(dict2)\n    return result",
    },
    Issue {
        issue: "The `format_currency` function doesn't handle negative amounts correctly. Negative amounts should be formatted with parentheses: (USD 100.00).",
        code: "def format_currency(amount, currency='USD'):\n    return f'{currency} {amount:.2f}'",
    },
    Issue {
        issue: "The `validate_password` function only checks length. Add checks for: at least one uppercase letter, one lowercase letter, one digit, and one special character.",
        code: "def validate_password(password):\n    return len(password) >= 8",
    },
    Issue {
        issue: "The `retry_request` function doesn't implement exponential backoff. Add exponential backoff with jitter to prevent thundering herd problems.",
        code: "def retry_request(url, max_retries=3):\n    for i in range(max_retries):\n        try:\n            return requests.get(url)\n        except:\n            time.sleep(1)\n    raise Exception('Max retries exceeded')",
    },
    Issue {
        issue: "The `parse_csv` function fails when CSV contains quoted fields with commas. Add proper CSV parsing that handles quoted fields.",
        code: "def parse_csv(csv_text):\n    return [line.split(',') for line in csv_text.split('\\n')]",
    },
    Issue {
        issue: "The `calculate_age` function gives incorrect results for leap year birthdays. Fix the date calculation to handle leap years correctly.",
        code: "def calculate_age(birth_date):\n    today = datetime.now()\n    return (today - birth_date).days // 365",
    },
    Issue {
        issue: "The `sort_by_key` function doesn't handle None values. None values should be sorted to the end of the list.",
        code: "def sort_by_key(items, key_func):\n    return sorted(items, key=key_func)",
    },
    Issue {
        issue: "The `truncate_string` function cuts words in the middle. Modify it to truncate at word boundaries and add ellipsis.",
        code: "def truncate_string(text, max_length):\n    return text[:max_length]",
    },
    Issue {
        issue: "The `find_missing_numbers` function has O(n²) complexity. Optimize it to find all missing numbers in range [1, n] in O(n) time.",
        code: "def find_missing_numbers(arr, n):\n    missing = []\n    for i in range(1, n+1):\n        if i not in arr:\n            missing.append(i)\n    return missing",
    },
    Issue {
        issue: "The `normalize_path` function doesn't handle '..' and '.' correctly. Implement proper path normalization that resolves parent and current directory references.",
        code: "def normalize_path(path):\n    return path.replace('\\\\', '/')",
    },
    Issue {
        issue: "The `batch_process` function processes all items in memory at once. Refactor it to process items in chunks to reduce memory usage.",
        code: "def batch_process(items, process_func):\n    return [process_func(item) for item in items]",
    },
    Issue {
        issue: "The `validate_url` function accepts invalid URLs like 'http://' or 'not-a-url'. Add proper URL validation using regex or a URL parsing library.",
        code: "def validate_url(url):\n    return url.startswith('http://') or url.startswith('https://')",
    },
    Issue {
        issue: "The `format_phone_number` function doesn't handle international formats. Add support for formatting phone numbers in E.164 format (+1234567890).",
        code: "def format_phone_number(phone):\n    return f'({phone[:3]}) {phone[3:6]}-{phone[6:]}'",
    },
    Issue {
        issue: "The `calculate_median` function has O(n log n) complexity due to sorting. Use a selection algorithm to achieve O(n) average case complexity.",
        code: "def calculate_median(numbers):\n    sorted_nums = sorted(numbers)\n    mid = len(sorted_nums) // 2\n    return sorted_nums[mid]",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_budgets_and_timeouts() {
        assert_eq!(Stage::Analysis.max_tokens(), 50);
        assert_eq!(Stage::Synthesis.max_tokens(), 150);
        assert_eq!(Stage::Summary.max_tokens(), 30);

        assert_eq!(Stage::Analysis.timeout(), Duration::from_secs(120));
        assert_eq!(Stage::Synthesis.timeout(), Duration::from_secs(180));
        assert_eq!(Stage::Summary.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_stage_prompts_embed_the_issue() {
        let issue = &ISSUES[0];

        let analysis = stage_prompt(Stage::Analysis, issue);
        assert!(analysis.starts_with("Analyze this software engineering issue"));
        assert!(analysis.contains(issue.issue));
        assert!(analysis.contains(issue.code));

        let synthesis = stage_prompt(Stage::Synthesis, issue);
        assert!(synthesis.contains("generate the fixed code"));
        assert!(synthesis.contains(issue.code));

        let summary = stage_prompt(Stage::Summary, issue);
        assert!(summary.contains("2-3 sentences"));
        assert!(summary.contains(issue.issue));
        assert!(!summary.contains(issue.code));
    }

    #[test]
    fn test_issue_pool_shape() {
        assert_eq!(ISSUES.len(), 20);
        for issue in &ISSUES {
            assert!(!issue.issue.is_empty());
            assert!(issue.code.starts_with("def "));
        }
    }
}
