//! Agent-daemon HTTP client
//!
//! Speaks the daemon's control API (`/api/v1/workflow/*`). Response bodies
//! are validated into typed records exactly once here; runners never
//! re-check shapes per turn. Any malformed body is fatal and carries the
//! full response text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors talking to the agent daemon. All of these abort the workload.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Transport-level failure
    #[error("daemon request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-200 response
    #[error("daemon returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body text
        body: String,
    },

    /// Daemon reported a task failure
    #[error("task {task_index} execution failed: {message}")]
    TaskFailed {
        /// Index of the failed task slot
        task_index: u64,
        /// The daemon's error message
        message: String,
    },

    /// Response body did not match the expected shape
    #[error("malformed daemon response ({detail}); full response: {body}")]
    Malformed {
        /// What was missing or mistyped
        detail: String,
        /// The offending body, verbatim
        body: String,
    },
}

/// Answer to a `next_task` poll
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct NextTask {
    /// Index of the task slot to execute next
    #[serde(default)]
    pub task_index: u64,
    /// True once every slot of the execution has run
    #[serde(default)]
    pub complete: bool,
}

/// One `execute_task` call
#[derive(Debug)]
pub struct TaskSpec<'a> {
    /// Execution handle from `start_workflow`
    pub execution_id: &'a str,
    /// Task slot index from `next_task`
    pub task_index: u64,
    /// Full prompt for this slot
    pub prompt: String,
    /// Per-task generation budget
    pub max_tokens: u32,
    /// Per-call deadline; `None` uses the client default (unbounded)
    pub timeout: Option<Duration>,
}

/// Validated result of an executed task slot
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Generated content
    pub content: String,
    /// Time to first token, milliseconds, as measured by the daemon
    pub ttft_ms: f64,
    /// Time per output token, milliseconds, as measured by the daemon
    pub tpot_ms: f64,
}

/// The daemon RPC seam. The workload runners only see this trait, which
/// keeps them testable against scripted in-memory daemons.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    /// Start a workflow execution, returning its handle.
    async fn start_workflow(&self, workflow: &str) -> Result<String, DaemonError>;

    /// Ask for the next task slot of an execution.
    async fn next_task(&self, execution_id: &str) -> Result<NextTask, DaemonError>;

    /// Execute one task slot with streaming metrics.
    async fn execute_task(&self, spec: TaskSpec<'_>) -> Result<TaskResult, DaemonError>;
}

/// HTTP implementation of [`WorkflowApi`]
pub struct HttpDaemonClient {
    client: Client,
    base_url: String,
}

impl HttpDaemonClient {
    /// Client against the daemon's base URL (e.g. `http://localhost:8081`).
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn read_ok_body(response: reqwest::Response) -> Result<String, DaemonError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DaemonError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, DaemonError> {
        serde_json::from_str(body).map_err(|e| DaemonError::Malformed {
            detail: e.to_string(),
            body: body.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StartWorkflowResponse {
    execution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    success: bool,
    response: Option<ExecutePayload>,
    metrics: Option<ExecuteMetrics>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutePayload {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteMetrics {
    ttft_ms: Option<f64>,
    tpot_ms: Option<f64>,
}

#[async_trait]
impl WorkflowApi for HttpDaemonClient {
    async fn start_workflow(&self, workflow: &str) -> Result<String, DaemonError> {
        let response = self
            .client
            .post(format!("{}/api/v1/workflow/start", self.base_url))
            .json(&json!({ "workflow_name": workflow }))
            .send()
            .await?;
        let body = Self::read_ok_body(response).await?;

        let parsed: StartWorkflowResponse = Self::decode(&body)?;
        parsed.execution_id.ok_or_else(|| DaemonError::Malformed {
            detail: "missing 'execution_id'".into(),
            body,
        })
    }

    async fn next_task(&self, execution_id: &str) -> Result<NextTask, DaemonError> {
        let response = self
            .client
            .get(format!("{}/api/v1/workflow/task/next", self.base_url))
            .query(&[("execution_id", execution_id)])
            .send()
            .await?;
        let body = Self::read_ok_body(response).await?;
        Self::decode(&body)
    }

    async fn execute_task(&self, spec: TaskSpec<'_>) -> Result<TaskResult, DaemonError> {
        let mut request = self
            .client
            .post(format!("{}/api/v1/workflow/task/execute", self.base_url))
            .json(&json!({
                "execution_id": spec.execution_id,
                "task_index": spec.task_index,
                "prompt": spec.prompt,
                "max_tokens": spec.max_tokens,
                "stream": true,
            }));
        if let Some(timeout) = spec.timeout {
            request = request.timeout(timeout);
        }

        let body = Self::read_ok_body(request.send().await?).await?;
        let parsed: ExecuteResponse = Self::decode(&body)?;

        if !parsed.success {
            return match parsed.error {
                Some(message) => Err(DaemonError::TaskFailed {
                    task_index: spec.task_index,
                    message,
                }),
                None => Err(DaemonError::Malformed {
                    detail: "success=false without 'error'".into(),
                    body,
                }),
            };
        }

        let content = parsed
            .response
            .and_then(|r| r.content)
            .ok_or_else(|| DaemonError::Malformed {
                detail: "missing 'response.content'".into(),
                body: body.clone(),
            })?;
        let metrics = parsed.metrics.ok_or_else(|| DaemonError::Malformed {
            detail: "missing 'metrics'".into(),
            body: body.clone(),
        })?;
        let (ttft_ms, tpot_ms) = match (metrics.ttft_ms, metrics.tpot_ms) {
            (Some(ttft), Some(tpot)) => (ttft, tpot),
            _ => {
                return Err(DaemonError::Malformed {
                    detail: "missing 'metrics.ttft_ms' or 'metrics.tpot_ms'".into(),
                    body,
                })
            }
        };

        Ok(TaskResult {
            content,
            ttft_ms,
            tpot_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_response_decoding() {
        let body = r#"{
            "success": true,
            "response": {"content": "once upon a time"},
            "metrics": {"ttft_ms": 41.5, "tpot_ms": 9.25}
        }"#;
        let parsed: ExecuteResponse = HttpDaemonClient::decode(body).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.response.unwrap().content.unwrap(), "once upon a time");
        let metrics = parsed.metrics.unwrap();
        assert_eq!(metrics.ttft_ms, Some(41.5));
        assert_eq!(metrics.tpot_ms, Some(9.25));
    }

    #[test]
    fn test_next_task_decoding_defaults() {
        let parsed: NextTask = HttpDaemonClient::decode(r#"{"task_index": 3}"#).unwrap();
        assert_eq!(parsed.task_index, 3);
        assert!(!parsed.complete);

        let done: NextTask = HttpDaemonClient::decode(r#"{"complete": true}"#).unwrap();
        assert!(done.complete);
    }

    #[test]
    fn test_malformed_body_keeps_full_response() {
        let body = "not even json";
        let err = HttpDaemonClient::decode::<NextTask>(body).unwrap_err();
        match err {
            DaemonError::Malformed { body: b, .. } => assert_eq!(b, body),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
