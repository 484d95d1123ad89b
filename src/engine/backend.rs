//! Engine dialects
//!
//! The two supported engines differ in how readiness is detected and in the
//! shape of a direct chat-completion request (used by the noise generator,
//! which bypasses the daemon). Everything dialect-specific lives behind the
//! [`Backend`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::condition::EngineKind;

/// Engine-specific probe and request shapes
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which engine this dialect speaks
    fn kind(&self) -> EngineKind;

    /// Paths whose response (any status) means the engine accepts
    /// connections
    fn ready_paths(&self) -> &[&str];

    /// Probe readiness: any HTTP response without a protocol error counts.
    /// The goal is "accepts connections", not "returns 200".
    async fn probe(&self, client: &Client, base_url: &str) -> bool {
        for path in self.ready_paths() {
            if client.get(format!("{base_url}{path}")).send().await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Chat-completion endpoint for direct (daemon-bypassing) requests
    fn chat_url(&self, base_url: &str) -> String;

    /// Request body for one direct chat completion
    fn chat_body(&self, model: &str, prompt: &str, max_tokens: u32) -> Value;
}

/// SGLang: ollama-compatible chat path, several candidate info endpoints
pub struct SglangBackend;

#[async_trait]
impl Backend for SglangBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Sglang
    }

    fn ready_paths(&self) -> &[&str] {
        // /model_info is known to respond; the rest cover older builds
        &["/model_info", "/api/tags", "/api/version", "/health", "/"]
    }

    fn chat_url(&self, base_url: &str) -> String {
        format!("{base_url}/api/chat")
    }

    fn chat_body(&self, model: &str, prompt: &str, max_tokens: u32) -> Value {
        json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
            "options": {"num_predict": max_tokens},
        })
    }
}

/// vLLM: OpenAI-compatible surface
pub struct VllmBackend;

#[async_trait]
impl Backend for VllmBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Vllm
    }

    fn ready_paths(&self) -> &[&str] {
        &["/v1/models"]
    }

    fn chat_url(&self, base_url: &str) -> String {
        format!("{base_url}/v1/chat/completions")
    }

    fn chat_body(&self, model: &str, prompt: &str, max_tokens: u32) -> Value {
        json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
            "max_tokens": max_tokens,
        })
    }
}

/// Dialect for an engine kind.
pub fn backend_for(kind: EngineKind) -> Arc<dyn Backend> {
    match kind {
        EngineKind::Sglang => Arc::new(SglangBackend),
        EngineKind::Vllm => Arc::new(VllmBackend),
    }
}
