//! Inference-backend concerns: dialects, lifecycle, readiness
//!
//! The engine is owned by this orchestrator only when `--start-*` is set;
//! otherwise it is probed and used read-only.

pub mod backend;
pub mod lifecycle;
pub mod probe;

pub use backend::{backend_for, Backend, SglangBackend, VllmBackend};
