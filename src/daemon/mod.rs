//! Agent-daemon concerns: HTTP client and child-process supervision

pub mod client;
pub mod supervisor;

pub use client::{DaemonError, HttpDaemonClient, NextTask, TaskResult, TaskSpec, WorkflowApi};
pub use supervisor::{DaemonKill, DaemonSupervisor};
