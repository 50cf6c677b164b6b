//! Narrow interfaces to everything the session core drives but does not own.

use std::sync::Arc;

use async_trait::async_trait;
use loom_protocol::{EventEnvelope, RunInfo};
use serde_json::Value;

use crate::error::Result;
use crate::snapshot::SnapshotKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeMode {
    /// Reattach to the recorded upstream session.
    Resume,
    /// Continue the most recent conversation in the working directory.
    Continue,
    /// Branch into a new run.
    Fork,
}

impl ResumeMode {
    pub fn requires_session_id(&self) -> bool {
        matches!(self, ResumeMode::Resume)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeMode::Resume => "resume",
            ResumeMode::Continue => "continue",
            ResumeMode::Fork => "fork",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub prompt: String,
    pub cwd: String,
    pub attachments: Vec<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub run_id: String,
    pub session_id: Option<String>,
    pub mode: ResumeMode,
    pub message: Option<String>,
    pub attachments: Vec<String>,
}

/// Starts, stops, and steers the agent process.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    async fn start_session(&self, request: StartRequest) -> Result<RunInfo>;
    async fn resume_session(&self, request: ResumeRequest) -> Result<()>;
    /// Creates a new run with a copy of the source run's history and session id.
    async fn fork_session(&self, source: &RunInfo) -> Result<RunInfo>;
    async fn connect_session(&self, run_id: &str, session_id: Option<&str>) -> Result<()>;
    async fn send_message(&self, run_id: &str, text: &str, attachments: &[String]) -> Result<()>;
    async fn interrupt(&self, run_id: &str) -> Result<()>;
    async fn stop(&self, run_id: &str) -> Result<()>;
    async fn set_model(&self, run_id: &str, model: &str) -> Result<()>;
    async fn is_process_alive(&self, run_id: &str) -> Result<bool>;
}

/// Persisted run records and their event logs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: &str) -> Result<Option<RunInfo>>;
    async fn load_events(&self, run_id: &str) -> Result<Vec<EventEnvelope>>;
}

#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>>;
    async fn store(&self, key: &SnapshotKey, bytes: Vec<u8>) -> Result<()>;
    /// Removes the run's snapshot under every status.
    async fn invalidate(&self, run_id: &str) -> Result<()>;
}

pub type ListenerCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Push channel delivering named JSON payloads.
pub trait Transport: Send + Sync {
    fn listen(&self, name: &str, callback: ListenerCallback) -> Result<ListenerId>;
    fn unlisten(&self, id: ListenerId);
}
