#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use loom_core::collaborators::{AgentBridge, ResumeRequest, RunStore, StartRequest};
use loom_core::config::LoomConfig;
use loom_core::memory::{InProcessTransport, MemoryRunStore, MemorySnapshotCache};
use loom_core::{EventRouter, Result, SessionController, SessionError};
use loom_protocol::{parse_envelope, AgentEvent, EventEnvelope, RunInfo, RunStatus, ToolOutcome};
use serde_json::Value;
use tokio::sync::Notify;

pub const FIXTURE_RUN: &str = "run-fixture";

pub fn load_fixture() -> Vec<EventEnvelope> {
    include_str!("../fixtures/subagent_session.jsonl")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let value: Value = serde_json::from_str(line).expect("fixture line is JSON");
            parse_envelope(value).expect("fixture line is a valid envelope")
        })
        .collect()
}

/// The fixture re-scoped to another run id.
pub fn fixture_for(run_id: &str) -> Vec<EventEnvelope> {
    load_fixture()
        .into_iter()
        .map(|mut envelope| {
            envelope.session_id = Some(run_id.to_string());
            envelope
        })
        .collect()
}

pub fn env(run_id: &str, event: AgentEvent) -> EventEnvelope {
    EventEnvelope::new(run_id, event)
}

pub fn user(text: &str) -> AgentEvent {
    AgentEvent::UserMessage {
        text: text.to_string(),
    }
}

pub fn delta(text: &str) -> AgentEvent {
    AgentEvent::MessageDelta {
        text: text.to_string(),
        parent_tool_use_id: None,
    }
}

pub fn complete(message_id: &str, text: &str) -> AgentEvent {
    AgentEvent::MessageComplete {
        message_id: message_id.to_string(),
        text: text.to_string(),
        parent_tool_use_id: None,
    }
}

pub fn tool_start(tool_use_id: &str, name: &str, parent: Option<&str>) -> AgentEvent {
    AgentEvent::ToolStart {
        tool_use_id: tool_use_id.to_string(),
        tool_name: name.to_string(),
        input: Value::Null,
        parent_tool_use_id: parent.map(str::to_string),
    }
}

pub fn tool_end(tool_use_id: &str, status: ToolOutcome, output: &str) -> AgentEvent {
    AgentEvent::ToolEnd {
        tool_use_id: tool_use_id.to_string(),
        status,
        output: Value::String(output.to_string()),
        duration_ms: Some(10),
        parent_tool_use_id: None,
    }
}

pub fn run_state(state: &str) -> AgentEvent {
    AgentEvent::RunState {
        state: state.to_string(),
        error: None,
        error_subtype: None,
    }
}

pub fn session_init(agent_session_id: &str) -> AgentEvent {
    AgentEvent::SessionInit {
        model: Some("claude-sonnet-4".to_string()),
        agent_session_id: Some(agent_session_id.to_string()),
        tools: Vec::new(),
        cwd: Some("/work".to_string()),
        slash_commands: None,
        mcp_servers: None,
        output_style: None,
        permission_mode: None,
        version: None,
        protocol_version: Some(1),
    }
}

pub fn stored_run(id: &str, status: RunStatus, session_id: Option<&str>) -> RunInfo {
    let mut run = RunInfo::new(id, status, "/work");
    run.session_id = session_id.map(str::to_string);
    run
}

/// Agent bridge that records every call and keeps the run store in step.
pub struct RecordingBridge {
    store: Arc<MemoryRunStore>,
    calls: Mutex<Vec<String>>,
    alive: Mutex<HashSet<String>>,
    next_run: Mutex<Option<RunInfo>>,
    resume_gate: Mutex<Option<Arc<Notify>>>,
    fail_start: Mutex<bool>,
}

impl RecordingBridge {
    pub fn new(store: Arc<MemoryRunStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            alive: Mutex::new(HashSet::new()),
            next_run: Mutex::new(None),
            resume_gate: Mutex::new(None),
            fail_start: Mutex::new(false),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls().iter().any(|recorded| recorded == call)
    }

    pub fn set_alive(&self, run_id: &str) {
        self.alive
            .lock()
            .expect("alive lock")
            .insert(run_id.to_string());
    }

    pub fn set_next_run(&self, run: RunInfo) {
        *self.next_run.lock().expect("next run lock") = Some(run);
    }

    pub fn fail_start(&self) {
        *self.fail_start.lock().expect("fail lock") = true;
    }

    /// Holds `resume_session` until the returned gate is notified.
    pub fn gate_resume(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.resume_gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl AgentBridge for RecordingBridge {
    async fn start_session(&self, request: StartRequest) -> Result<RunInfo> {
        self.record(format!("start:{}", request.prompt));
        if *self.fail_start.lock().expect("fail lock") {
            return Err(SessionError::bridge("start_session", "spawn refused"));
        }
        let run = self
            .next_run
            .lock()
            .expect("next run lock")
            .take()
            .unwrap_or_else(|| RunInfo::new("run-new", RunStatus::Running, request.cwd.clone()));
        self.store.insert_run(run.clone());
        self.set_alive(&run.id);
        Ok(run)
    }

    async fn resume_session(&self, request: ResumeRequest) -> Result<()> {
        self.record(format!("resume:{}:{}", request.run_id, request.mode.as_str()));
        let gate = self.resume_gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn fork_session(&self, source: &RunInfo) -> Result<RunInfo> {
        self.record(format!("fork:{}", source.id));
        let forked_id = format!("{}-fork", source.id);
        let mut forked = source.clone();
        forked.id = forked_id.clone();
        forked.status = RunStatus::Idle;

        let copied: Vec<EventEnvelope> = self
            .store
            .load_events(&source.id)
            .await?
            .into_iter()
            .map(|mut envelope| {
                envelope.session_id = Some(forked_id.clone());
                envelope
            })
            .collect();
        self.store.insert_run(forked.clone());
        self.store.set_events(&forked_id, copied);
        Ok(forked)
    }

    async fn connect_session(&self, run_id: &str, session_id: Option<&str>) -> Result<()> {
        self.record(format!("connect:{}:{}", run_id, session_id.unwrap_or("-")));
        Ok(())
    }

    async fn send_message(&self, run_id: &str, text: &str, _attachments: &[String]) -> Result<()> {
        self.record(format!("send:{}:{}", run_id, text));
        Ok(())
    }

    async fn interrupt(&self, run_id: &str) -> Result<()> {
        self.record(format!("interrupt:{}", run_id));
        Ok(())
    }

    async fn stop(&self, run_id: &str) -> Result<()> {
        self.record(format!("stop:{}", run_id));
        self.alive.lock().expect("alive lock").remove(run_id);
        if let Some(mut run) = self.store.run(run_id) {
            run.status = RunStatus::Stopped;
            self.store.insert_run(run);
        }
        Ok(())
    }

    async fn set_model(&self, run_id: &str, model: &str) -> Result<()> {
        self.record(format!("model:{}:{}", run_id, model));
        Ok(())
    }

    async fn is_process_alive(&self, run_id: &str) -> Result<bool> {
        Ok(self.alive.lock().expect("alive lock").contains(run_id))
    }
}

/// A controller wired to in-memory collaborators.
pub struct Harness {
    pub controller: SessionController,
    pub bridge: Arc<RecordingBridge>,
    pub store: Arc<MemoryRunStore>,
    pub snapshots: Arc<MemorySnapshotCache>,
    pub transport: Arc<InProcessTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LoomConfig::default())
    }

    pub fn with_config(config: LoomConfig) -> Self {
        let store = Arc::new(MemoryRunStore::new());
        let bridge = Arc::new(RecordingBridge::new(Arc::clone(&store)));
        let snapshots = Arc::new(MemorySnapshotCache::new());
        let transport = Arc::new(InProcessTransport::new());
        let router = EventRouter::new(transport.clone(), config.router.clone());
        router.start();
        let controller = SessionController::new(bridge.clone(), store.clone(), router, &config)
            .with_snapshot_cache(snapshots.clone());
        Self {
            controller,
            bridge,
            store,
            snapshots,
            transport,
        }
    }

    /// Pushes an event through the transport as the agent would.
    pub fn emit(&self, run_id: &str, event: AgentEvent) {
        let payload = serde_json::to_value(env(run_id, event)).expect("serialize envelope");
        self.transport
            .emit(loom_protocol::SESSION_EVENT_LISTENER, payload);
    }
}
