//! Authoritative in-memory state for one session.
//!
//! The reducer is the single writer of session state. Live events are folded
//! straight into the state; batches are folded into a working copy and
//! committed once, so a large replay publishes a single revision.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use loom_protocol::{EventEnvelope, McpServer, RunInfo, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::classify::{classify_error, ErrorCategory};
use crate::error::ReducerError;
use crate::fold::{fold_event, FoldMode};
use crate::phase::{transition, SessionPhase, Transition};
use crate::timeline::{
    new_entry_id, walk_tools_mut, TimelineEntry, ToolEntry, ToolStatus, UserEntry,
};
use crate::usage::{TurnUsage, UsageState};

/// Output written into tools that can never complete because the run is over.
pub const TERMINATED_TOOL_OUTPUT: &str = "Session ended before this tool returned a result";

const MAX_HOOK_RECORDS: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub output_style: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRecord {
    pub hook_name: String,
    pub hook_event: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: String,
    #[serde(default)]
    pub data: Value,
    pub updated_at: String,
}

/// Side-channel state that is not part of the conversation timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryState {
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub hooks: Vec<HookRecord>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
}

impl AuxiliaryState {
    pub(crate) fn push_hook(&mut self, record: HookRecord) {
        self.hooks.push(record);
        if self.hooks.len() > MAX_HOOK_RECORDS {
            let overflow = self.hooks.len() - MAX_HOOK_RECORDS;
            self.hooks.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBuffer {
    pub text: String,
    pub thinking: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyCounters {
    pub unknown_events: u64,
    pub missing_parents: u64,
    pub orphan_updates: u64,
    pub illegal_transitions: u64,
    pub rejected_snapshots: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentError {
    pub category: ErrorCategory,
    pub message: String,
    /// Set by the response watchdog; cleared by the first content event.
    #[serde(default)]
    pub stalled: bool,
}

impl CurrentError {
    pub fn from_upstream(subtype: Option<&str>, message: &str) -> Self {
        Self {
            category: classify_error(subtype, message),
            message: message.to_string(),
            stalled: false,
        }
    }

    pub fn stalled(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::ServerIssue,
            message: message.into(),
            stalled: true,
        }
    }
}

/// Every mutable field of a session. Batches fold into a clone of this.
#[derive(Debug, Clone, Default)]
pub struct ReducerState {
    pub phase: SessionPhase,
    pub error: Option<CurrentError>,
    pub run: Option<RunInfo>,
    pub timeline: Vec<TimelineEntry>,
    pub usage: UsageState,
    pub turn_usage: Vec<TurnUsage>,
    pub seen_message_ids: BTreeSet<String>,
    pub seen_tool_ids: BTreeSet<String>,
    pub aux: AuxiliaryState,
    /// Live assistant text keyed by routing session id.
    pub streaming: HashMap<String, StreamBuffer>,
    /// A `session_init` arrived since the last spawn.
    pub initialized: bool,
    /// Bumped by every content event; the response watchdog compares it.
    pub content_seq: u64,
    pub anomalies: AnomalyCounters,
}

impl ReducerState {
    pub fn run_status(&self) -> Option<RunStatus> {
        self.run.as_ref().map(|run| run.status)
    }

    pub fn streaming_text(&self, session_key: &str) -> Option<&str> {
        self.streaming
            .get(session_key)
            .map(|buffer| buffer.text.as_str())
            .filter(|text| !text.is_empty())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
            .values()
            .any(|buffer| !buffer.text.is_empty() || !buffer.thinking.is_empty())
    }

    pub(crate) fn set_phase(&mut self, target: SessionPhase, reason: &str) {
        if transition(&mut self.phase, target, reason) == Transition::Forced {
            self.anomalies.illegal_transitions += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRevision {
    pub revision: u64,
    pub phase: SessionPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Rebuild content only; leave phase and error untouched.
    pub replay_only: bool,
    /// Events are fresh from the transport (microbatch), not history.
    pub live: bool,
}

impl BatchOptions {
    pub fn history() -> Self {
        Self::default()
    }

    pub fn replay_only() -> Self {
        Self {
            replay_only: true,
            live: false,
        }
    }

    pub fn live() -> Self {
        Self {
            replay_only: false,
            live: true,
        }
    }
}

pub struct SessionReducer {
    state: ReducerState,
    strict: bool,
    revision: u64,
    publisher: watch::Sender<StateRevision>,
}

impl Default for SessionReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionReducer {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(StateRevision {
            revision: 0,
            phase: SessionPhase::Empty,
        });
        Self {
            state: ReducerState::default(),
            strict: false,
            revision: 0,
            publisher,
        }
    }

    /// A reducer that raises protocol anomalies instead of absorbing them.
    pub fn strict() -> Self {
        let mut reducer = Self::new();
        reducer.strict = true;
        reducer
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn state(&self) -> &ReducerState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe(&self) -> watch::Receiver<StateRevision> {
        self.publisher.subscribe()
    }

    /// Applies one live event and publishes.
    pub fn apply_event(&mut self, envelope: &EventEnvelope) -> Result<(), ReducerError> {
        fold_event(&mut self.state, envelope, FoldMode::LIVE, self.strict)?;
        if self.run_is_terminal() {
            self.finalize_tools();
        }
        self.publish();
        Ok(())
    }

    /// Folds a batch into a working copy and commits once.
    ///
    /// In strict mode the first anomaly aborts the batch and nothing is committed.
    pub fn apply_event_batch(
        &mut self,
        envelopes: &[EventEnvelope],
        options: BatchOptions,
    ) -> Result<Duration, ReducerError> {
        let started = Instant::now();
        let mode = FoldMode {
            live: options.live,
            replay_only: options.replay_only,
        };

        let mut working = self.state.clone();
        for envelope in envelopes {
            fold_event(&mut working, envelope, mode, self.strict)?;
        }
        self.state = working;

        if self.run_is_terminal() {
            self.finalize_tools();
        }

        self.publish();
        let elapsed = started.elapsed();
        tracing::debug!(
            events = envelopes.len(),
            replay_only = options.replay_only,
            elapsed_ms = elapsed.as_millis() as u64,
            "Applied event batch"
        );
        Ok(elapsed)
    }

    pub fn reset(&mut self) {
        self.state = ReducerState::default();
        self.publish();
    }

    pub fn set_run(&mut self, run: RunInfo) {
        self.state.run = Some(run);
        self.publish();
    }

    pub fn set_run_status(&mut self, status: RunStatus) {
        if let Some(run) = self.state.run.as_mut() {
            run.status = status;
        }
        self.publish();
    }

    pub fn set_phase(&mut self, target: SessionPhase, reason: &str) {
        self.state.set_phase(target, reason);
        if target == SessionPhase::Spawning {
            self.state.initialized = false;
        }
        self.publish();
    }

    pub fn set_error(&mut self, error: CurrentError) {
        self.state.error = Some(error);
        self.publish();
    }

    pub fn clear_error(&mut self) {
        if self.state.error.take().is_some() {
            self.publish();
        }
    }

    /// Inserts a local echo of a message the user just sent.
    pub fn push_optimistic_user(&mut self, text: &str, attachments: &[String]) {
        self.state.timeline.push(TimelineEntry::User(UserEntry {
            id: new_entry_id("user"),
            timestamp: Utc::now().to_rfc3339(),
            text: text.to_string(),
            attachments: attachments.to_vec(),
            optimistic: true,
        }));
        self.publish();
    }

    /// Resolves every still-open tool of a terminated run to an error.
    pub fn finalize_terminal(&mut self) -> usize {
        let resolved = self.finalize_tools();
        if resolved > 0 {
            self.publish();
        }
        resolved
    }

    fn run_is_terminal(&self) -> bool {
        self.state
            .run_status()
            .map(|status| status.is_terminal())
            .unwrap_or(false)
    }

    fn finalize_tools(&mut self) -> usize {
        let mut resolved = 0usize;
        walk_tools_mut(&mut self.state.timeline, &mut |tool: &mut ToolEntry| {
            if !tool.tool.status.is_terminal() {
                tool.tool.status = ToolStatus::Error;
                tool.tool.output = Value::String(TERMINATED_TOOL_OUTPUT.to_string());
                resolved += 1;
            }
        });
        if resolved > 0 {
            tracing::debug!(resolved, "Finalized open tools of terminated run");
        }
        resolved
    }

    pub(crate) fn state_mut(&mut self) -> &mut ReducerState {
        &mut self.state
    }

    pub(crate) fn publish(&mut self) {
        self.revision += 1;
        self.publisher.send_replace(StateRevision {
            revision: self.revision,
            phase: self.state.phase,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_protocol::AgentEvent;
    use serde_json::json;

    fn env(event: AgentEvent) -> EventEnvelope {
        EventEnvelope::new("s-1", event)
    }

    #[test]
    fn batch_publishes_once() {
        let mut reducer = SessionReducer::new();
        let receiver = reducer.subscribe();
        let before = reducer.revision();

        reducer
            .apply_event_batch(
                &[
                    env(AgentEvent::UserMessage {
                        text: "one".to_string(),
                    }),
                    env(AgentEvent::UserMessage {
                        text: "two".to_string(),
                    }),
                    env(AgentEvent::UserMessage {
                        text: "three".to_string(),
                    }),
                ],
                BatchOptions::history(),
            )
            .expect("batch");

        assert_eq!(reducer.revision(), before + 1);
        assert_eq!(receiver.borrow().revision, before + 1);
        assert_eq!(reducer.state().timeline.len(), 3);
    }

    #[test]
    fn strict_batch_commits_nothing_on_anomaly() {
        let mut reducer = SessionReducer::strict();
        let result = reducer.apply_event_batch(
            &[
                env(AgentEvent::UserMessage {
                    text: "hi".to_string(),
                }),
                env(AgentEvent::Unknown {
                    event_type: "mystery".to_string(),
                }),
            ],
            BatchOptions::history(),
        );

        assert_eq!(
            result.expect_err("strict"),
            ReducerError::UnknownEventType("mystery".to_string())
        );
        assert!(reducer.state().timeline.is_empty());
    }

    #[test]
    fn finalize_terminal_walks_sub_timelines() {
        let mut reducer = SessionReducer::new();
        reducer
            .apply_event_batch(
                &[
                    env(AgentEvent::ToolStart {
                        tool_use_id: "task".to_string(),
                        tool_name: "Task".to_string(),
                        input: json!({}),
                        parent_tool_use_id: None,
                    }),
                    env(AgentEvent::ToolStart {
                        tool_use_id: "child".to_string(),
                        tool_name: "Bash".to_string(),
                        input: json!({}),
                        parent_tool_use_id: Some("task".to_string()),
                    }),
                ],
                BatchOptions::replay_only(),
            )
            .expect("batch");

        assert_eq!(reducer.finalize_terminal(), 2);
        let task = reducer.state().timeline[0].as_tool().expect("task");
        assert_eq!(task.tool.status, ToolStatus::Error);
        let child = task.sub_timeline[0].as_tool().expect("child");
        assert_eq!(child.tool.output, json!(TERMINATED_TOOL_OUTPUT));
    }

    #[test]
    fn terminal_run_state_finalizes_on_either_path() {
        let events = [
            env(AgentEvent::ToolStart {
                tool_use_id: "bash".to_string(),
                tool_name: "Bash".to_string(),
                input: json!({}),
                parent_tool_use_id: None,
            }),
            env(AgentEvent::RunState {
                state: "completed".to_string(),
                error: None,
                error_subtype: None,
            }),
        ];

        let mut single = SessionReducer::new();
        single.set_run(RunInfo::new("run-1", RunStatus::Running, "/work"));
        for envelope in &events {
            single.apply_event(envelope).expect("apply");
        }

        let mut batched = SessionReducer::new();
        batched.set_run(RunInfo::new("run-1", RunStatus::Running, "/work"));
        batched
            .apply_event_batch(&events, BatchOptions::live())
            .expect("batch");

        for reducer in [&single, &batched] {
            assert_eq!(reducer.state().run_status(), Some(RunStatus::Completed));
            let tool = reducer.state().timeline[0].as_tool().expect("tool");
            assert_eq!(tool.tool.status, ToolStatus::Error);
            assert_eq!(tool.tool.output, json!(TERMINATED_TOOL_OUTPUT));
        }
    }

    #[test]
    fn hook_log_is_bounded() {
        let mut aux = AuxiliaryState::default();
        for index in 0..(MAX_HOOK_RECORDS + 5) {
            aux.push_hook(HookRecord {
                hook_name: format!("hook-{}", index),
                hook_event: "PostToolUse".to_string(),
                status: "success".to_string(),
                output: None,
                recorded_at: "2026-02-01T00:00:00Z".to_string(),
            });
        }
        assert_eq!(aux.hooks.len(), MAX_HOOK_RECORDS);
        assert_eq!(aux.hooks[0].hook_name, "hook-5");
    }
}
