//! Event contract between the agent transport and the loom session reducer.
//!
//! This crate is shared by the reducer and its transport adapters to prevent
//! schema drift. The reducer remains the authority on how events are applied;
//! this crate only defines their shape and validates envelopes.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_EVENT_ID_LEN: usize = 128;

/// Session-scoped events (JSON envelopes carrying a `session_id`).
pub const SESSION_EVENT_LISTENER: &str = "agent://session-event";
/// Raw stdout lines from the agent process.
pub const PROCESS_STDOUT_LISTENER: &str = "agent://process-stdout";
/// Raw stderr lines from the agent process.
pub const PROCESS_STDERR_LISTENER: &str = "agent://process-stderr";
/// Out-of-session control signals (process exit, transport resets).
pub const CONTROL_SIGNAL_LISTENER: &str = "agent://control-signal";

pub const LISTENER_NAMES: [&str; 4] = [
    SESSION_EVENT_LISTENER,
    PROCESS_STDOUT_LISTENER,
    PROCESS_STDERR_LISTENER,
    CONTROL_SIGNAL_LISTENER,
];

/// Wire names of every event type the reducer understands.
pub const KNOWN_EVENT_TYPES: [&str; 19] = [
    "session_init",
    "message_delta",
    "thinking_delta",
    "message_complete",
    "user_message",
    "tool_start",
    "tool_input_delta",
    "tool_end",
    "permission_prompt",
    "permission_denied",
    "control_cancelled",
    "run_state",
    "usage_update",
    "compact_boundary",
    "task_notification",
    "hook_event",
    "mcp_status",
    "command_output",
    "raw",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    #[serde(alias = "ok", alias = "completed")]
    Success,
    #[serde(alias = "failed")]
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// One protocol event emitted by the agent process.
///
/// `Unknown` is never produced by serde; [`parse_envelope`] maps unrecognised
/// `type` values to it so the reducer can count them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionInit {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        agent_session_id: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        slash_commands: Option<Vec<String>>,
        #[serde(default)]
        mcp_servers: Option<Vec<McpServer>>,
        #[serde(default)]
        output_style: Option<String>,
        #[serde(default)]
        permission_mode: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        protocol_version: Option<u32>,
    },
    MessageDelta {
        text: String,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    ThinkingDelta {
        text: String,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    MessageComplete {
        message_id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    UserMessage {
        text: String,
    },
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    ToolInputDelta {
        tool_use_id: String,
        partial_json: String,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    ToolEnd {
        tool_use_id: String,
        status: ToolOutcome,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    PermissionPrompt {
        tool_use_id: String,
        request_id: String,
        #[serde(default)]
        suggestions: Option<Value>,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    PermissionDenied {
        tool_use_id: String,
    },
    ControlCancelled {
        request_id: String,
    },
    RunState {
        state: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_subtype: Option<String>,
    },
    UsageUpdate {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cache_read_tokens: u64,
        #[serde(default)]
        cache_write_tokens: u64,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        model_usage: Option<BTreeMap<String, ModelUsage>>,
        #[serde(default)]
        duration_api_ms: Option<u64>,
        #[serde(default)]
        turn_index: Option<u32>,
    },
    CompactBoundary {
        #[serde(default)]
        trigger: String,
        #[serde(default)]
        pre_tokens: Option<u64>,
    },
    TaskNotification {
        task_id: String,
        status: String,
        #[serde(default)]
        data: Value,
    },
    HookEvent {
        hook_name: String,
        #[serde(default)]
        hook_event: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        output: Option<String>,
    },
    McpStatus {
        #[serde(default)]
        servers: Vec<McpServer>,
    },
    CommandOutput {
        command: String,
        #[serde(default)]
        output: String,
    },
    Raw {
        source: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(skip)]
    Unknown { event_type: String },
}

impl AgentEvent {
    pub fn event_type(&self) -> &str {
        match self {
            AgentEvent::SessionInit { .. } => "session_init",
            AgentEvent::MessageDelta { .. } => "message_delta",
            AgentEvent::ThinkingDelta { .. } => "thinking_delta",
            AgentEvent::MessageComplete { .. } => "message_complete",
            AgentEvent::UserMessage { .. } => "user_message",
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolInputDelta { .. } => "tool_input_delta",
            AgentEvent::ToolEnd { .. } => "tool_end",
            AgentEvent::PermissionPrompt { .. } => "permission_prompt",
            AgentEvent::PermissionDenied { .. } => "permission_denied",
            AgentEvent::ControlCancelled { .. } => "control_cancelled",
            AgentEvent::RunState { .. } => "run_state",
            AgentEvent::UsageUpdate { .. } => "usage_update",
            AgentEvent::CompactBoundary { .. } => "compact_boundary",
            AgentEvent::TaskNotification { .. } => "task_notification",
            AgentEvent::HookEvent { .. } => "hook_event",
            AgentEvent::McpStatus { .. } => "mcp_status",
            AgentEvent::CommandOutput { .. } => "command_output",
            AgentEvent::Raw { .. } => "raw",
            AgentEvent::Unknown { event_type } => event_type.as_str(),
        }
    }

    /// Streamed or finalized conversation content (clears a stalled-response error).
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            AgentEvent::MessageDelta { .. }
                | AgentEvent::ThinkingDelta { .. }
                | AgentEvent::MessageComplete { .. }
                | AgentEvent::ToolStart { .. }
                | AgentEvent::ToolInputDelta { .. }
                | AgentEvent::ToolEnd { .. }
        )
    }

    pub fn parent_tool_use_id(&self) -> Option<&str> {
        match self {
            AgentEvent::MessageDelta {
                parent_tool_use_id, ..
            }
            | AgentEvent::ThinkingDelta {
                parent_tool_use_id, ..
            }
            | AgentEvent::MessageComplete {
                parent_tool_use_id, ..
            }
            | AgentEvent::ToolStart {
                parent_tool_use_id, ..
            }
            | AgentEvent::ToolInputDelta {
                parent_tool_use_id, ..
            }
            | AgentEvent::ToolEnd {
                parent_tool_use_id, ..
            }
            | AgentEvent::PermissionPrompt {
                parent_tool_use_id, ..
            } => parent_tool_use_id.as_deref(),
            _ => None,
        }
    }
}

/// Routing wrapper around an [`AgentEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl EventEnvelope {
    pub fn new(session_id: impl Into<String>, event: AgentEvent) -> Self {
        Self {
            session_id: Some(session_id.into()),
            event_id: None,
            timestamp: None,
            event,
        }
    }

    pub fn unscoped(event: AgentEvent) -> Self {
        Self {
            session_id: None,
            event_id: None,
            timestamp: None,
            event,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(event_id) = self.event_id.as_ref() {
            if event_id.trim().is_empty() {
                return Err(ErrorInfo::new("invalid_event_id", "event_id is empty"));
            }
            if event_id.len() > MAX_EVENT_ID_LEN {
                return Err(ErrorInfo::new(
                    "invalid_event_id",
                    format!("event_id must be {} characters or fewer", MAX_EVENT_ID_LEN),
                ));
            }
        }

        if let Some(timestamp) = self.timestamp.as_ref() {
            if DateTime::parse_from_rfc3339(timestamp).is_err() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "timestamp must be RFC3339",
                ));
            }
        }

        match &self.event {
            AgentEvent::MessageComplete { message_id, .. } => {
                require_non_empty(message_id, "message_id")?;
            }
            AgentEvent::ToolStart { tool_use_id, .. }
            | AgentEvent::ToolInputDelta { tool_use_id, .. }
            | AgentEvent::ToolEnd { tool_use_id, .. }
            | AgentEvent::PermissionDenied { tool_use_id } => {
                require_non_empty(tool_use_id, "tool_use_id")?;
            }
            AgentEvent::PermissionPrompt {
                tool_use_id,
                request_id,
                ..
            } => {
                require_non_empty(tool_use_id, "tool_use_id")?;
                require_non_empty(request_id, "request_id")?;
            }
            AgentEvent::ControlCancelled { request_id } => {
                require_non_empty(request_id, "request_id")?;
            }
            AgentEvent::TaskNotification { task_id, .. } => {
                require_non_empty(task_id, "task_id")?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// Parses a transport payload into a validated envelope.
///
/// Unrecognised `type` values become [`AgentEvent::Unknown`]; a recognised type
/// with a malformed body is an error.
pub fn parse_envelope(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let object = match params.as_object() {
        Some(object) => object,
        None => {
            return Err(ErrorInfo::new(
                "invalid_params",
                "event payload must be a JSON object",
            ))
        }
    };

    let event_type = match object.get("type").and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => value.to_string(),
        _ => return Err(ErrorInfo::new("missing_field", "type is required")),
    };

    let session_id = string_field(object, "session_id");
    let event_id = string_field(object, "event_id");
    let timestamp = string_field(object, "timestamp");

    let event = if KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
        serde_json::from_value::<AgentEvent>(params).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("{} payload is invalid: {}", event_type, err),
            )
        })?
    } else {
        AgentEvent::Unknown { event_type }
    };

    let envelope = EventEnvelope {
        session_id,
        event_id,
        timestamp,
        event,
    };
    envelope.validate()?;
    Ok(envelope)
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Idle,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Idle => "idle",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "idle" => Some(RunStatus::Idle),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    #[serde(other)]
    Other,
}

/// One agent conversation as persisted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: String,
    pub status: RunStatus,
    pub agent: AgentKind,
    pub cwd: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RunInfo {
    pub fn new(id: impl Into<String>, status: RunStatus, cwd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            agent: AgentKind::Claude,
            cwd: cwd.into(),
            session_id: None,
            model: None,
            remote_host: None,
            created_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_start_with_parent() {
        let envelope = parse_envelope(json!({
            "type": "tool_start",
            "session_id": "s-1",
            "tool_use_id": "toolu_1",
            "tool_name": "Read",
            "input": {"file_path": "src/main.rs"},
            "parent_tool_use_id": "toolu_task"
        }))
        .expect("parse envelope");

        assert_eq!(envelope.session_id.as_deref(), Some("s-1"));
        assert_eq!(envelope.event.parent_tool_use_id(), Some("toolu_task"));
        assert_eq!(envelope.event.event_type(), "tool_start");
    }

    #[test]
    fn unknown_type_maps_to_unknown_variant() {
        let envelope = parse_envelope(json!({
            "type": "stream_telemetry",
            "session_id": "s-1",
            "payload": 42
        }))
        .expect("parse envelope");

        assert_eq!(
            envelope.event,
            AgentEvent::Unknown {
                event_type: "stream_telemetry".to_string()
            }
        );
    }

    #[test]
    fn rejects_missing_type() {
        let err = parse_envelope(json!({"session_id": "s-1"})).expect_err("missing type");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_malformed_known_event() {
        let err = parse_envelope(json!({"type": "tool_start", "session_id": "s-1"}))
            .expect_err("tool_start without ids");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_bad_timestamp() {
        let err = parse_envelope(json!({
            "type": "user_message",
            "text": "hi",
            "timestamp": "yesterday"
        }))
        .expect_err("bad timestamp");
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn rejects_long_event_id() {
        let err = parse_envelope(json!({
            "type": "user_message",
            "text": "hi",
            "event_id": "a".repeat(256)
        }))
        .expect_err("long event id");
        assert_eq!(err.code, "invalid_event_id");
    }

    #[test]
    fn tool_end_accepts_status_aliases() {
        let envelope = parse_envelope(json!({
            "type": "tool_end",
            "tool_use_id": "toolu_1",
            "status": "ok",
            "output": "done"
        }))
        .expect("parse envelope");

        match envelope.event {
            AgentEvent::ToolEnd { status, .. } => assert_eq!(status, ToolOutcome::Success),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn envelope_serializes_flat() {
        let envelope = EventEnvelope::new(
            "s-1",
            AgentEvent::UserMessage {
                text: "Hello".to_string(),
            },
        );
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "user_message");
        assert_eq!(value["session_id"], "s-1");
        assert_eq!(value["text"], "Hello");
    }

    #[test]
    fn run_status_terminal_classification() {
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Idle.is_terminal());
        assert!(RunStatus::Idle.is_active());
        assert_eq!(RunStatus::from_str("completed"), Some(RunStatus::Completed));
    }
}
