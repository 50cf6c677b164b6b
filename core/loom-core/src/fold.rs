//! Per-event state transitions.
//!
//! `fold_event` is the single entry point; each event type has a `handle_*`
//! function that mutates the working state in place.

use chrono::Utc;
use loom_protocol::{AgentEvent, EventEnvelope, RunStatus, ToolOutcome};
use serde_json::Value;

use crate::error::ReducerError;
use crate::phase::SessionPhase;
use crate::reducer::{CurrentError, HookRecord, ReducerState, TaskRecord};
use crate::timeline::{
    contains_tool, count_user_entries, find_tool_path, find_tool_path_by, locate_tool,
    new_entry_id, placeholder_id, tool_at_mut, walk_tools_mut, AssistantEntry,
    CommandOutputEntry, SeparatorEntry, TimelineEntry, ToolEntry, ToolState, ToolStatus,
    UserEntry, ASK_USER_TOOL,
};
use crate::usage::{TokenCounts, TurnUsage, UsageUpdate};

const CANCELLED_PERMISSION_OUTPUT: &str = "Permission request was cancelled";
const EXPIRED_PERMISSION_OUTPUT: &str = "Permission request expired when the agent restarted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FoldMode {
    /// Fresh transport events (as opposed to history being replayed).
    pub live: bool,
    /// Rebuild content only.
    pub replay_only: bool,
}

impl FoldMode {
    pub const LIVE: FoldMode = FoldMode {
        live: true,
        replay_only: false,
    };

    fn touches_phase(&self) -> bool {
        !self.replay_only
    }

    fn surfaces_errors(&self) -> bool {
        self.live && !self.replay_only
    }
}

pub(crate) fn fold_event(
    state: &mut ReducerState,
    envelope: &EventEnvelope,
    mode: FoldMode,
    strict: bool,
) -> Result<(), ReducerError> {
    let timestamp = envelope
        .timestamp
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let stream_key = envelope.session_id.as_deref().unwrap_or_default();

    if envelope.event.is_content() {
        state.content_seq += 1;
        if state.error.as_ref().map(|err| err.stalled).unwrap_or(false) {
            state.error = None;
        }
    }

    match &envelope.event {
        AgentEvent::SessionInit {
            model,
            agent_session_id,
            tools,
            cwd,
            slash_commands,
            mcp_servers,
            output_style,
            permission_mode,
            version,
            protocol_version,
        } => {
            let metadata = &mut state.aux.metadata;
            metadata.model = model.clone();
            metadata.agent_session_id = agent_session_id.clone();
            metadata.tools = tools.clone();
            metadata.cwd = cwd.clone();
            metadata.slash_commands = slash_commands.clone().unwrap_or_default();
            metadata.output_style = output_style.clone();
            metadata.permission_mode = permission_mode.clone();
            metadata.agent_version = version.clone();
            metadata.protocol_version = *protocol_version;
            state.aux.mcp_servers = mcp_servers.clone().unwrap_or_default();
            state.initialized = true;

            if mode.touches_phase() && state.phase == SessionPhase::Spawning {
                state.set_phase(SessionPhase::Running, "session_init");
            }
            Ok(())
        }
        AgentEvent::MessageDelta {
            text,
            parent_tool_use_id,
        } => handle_delta(
            state,
            mode,
            strict,
            DeltaKind::Text,
            text,
            parent_tool_use_id.as_deref(),
            stream_key,
            &timestamp,
        ),
        AgentEvent::ThinkingDelta {
            text,
            parent_tool_use_id,
        } => handle_delta(
            state,
            mode,
            strict,
            DeltaKind::Thinking,
            text,
            parent_tool_use_id.as_deref(),
            stream_key,
            &timestamp,
        ),
        AgentEvent::MessageComplete {
            message_id,
            text,
            parent_tool_use_id,
        } => handle_message_complete(
            state,
            mode,
            strict,
            message_id,
            text,
            parent_tool_use_id.as_deref(),
            stream_key,
            &timestamp,
        ),
        AgentEvent::UserMessage { text } => {
            handle_user_message(state, mode, text, &timestamp);
            Ok(())
        }
        AgentEvent::ToolStart {
            tool_use_id,
            tool_name,
            input,
            parent_tool_use_id,
        } => handle_tool_start(
            state,
            mode,
            strict,
            tool_use_id,
            tool_name,
            input,
            parent_tool_use_id.as_deref(),
            &timestamp,
        ),
        AgentEvent::ToolInputDelta {
            tool_use_id,
            partial_json,
            parent_tool_use_id,
        } => {
            handle_tool_input_delta(state, tool_use_id, partial_json, parent_tool_use_id.as_deref());
            Ok(())
        }
        AgentEvent::ToolEnd {
            tool_use_id,
            status,
            output,
            duration_ms,
            parent_tool_use_id,
        } => {
            handle_tool_end(
                state,
                tool_use_id,
                *status,
                output,
                *duration_ms,
                parent_tool_use_id.as_deref(),
            );
            Ok(())
        }
        AgentEvent::PermissionPrompt {
            tool_use_id,
            request_id,
            suggestions,
            parent_tool_use_id,
        } => {
            let parent_hint = parent_tool_use_id.as_deref();
            let Some(tool) = resolve_tool(state, tool_use_id, parent_hint, "permission_prompt") else {
                return Ok(());
            };
            tool.tool.status = ToolStatus::PermissionPending;
            tool.tool.permission_request_id = Some(request_id.clone());
            tool.tool.permission_suggestions = suggestions.clone();
            Ok(())
        }
        AgentEvent::PermissionDenied { tool_use_id } => {
            if let Some(tool) = resolve_tool(state, tool_use_id, None, "permission_denied") {
                tool.tool.status = ToolStatus::PermissionDenied;
            }
            Ok(())
        }
        AgentEvent::ControlCancelled { request_id } => {
            handle_control_cancelled(state, request_id);
            Ok(())
        }
        AgentEvent::RunState {
            state: run_state,
            error,
            error_subtype,
        } => {
            handle_run_state(
                state,
                mode,
                run_state,
                error.as_deref(),
                error_subtype.as_deref(),
            );
            Ok(())
        }
        AgentEvent::UsageUpdate {
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
            total_cost_usd,
            model_usage,
            duration_api_ms,
            turn_index,
        } => {
            let update = UsageUpdate {
                tokens: TokenCounts {
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                    cache_read_tokens: *cache_read_tokens,
                    cache_write_tokens: *cache_write_tokens,
                },
                total_cost_usd: *total_cost_usd,
                model_usage: model_usage.clone(),
                duration_api_ms: *duration_api_ms,
            };
            state.usage.merge(&update);
            let turn_index =
                turn_index.unwrap_or_else(|| count_user_entries(&state.timeline) as u32);
            state.turn_usage.push(TurnUsage {
                turn_index,
                tokens: state.usage.tokens,
                total_cost_usd: state.usage.total_cost_usd,
                recorded_at: Some(timestamp),
            });
            Ok(())
        }
        AgentEvent::CompactBoundary {
            trigger,
            pre_tokens,
        } => {
            state.timeline.push(TimelineEntry::Separator(SeparatorEntry {
                id: new_entry_id("compact"),
                timestamp,
                trigger: trigger.clone(),
                pre_tokens: *pre_tokens,
            }));
            Ok(())
        }
        AgentEvent::TaskNotification {
            task_id,
            status,
            data,
        } => {
            state.aux.tasks.insert(
                task_id.clone(),
                TaskRecord {
                    status: status.clone(),
                    data: data.clone(),
                    updated_at: timestamp,
                },
            );
            Ok(())
        }
        AgentEvent::HookEvent {
            hook_name,
            hook_event,
            status,
            output,
        } => {
            state.aux.push_hook(HookRecord {
                hook_name: hook_name.clone(),
                hook_event: hook_event.clone(),
                status: status.clone(),
                output: output.clone(),
                recorded_at: timestamp,
            });
            Ok(())
        }
        AgentEvent::McpStatus { servers } => {
            state.aux.mcp_servers = servers.clone();
            Ok(())
        }
        AgentEvent::CommandOutput { command, output } => {
            state
                .timeline
                .push(TimelineEntry::CommandOutput(CommandOutputEntry {
                    id: new_entry_id("cmd"),
                    timestamp,
                    command: command.clone(),
                    output: output.clone(),
                }));
            Ok(())
        }
        AgentEvent::Raw { source, .. } => {
            tracing::trace!(source = %source, "Ignoring raw event in reducer");
            Ok(())
        }
        AgentEvent::Unknown { event_type } => {
            state.anomalies.unknown_events += 1;
            if strict {
                return Err(ReducerError::UnknownEventType(event_type.clone()));
            }
            tracing::warn!(event_type = %event_type, "Ignoring unknown event type");
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaKind {
    Text,
    Thinking,
}

/// Resolves a stated parent, applying the missing-parent policy.
///
/// `Ok(None)` means the content falls back to the top level.
fn resolve_parent(
    state: &mut ReducerState,
    strict: bool,
    event_type: &str,
    parent_tool_use_id: Option<&str>,
) -> Result<Option<Vec<usize>>, ReducerError> {
    let Some(parent_id) = parent_tool_use_id else {
        return Ok(None);
    };

    if let Some(path) = find_tool_path(&state.timeline, parent_id) {
        return Ok(Some(path));
    }

    state.anomalies.missing_parents += 1;
    if strict {
        return Err(ReducerError::MissingParent {
            event_type: event_type.to_string(),
            parent_tool_use_id: parent_id.to_string(),
        });
    }
    tracing::warn!(
        event_type,
        parent_tool_use_id = parent_id,
        "Parent tool not found; placing content at top level"
    );
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn handle_delta(
    state: &mut ReducerState,
    mode: FoldMode,
    strict: bool,
    kind: DeltaKind,
    text: &str,
    parent_tool_use_id: Option<&str>,
    stream_key: &str,
    timestamp: &str,
) -> Result<(), ReducerError> {
    let event_type = match kind {
        DeltaKind::Text => "message_delta",
        DeltaKind::Thinking => "thinking_delta",
    };
    let parent_path = resolve_parent(state, strict, event_type, parent_tool_use_id)?;

    match (parent_path, parent_tool_use_id) {
        (Some(path), Some(parent_id)) => {
            let placeholder = placeholder_id(parent_id);
            if let Some(parent) = tool_at_mut(&mut state.timeline, &path) {
                let slot = parent.sub_timeline.iter().position(|entry| {
                    matches!(entry, TimelineEntry::Assistant(a) if a.synthetic && a.id == placeholder)
                });
                match slot {
                    Some(index) => {
                        if let TimelineEntry::Assistant(assistant) = &mut parent.sub_timeline[index] {
                            append_delta(assistant, kind, text);
                        }
                    }
                    None => {
                        let mut assistant = AssistantEntry {
                            id: placeholder,
                            timestamp: timestamp.to_string(),
                            text: String::new(),
                            thinking: None,
                            synthetic: true,
                        };
                        append_delta(&mut assistant, kind, text);
                        parent.sub_timeline.push(TimelineEntry::Assistant(assistant));
                    }
                }
            }
        }
        _ => {
            let buffer = state.streaming.entry(stream_key.to_string()).or_default();
            match kind {
                DeltaKind::Text => buffer.text.push_str(text),
                DeltaKind::Thinking => buffer.thinking.push_str(text),
            }
        }
    }

    if mode.touches_phase() && state.phase == SessionPhase::Idle {
        state.set_phase(SessionPhase::Running, event_type);
    }
    Ok(())
}

fn append_delta(assistant: &mut AssistantEntry, kind: DeltaKind, text: &str) {
    match kind {
        DeltaKind::Text => assistant.text.push_str(text),
        DeltaKind::Thinking => assistant
            .thinking
            .get_or_insert_with(String::new)
            .push_str(text),
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_message_complete(
    state: &mut ReducerState,
    mode: FoldMode,
    strict: bool,
    message_id: &str,
    text: &str,
    parent_tool_use_id: Option<&str>,
    stream_key: &str,
    timestamp: &str,
) -> Result<(), ReducerError> {
    if state.seen_message_ids.contains(message_id) {
        tracing::debug!(message_id, "Skipping duplicate message_complete");
        return Ok(());
    }

    let parent_path = resolve_parent(state, strict, "message_complete", parent_tool_use_id)?;
    state.seen_message_ids.insert(message_id.to_string());

    let mut entry = AssistantEntry {
        id: message_id.to_string(),
        timestamp: timestamp.to_string(),
        text: text.to_string(),
        thinking: None,
        synthetic: false,
    };

    match (parent_path, parent_tool_use_id) {
        (Some(path), Some(parent_id)) => {
            let placeholder = placeholder_id(parent_id);
            if let Some(parent) = tool_at_mut(&mut state.timeline, &path) {
                let slot = parent.sub_timeline.iter().position(|candidate| {
                    matches!(candidate, TimelineEntry::Assistant(a) if a.synthetic && a.id == placeholder)
                });
                match slot {
                    Some(index) => {
                        if let TimelineEntry::Assistant(streamed) = &parent.sub_timeline[index] {
                            entry.thinking = streamed.thinking.clone();
                        }
                        parent.sub_timeline[index] = TimelineEntry::Assistant(entry);
                    }
                    None => parent.sub_timeline.push(TimelineEntry::Assistant(entry)),
                }
            }
        }
        _ => {
            // A subagent message without its parent must not take the main
            // agent's in-progress stream.
            if parent_tool_use_id.is_none() {
                if let Some(buffer) = state.streaming.remove(stream_key) {
                    if !buffer.thinking.is_empty() {
                        entry.thinking = Some(buffer.thinking);
                    }
                }
            }
            state.timeline.push(TimelineEntry::Assistant(entry));

            if parent_tool_use_id.is_none()
                && mode.touches_phase()
                && state.phase == SessionPhase::Running
            {
                state.set_phase(SessionPhase::Idle, "message_complete");
            }
        }
    }
    Ok(())
}

fn handle_user_message(state: &mut ReducerState, mode: FoldMode, text: &str, timestamp: &str) {
    let echoed = mode.live
        && matches!(
            state.timeline.last(),
            Some(TimelineEntry::User(last)) if last.text == text
        );

    if echoed {
        if let Some(TimelineEntry::User(last)) = state.timeline.last_mut() {
            last.optimistic = false;
        }
        tracing::debug!("Confirmed optimistic user message");
    } else {
        state.timeline.push(TimelineEntry::User(UserEntry {
            id: new_entry_id("user"),
            timestamp: timestamp.to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
            optimistic: false,
        }));
    }

    walk_tools_mut(&mut state.timeline, &mut |tool: &mut ToolEntry| {
        if tool.tool.status == ToolStatus::AwaitingAnswer {
            tool.tool.status = ToolStatus::Success;
            tool.tool.output = Value::String(text.to_string());
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_tool_start(
    state: &mut ReducerState,
    mode: FoldMode,
    strict: bool,
    tool_use_id: &str,
    tool_name: &str,
    input: &Value,
    parent_tool_use_id: Option<&str>,
    timestamp: &str,
) -> Result<(), ReducerError> {
    if state.seen_tool_ids.contains(tool_use_id) || contains_tool(&state.timeline, tool_use_id) {
        tracing::debug!(tool_use_id, "Skipping duplicate tool_start");
        return Ok(());
    }

    let parent_path = resolve_parent(state, strict, "tool_start", parent_tool_use_id)?;
    let entry = TimelineEntry::Tool(ToolEntry {
        id: tool_use_id.to_string(),
        timestamp: timestamp.to_string(),
        tool: ToolState::new(tool_name, input.clone()),
        sub_timeline: Vec::new(),
    });

    let parent = match parent_path {
        Some(path) => tool_at_mut(&mut state.timeline, &path),
        None => None,
    };
    match parent {
        Some(parent) => parent.sub_timeline.push(entry),
        None => state.timeline.push(entry),
    }
    state.seen_tool_ids.insert(tool_use_id.to_string());

    if mode.touches_phase() && state.phase == SessionPhase::Idle {
        state.set_phase(SessionPhase::Running, "tool_start");
    }
    Ok(())
}

/// Resolves an update target, counting and logging a miss.
fn resolve_tool<'a>(
    state: &'a mut ReducerState,
    tool_use_id: &str,
    parent_hint: Option<&str>,
    event_type: &str,
) -> Option<&'a mut ToolEntry> {
    match locate_tool(&state.timeline, tool_use_id, parent_hint) {
        Some(path) => tool_at_mut(&mut state.timeline, &path),
        None => {
            state.anomalies.orphan_updates += 1;
            tracing::warn!(event_type, tool_use_id, "Update for unknown tool ignored");
            None
        }
    }
}

fn handle_tool_input_delta(
    state: &mut ReducerState,
    tool_use_id: &str,
    partial_json: &str,
    parent_tool_use_id: Option<&str>,
) {
    let Some(tool) = resolve_tool(state, tool_use_id, parent_tool_use_id, "tool_input_delta")
    else {
        return;
    };

    let buffer = tool.tool.input_buffer.get_or_insert_with(String::new);
    buffer.push_str(partial_json);
    if let Ok(parsed) = serde_json::from_str::<Value>(buffer) {
        tool.tool.input = parsed;
    }
}

fn handle_tool_end(
    state: &mut ReducerState,
    tool_use_id: &str,
    status: ToolOutcome,
    output: &Value,
    duration_ms: Option<u64>,
    parent_tool_use_id: Option<&str>,
) {
    let Some(tool) = resolve_tool(state, tool_use_id, parent_tool_use_id, "tool_end") else {
        return;
    };

    tool.tool.status = match status {
        ToolOutcome::Success => ToolStatus::Success,
        ToolOutcome::Error if tool.tool.name == ASK_USER_TOOL => ToolStatus::AwaitingAnswer,
        ToolOutcome::Error => ToolStatus::Error,
    };
    tool.tool.output = output.clone();
    tool.tool.duration_ms = duration_ms;
}

fn handle_control_cancelled(state: &mut ReducerState, request_id: &str) {
    let path = find_tool_path_by(&state.timeline, &|tool: &ToolEntry| {
        tool.tool.permission_request_id.as_deref() == Some(request_id)
    });

    let tool = match path {
        Some(path) => tool_at_mut(&mut state.timeline, &path),
        None => None,
    };
    let Some(tool) = tool else {
        state.anomalies.orphan_updates += 1;
        tracing::debug!(request_id, "No tool holds cancelled permission request");
        return;
    };

    if !tool.tool.status.is_terminal() {
        tool.tool.status = ToolStatus::Error;
        tool.tool.output = Value::String(CANCELLED_PERMISSION_OUTPUT.to_string());
    }
}

fn expire_permissions(state: &mut ReducerState, include_denied: bool) -> usize {
    let mut expired = 0usize;
    walk_tools_mut(&mut state.timeline, &mut |tool: &mut ToolEntry| {
        let stale = match tool.tool.status {
            ToolStatus::PermissionPending => true,
            ToolStatus::PermissionDenied => include_denied,
            _ => false,
        };
        if stale {
            tool.tool.status = ToolStatus::Error;
            tool.tool.output = Value::String(EXPIRED_PERMISSION_OUTPUT.to_string());
            expired += 1;
        }
    });
    expired
}

fn handle_run_state(
    state: &mut ReducerState,
    mode: FoldMode,
    run_state: &str,
    error: Option<&str>,
    error_subtype: Option<&str>,
) {
    let Some(target) = SessionPhase::from_run_state(run_state) else {
        tracing::warn!(run_state, "Ignoring unrecognised run state");
        return;
    };

    // A restart invalidates every outstanding permission, even during replay.
    if target == SessionPhase::Spawning {
        let expired = expire_permissions(state, true);
        if expired > 0 {
            tracing::debug!(expired, "Expired permission prompts on restart");
        }
    }

    if !mode.touches_phase() {
        return;
    }

    if target == SessionPhase::Idle {
        expire_permissions(state, false);
    }
    if target == SessionPhase::Spawning {
        state.initialized = false;
    }

    state.set_phase(target, "run_state");

    if let Some(run) = state.run.as_mut() {
        let status = match target {
            SessionPhase::Running => Some(RunStatus::Running),
            SessionPhase::Idle => Some(RunStatus::Idle),
            SessionPhase::Completed => Some(RunStatus::Completed),
            SessionPhase::Failed => Some(RunStatus::Failed),
            SessionPhase::Stopped => Some(RunStatus::Stopped),
            _ => None,
        };
        if let Some(status) = status {
            run.status = status;
        }
    }

    if !mode.surfaces_errors() {
        return;
    }

    match error.filter(|message| !message.trim().is_empty()) {
        Some(message) => {
            state.error = Some(CurrentError::from_upstream(error_subtype, message));
        }
        None if target == SessionPhase::Failed => {
            state.error = Some(CurrentError::from_upstream(
                error_subtype,
                "Agent run failed",
            ));
        }
        None if matches!(target, SessionPhase::Running | SessionPhase::Spawning) => {
            state.error = None;
        }
        None => {}
    }
}
