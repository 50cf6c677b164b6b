//! Folding JSONL event logs through the session reducer.
//!
//! A log is one envelope per line, the same shape the run store persists.
//! Lines that fail to parse are reported and skipped; they never abort a
//! replay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs_err as fs;
use loom_core::reducer::AnomalyCounters;
use loom_core::snapshot::{should_write_snapshot, write_snapshot_file};
use loom_core::timeline::TimelineEntry;
use loom_core::usage::UsageState;
use loom_core::{BatchOptions, SessionPhase, SessionReducer, SessionSnapshot, TERMINATED_TOOL_OUTPUT};
use loom_protocol::{parse_envelope, EventEnvelope, RunInfo, RunStatus};
use serde::Serialize;
use serde_json::Value;

const DEFAULT_RUN_ID: &str = "replay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineFailure {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<EventEnvelope>,
    /// 1-based line number of each entry in `events`.
    pub lines: Vec<usize>,
    pub failures: Vec<LineFailure>,
}

pub fn read_log(path: &Path) -> Result<EventLog, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("Failed to read event log: {}", e))?;
    Ok(parse_log(&content))
}

pub fn parse_log(content: &str) -> EventLog {
    let mut log = EventLog::default();
    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                log.failures.push(LineFailure {
                    line: line_number,
                    message: format!("invalid JSON: {}", err),
                });
                continue;
            }
        };

        match parse_envelope(value) {
            Ok(envelope) => {
                log.events.push(envelope);
                log.lines.push(line_number);
            }
            Err(err) => log.failures.push(LineFailure {
                line: line_number,
                message: format!("{}: {}", err.code, err.message),
            }),
        }
    }
    log
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolCounts {
    pub total: usize,
    pub nested: usize,
    pub open: usize,
    pub finalized: usize,
}

#[derive(Debug, Serialize)]
pub struct ReplaySummary {
    pub run_id: Option<String>,
    pub status: Option<RunStatus>,
    pub phase: SessionPhase,
    pub events: usize,
    pub skipped_lines: Vec<LineFailure>,
    pub entries: BTreeMap<&'static str, usize>,
    pub tools: ToolCounts,
    pub usage: UsageState,
    pub turns: usize,
    pub anomalies: AnomalyCounters,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub status: Option<RunStatus>,
    pub strict: bool,
    pub snapshot_out: Option<PathBuf>,
}

/// Replays content only, the way a stored run is loaded for display.
pub fn replay(log: &EventLog, options: &ReplayOptions) -> Result<ReplaySummary, String> {
    let mut reducer = SessionReducer::new();
    reducer.set_strict(options.strict);

    let run_id = log
        .events
        .iter()
        .find_map(|envelope| envelope.session_id.clone());
    if let Some(status) = options.status {
        let id = run_id.clone().unwrap_or_else(|| DEFAULT_RUN_ID.to_string());
        reducer.set_run(RunInfo::new(id, status, ""));
        reducer.set_phase(SessionPhase::Loading, "replay");
    }

    let elapsed = reducer
        .apply_event_batch(&log.events, BatchOptions::replay_only())
        .map_err(|e| format!("Replay aborted: {}", e))?;

    if let Some(status) = options.status {
        let phase = match status {
            RunStatus::Idle => SessionPhase::Ready,
            status => SessionPhase::from(status),
        };
        reducer.set_phase(phase, "replay");
    }

    let snapshot = match options.snapshot_out.as_ref() {
        Some(path) => write_snapshot(&reducer, log.events.len(), path)?,
        None => None,
    };

    let state = reducer.state();
    let mut entries = BTreeMap::new();
    for entry in &state.timeline {
        *entries.entry(entry.kind()).or_insert(0) += 1;
    }
    let mut tools = ToolCounts::default();
    count_tools(&state.timeline, 0, &mut tools);

    Ok(ReplaySummary {
        run_id,
        status: options.status,
        phase: state.phase,
        events: log.events.len(),
        skipped_lines: log.failures.clone(),
        entries,
        tools,
        usage: state.usage.clone(),
        turns: state.turn_usage.len(),
        anomalies: state.anomalies,
        elapsed_ms: elapsed.as_millis() as u64,
        snapshot,
    })
}

fn write_snapshot(
    reducer: &SessionReducer,
    event_count: usize,
    path: &Path,
) -> Result<Option<PathBuf>, String> {
    if !should_write_snapshot(reducer.state(), event_count) {
        tracing::warn!(
            event_count,
            path = %path.display(),
            "Replay produced an empty timeline; not writing snapshot"
        );
        return Ok(None);
    }
    let bytes = reducer.build_snapshot().map_err(|e| e.to_string())?;
    write_snapshot_file(path, &bytes).map_err(|e| e.to_string())?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
    Ok(Some(path.to_path_buf()))
}

fn count_tools(timeline: &[TimelineEntry], depth: usize, counts: &mut ToolCounts) {
    for entry in timeline {
        let TimelineEntry::Tool(tool) = entry else {
            continue;
        };
        counts.total += 1;
        if depth > 0 {
            counts.nested += 1;
        }
        if !tool.tool.status.is_terminal() {
            counts.open += 1;
        }
        if tool.tool.output.as_str() == Some(TERMINATED_TOOL_OUTPUT) {
            counts.finalized += 1;
        }
        count_tools(&tool.sub_timeline, depth + 1, counts);
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub events: usize,
    pub failures: Vec<LineFailure>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies every event live against a strict reducer. Stops at the first
/// reducer anomaly; unparseable lines are all reported.
pub fn check(log: &EventLog) -> CheckReport {
    let mut reducer = SessionReducer::strict();
    let mut failures = log.failures.clone();

    for (envelope, line) in log.events.iter().zip(&log.lines) {
        if let Err(err) = reducer.apply_event(envelope) {
            failures.push(LineFailure {
                line: *line,
                message: err.to_string(),
            });
            break;
        }
    }

    failures.sort_by_key(|failure| failure.line);
    CheckReport {
        events: log.events.len(),
        failures,
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotInfo {
    pub entries: usize,
    pub tools: ToolCounts,
    pub usage: UsageState,
    pub turns: usize,
    pub seen_message_ids: usize,
    pub seen_tool_ids: usize,
    pub model: Option<String>,
}

pub fn snapshot_info(path: &Path) -> Result<SnapshotInfo, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read snapshot: {}", e))?;
    let snapshot = SessionSnapshot::decode(&bytes).map_err(|e| e.to_string())?;

    let mut tools = ToolCounts::default();
    count_tools(&snapshot.timeline, 0, &mut tools);
    Ok(SnapshotInfo {
        entries: snapshot.timeline.len(),
        tools,
        usage: snapshot.usage,
        turns: snapshot.turn_usage.len(),
        seen_message_ids: snapshot.seen_message_ids.len(),
        seen_tool_ids: snapshot.seen_tool_ids.len(),
        model: snapshot.aux.metadata.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"
{"type":"session_init","session_id":"run-7","model":"sonnet","agent_session_id":"sess-7"}
{"type":"user_message","session_id":"run-7","text":"Check the build"}
{"type":"tool_start","session_id":"run-7","tool_use_id":"toolu_1","tool_name":"Task","input":{}}
{"type":"tool_start","session_id":"run-7","tool_use_id":"toolu_2","tool_name":"Bash","input":{},"parent_tool_use_id":"toolu_1"}
not json at all
{"type":"usage_update","session_id":"run-7","input_tokens":10,"output_tokens":4,"total_cost_usd":0.01}
{"type":"run_state","session_id":"run-7","state":"idle"}
"#;

    #[test]
    fn parse_log_reports_bad_lines_and_keeps_the_rest() {
        let log = parse_log(LOG);
        assert_eq!(log.events.len(), 6);
        assert_eq!(log.lines, vec![2, 3, 4, 5, 7, 8]);
        assert_eq!(log.failures.len(), 1);
        assert_eq!(log.failures[0].line, 6);
    }

    #[test]
    fn replay_of_terminal_run_finalizes_open_tools() {
        let log = parse_log(LOG);
        let summary = replay(
            &log,
            &ReplayOptions {
                status: Some(RunStatus::Stopped),
                ..ReplayOptions::default()
            },
        )
        .expect("replay");

        assert_eq!(summary.run_id.as_deref(), Some("run-7"));
        assert_eq!(summary.phase, SessionPhase::Stopped);
        assert_eq!(summary.entries.get("user"), Some(&1));
        assert_eq!(
            summary.tools,
            ToolCounts {
                total: 2,
                nested: 1,
                open: 0,
                finalized: 2,
            }
        );
        assert_eq!(summary.usage.tokens.input_tokens, 10);
        assert_eq!(summary.skipped_lines.len(), 1);
    }

    #[test]
    fn replay_without_status_leaves_tools_open() {
        let summary = replay(&parse_log(LOG), &ReplayOptions::default()).expect("replay");
        assert_eq!(summary.phase, SessionPhase::Empty);
        assert_eq!(summary.tools.open, 2);
        assert_eq!(summary.tools.finalized, 0);
    }

    #[test]
    fn snapshot_out_writes_a_readable_snapshot() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("run-7.stopped.json");
        let summary = replay(
            &parse_log(LOG),
            &ReplayOptions {
                status: Some(RunStatus::Stopped),
                strict: false,
                snapshot_out: Some(path.clone()),
            },
        )
        .expect("replay");
        assert_eq!(summary.snapshot.as_deref(), Some(path.as_path()));

        let info = snapshot_info(&path).expect("snapshot info");
        assert_eq!(info.entries, 2);
        assert_eq!(info.tools.total, 2);
        assert_eq!(info.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn empty_replay_is_not_written_as_snapshot() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("empty.json");
        let log = parse_log(r#"{"type":"run_state","session_id":"run-8","state":"idle"}"#);
        let summary = replay(
            &log,
            &ReplayOptions {
                snapshot_out: Some(path.clone()),
                ..ReplayOptions::default()
            },
        )
        .expect("replay");
        assert!(summary.snapshot.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn check_stops_at_first_unknown_event() {
        let log = parse_log(concat!(
            r#"{"type":"user_message","session_id":"run-9","text":"hi"}"#,
            "\n",
            r#"{"type":"heartbeat","session_id":"run-9"}"#,
            "\n",
            r#"{"type":"frobnicate","session_id":"run-9"}"#,
        ));
        let report = check(&log);
        assert!(!report.passed());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].line, 2);
        assert!(report.failures[0].message.contains("heartbeat"));
    }

    #[test]
    fn check_flags_orphaned_subagent_events() {
        let log = parse_log(
            r#"{"type":"message_complete","session_id":"run-9","message_id":"m1","text":"x","parent_tool_use_id":"toolu_missing"}"#,
        );
        let report = check(&log);
        assert!(!report.passed());
        assert!(report.failures[0].message.contains("toolu_missing"));
    }

    #[test]
    fn snapshot_info_rejects_bad_shape() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, br#"{"timeline": {}}"#).expect("write");
        let err = snapshot_info(&path).expect_err("bad shape");
        assert!(err.contains("Malformed snapshot"));
    }
}
