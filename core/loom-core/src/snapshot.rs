//! Snapshot codec for terminated runs, plus the on-disk cache.
//!
//! A snapshot carries content only (timeline, usage, turn history, dedup sets,
//! auxiliary state). Phase, error, and the run record are never restored from
//! it; they come from the run store.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loom_protocol::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::SnapshotCache;
use crate::error::{ReducerError, Result, SessionError};
use crate::reducer::{AuxiliaryState, ReducerState, SessionReducer};
use crate::timeline::TimelineEntry;
use crate::usage::{TurnUsage, UsageState};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub run_id: String,
    pub status: RunStatus,
}

impl SnapshotKey {
    pub fn new(run_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            status,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}.json", self.run_id, self.status.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub timeline: Vec<TimelineEntry>,
    pub usage: UsageState,
    #[serde(default)]
    pub turn_usage: Vec<TurnUsage>,
    #[serde(default)]
    pub seen_message_ids: BTreeSet<String>,
    #[serde(default)]
    pub seen_tool_ids: BTreeSet<String>,
    #[serde(default)]
    pub aux: AuxiliaryState,
}

impl SessionSnapshot {
    pub fn capture(state: &ReducerState) -> Self {
        Self {
            timeline: state.timeline.clone(),
            usage: state.usage.clone(),
            turn_usage: state.turn_usage.clone(),
            seen_message_ids: state.seen_message_ids.clone(),
            seen_tool_ids: state.seen_tool_ids.clone(),
            aux: state.aux.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| SessionError::Json {
            context: "Failed to encode snapshot".to_string(),
            source,
        })
    }

    /// Decodes after checking the document shape.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ReducerError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| ReducerError::MalformedSnapshot(format!("invalid JSON: {}", err)))?;
        validate_shape(&value)?;
        serde_json::from_value(value)
            .map_err(|err| ReducerError::MalformedSnapshot(err.to_string()))
    }
}

pub fn validate_shape(value: &Value) -> std::result::Result<(), ReducerError> {
    let object = value
        .as_object()
        .ok_or_else(|| ReducerError::MalformedSnapshot("document is not an object".to_string()))?;

    if !object.get("timeline").map(Value::is_array).unwrap_or(false) {
        return Err(ReducerError::MalformedSnapshot(
            "timeline is not an array".to_string(),
        ));
    }
    if !object.get("usage").map(Value::is_object).unwrap_or(false) {
        return Err(ReducerError::MalformedSnapshot(
            "usage is not an object".to_string(),
        ));
    }
    Ok(())
}

/// An empty timeline is only cacheable when the event log was empty too.
pub fn should_write_snapshot(state: &ReducerState, source_event_count: usize) -> bool {
    !state.timeline.is_empty() || source_event_count == 0
}

impl SessionReducer {
    pub fn build_snapshot(&self) -> Result<Vec<u8>> {
        SessionSnapshot::capture(self.state()).encode()
    }

    /// Replaces content with a decoded snapshot; phase and error are untouched.
    ///
    /// On failure nothing changes and the caller falls back to full replay.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> std::result::Result<(), ReducerError> {
        let snapshot = match SessionSnapshot::decode(bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.state_mut().anomalies.rejected_snapshots += 1;
                tracing::warn!(error = %err, "Rejected snapshot");
                return Err(err);
            }
        };
        self.apply_snapshot(snapshot);
        Ok(())
    }

    pub fn apply_snapshot(&mut self, snapshot: SessionSnapshot) {
        let state = self.state_mut();
        state.timeline = snapshot.timeline;
        state.usage = snapshot.usage;
        state.turn_usage = snapshot.turn_usage;
        state.seen_message_ids = snapshot.seen_message_ids;
        state.seen_tool_ids = snapshot.seen_tool_ids;
        state.aux = snapshot.aux;
        state.streaming.clear();
        self.publish();
    }
}

/// Snapshot cache backed by one JSON file per (run, status).
#[derive(Debug, Clone)]
pub struct FileSnapshotCache {
    dir: PathBuf,
}

impl FileSnapshotCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &SnapshotKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn ensure_dir(&self) -> Result<()> {
        fs_err::create_dir_all(&self.dir).map_err(|source| SessionError::Io {
            context: format!("Failed to create snapshot dir {}", self.dir.display()),
            source,
        })
    }
}

pub fn write_snapshot_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    let mut file = fs_err::File::create(&tmp_path).map_err(|source| SessionError::Io {
        context: format!("Failed to create temp snapshot {}", tmp_path.display()),
        source,
    })?;
    file.write_all(bytes).map_err(|source| SessionError::Io {
        context: "Failed to write snapshot".to_string(),
        source,
    })?;
    file.flush().map_err(|source| SessionError::Io {
        context: "Failed to flush snapshot".to_string(),
        source,
    })?;

    fs_err::rename(&tmp_path, path).map_err(|source| SessionError::Io {
        context: format!("Failed to move snapshot into place at {}", path.display()),
        source,
    })
}

#[async_trait]
impl SnapshotCache for FileSnapshotCache {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs_err::read(&path)
            .map(Some)
            .map_err(|source| SessionError::Io {
                context: format!("Failed to read snapshot {}", path.display()),
                source,
            })
    }

    async fn store(&self, key: &SnapshotKey, bytes: Vec<u8>) -> Result<()> {
        self.ensure_dir()?;
        let path = self.path_for(key);
        write_snapshot_file(&path, &bytes)?;
        tracing::info!(run_id = %key.run_id, status = key.status.as_str(), "Snapshot written");
        Ok(())
    }

    async fn invalidate(&self, run_id: &str) -> Result<()> {
        for status in [
            RunStatus::Running,
            RunStatus::Idle,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ] {
            let path = self.path_for(&SnapshotKey::new(run_id, status));
            if path.exists() {
                fs_err::remove_file(&path).map_err(|source| SessionError::Io {
                    context: format!("Failed to remove snapshot {}", path.display()),
                    source,
                })?;
            }
        }
        Ok(())
    }
}
