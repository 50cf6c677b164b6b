//! Error types for loom-core operations.
//!
//! `SessionError` covers lifecycle operations that cross an async boundary.
//! `ReducerError` is only surfaced in strict mode; outside of it the reducer
//! logs and counts the same anomalies and keeps going.

// ═══════════════════════════════════════════════════════════════════════════════
// Reducer anomalies
// ═══════════════════════════════════════════════════════════════════════════════

/// Protocol anomalies the reducer recovers from locally unless strict mode is on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReducerError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Parent tool {parent_tool_use_id} not found for {event_type}")]
    MissingParent {
        event_type: String,
        parent_tool_use_id: String,
    },

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session lifecycle errors
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur in loom-core session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ─────────────────────────────────────────────────────────────────────
    // Collaborator failures
    // ─────────────────────────────────────────────────────────────────────
    #[error("Agent bridge request failed: {operation}: {message}")]
    Bridge { operation: String, message: String },

    #[error("Run store request failed: {0}")]
    RunStore(String),

    #[error("Snapshot cache request failed: {0}")]
    SnapshotCache(String),

    #[error("Transport listener registration failed: {name}: {message}")]
    Transport { name: String, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle preconditions
    // ─────────────────────────────────────────────────────────────────────
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} has no recoverable agent session id")]
    MissingSessionId(String),

    #[error("No active run")]
    NoActiveRun,

    #[error("Another resume or fork is already in flight")]
    OperationInFlight,

    #[error("Operation superseded by a newer request")]
    Superseded,

    #[error("Session view is no longer mounted")]
    Unmounted,

    // ─────────────────────────────────────────────────────────────────────
    // Reducer / configuration / I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Reducer(#[from] ReducerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionError {
    pub fn bridge(operation: &str, message: impl Into<String>) -> Self {
        SessionError::Bridge {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// True for outcomes that mean "a newer operation won"; callers drop these silently.
    pub fn is_superseded(&self) -> bool {
        matches!(self, SessionError::Superseded | SessionError::Unmounted)
    }
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}
