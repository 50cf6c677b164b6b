//! Session lifecycle phases and the legal transition table.
//! Illegal moves are logged and still applied; a stuck session is worse than a
//! surprising one.

use serde::{Deserialize, Serialize};

use loom_protocol::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Empty,
    Loading,
    Ready,
    Spawning,
    Running,
    Idle,
    Completed,
    Failed,
    Stopped,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Empty => "empty",
            SessionPhase::Loading => "loading",
            SessionPhase::Ready => "ready",
            SessionPhase::Spawning => "spawning",
            SessionPhase::Running => "running",
            SessionPhase::Idle => "idle",
            SessionPhase::Completed => "completed",
            SessionPhase::Failed => "failed",
            SessionPhase::Stopped => "stopped",
        }
    }

    /// Maps an upstream `run_state` name to a phase.
    pub fn from_run_state(value: &str) -> Option<Self> {
        match value {
            "spawning" | "starting" => Some(SessionPhase::Spawning),
            "running" | "busy" => Some(SessionPhase::Running),
            "idle" => Some(SessionPhase::Idle),
            "ready" => Some(SessionPhase::Ready),
            "completed" => Some(SessionPhase::Completed),
            "failed" | "error" => Some(SessionPhase::Failed),
            "stopped" | "cancelled" => Some(SessionPhase::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Stopped
        )
    }

    pub fn allowed_targets(&self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Empty => &[Loading, Ready, Spawning],
            Loading => &[Ready, Running, Completed, Failed, Stopped, Empty],
            Ready => &[Spawning, Running, Empty, Loading],
            Spawning => &[Running, Failed, Stopped, Idle, Empty, Loading],
            Running => &[Idle, Completed, Failed, Stopped, Empty, Loading],
            Idle => &[Running, Spawning, Completed, Failed, Stopped, Empty, Loading],
            Completed | Failed | Stopped => &[Empty, Loading, Spawning, Ready],
        }
    }

    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        *self == target || self.allowed_targets().contains(&target)
    }
}

impl From<RunStatus> for SessionPhase {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => SessionPhase::Running,
            RunStatus::Idle => SessionPhase::Idle,
            RunStatus::Completed => SessionPhase::Completed,
            RunStatus::Failed => SessionPhase::Failed,
            RunStatus::Stopped => SessionPhase::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Applied,
    /// Not in the table; applied anyway.
    Forced,
}

/// Moves `current` to `target`, warning on moves outside the table.
pub fn transition(current: &mut SessionPhase, target: SessionPhase, reason: &str) -> Transition {
    if *current == target {
        return Transition::Unchanged;
    }

    let outcome = if current.can_transition_to(target) {
        tracing::debug!(from = current.as_str(), to = target.as_str(), reason, "Phase transition");
        Transition::Applied
    } else {
        tracing::warn!(
            from = current.as_str(),
            to = target.as_str(),
            reason,
            "Illegal phase transition applied"
        );
        Transition::Forced
    };

    *current = target;
    outcome
}
