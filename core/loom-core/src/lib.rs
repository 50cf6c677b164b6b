//! Loom core: session event reduction for a subprocess-hosted coding agent.
//!
//! Events arrive from a transport through the [`router::EventRouter`], which
//! batches them per session and hands them to a [`reducer::SessionReducer`].
//! The [`session::SessionController`] drives the lifecycle around it: loading
//! runs, starting, resuming, forking, and the spawn/response watchdogs.

use std::sync::{Mutex, MutexGuard};

pub mod classify;
pub mod collaborators;
pub mod config;
pub mod error;
mod fold;
pub mod generation;
pub mod memory;
pub mod phase;
pub mod reducer;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod timeline;
pub mod usage;

pub use classify::{classify_error, ErrorCategory};
pub use collaborators::{
    AgentBridge, ListenerCallback, ListenerId, ResumeMode, ResumeRequest, RunStore,
    SnapshotCache, StartRequest, Transport,
};
pub use config::{load_config, LoomConfig};
pub use error::{ReducerError, Result, SessionError};
pub use phase::SessionPhase;
pub use reducer::{
    BatchOptions, CurrentError, ReducerState, SessionReducer, StateRevision,
    TERMINATED_TOOL_OUTPUT,
};
pub use router::{EventRouter, EventSink};
pub use session::SessionController;
pub use snapshot::{FileSnapshotCache, SessionSnapshot, SnapshotKey};
pub use timeline::{TimelineEntry, ToolStatus};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
