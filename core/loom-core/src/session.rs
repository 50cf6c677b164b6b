//! Session lifecycle around the reducer.
//!
//! The controller owns the reducer behind a mutex that is never held across an
//! await. Each operation takes a generation token before its first await and
//! re-checks it after every one, so only the latest operation mutates state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use loom_protocol::{EventEnvelope, RunInfo, RunStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classify::ErrorCategory;
use crate::collaborators::{
    AgentBridge, ResumeMode, ResumeRequest, RunStore, SnapshotCache, StartRequest,
};
use crate::config::{LoomConfig, TimeoutConfig};
use crate::error::{Result, SessionError};
use crate::generation::{GenerationCounter, InFlightSlot, OperationToken};
use crate::lock_unpoisoned;
use crate::phase::SessionPhase;
use crate::reducer::{BatchOptions, CurrentError, ReducerState, SessionReducer, StateRevision};
use crate::router::{EventRouter, EventSink};
use crate::snapshot::{should_write_snapshot, SessionSnapshot, SnapshotKey};

enum History {
    Snapshot(SessionSnapshot),
    Events {
        events: Vec<EventEnvelope>,
        rejected_snapshot: bool,
    },
}

#[derive(Default)]
struct RunTimers {
    spawn: Option<JoinHandle<()>>,
    response: Option<JoinHandle<()>>,
}

impl RunTimers {
    fn cancel_all(&mut self) {
        for handle in [self.spawn.take(), self.response.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

struct ControllerInner {
    reducer: Arc<Mutex<SessionReducer>>,
    router: EventRouter,
    bridge: Arc<dyn AgentBridge>,
    runs: Arc<dyn RunStore>,
    snapshots: Option<Arc<dyn SnapshotCache>>,
    generation: GenerationCounter,
    in_flight: InFlightSlot,
    timers: Mutex<RunTimers>,
    timeouts: TimeoutConfig,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        bridge: Arc<dyn AgentBridge>,
        runs: Arc<dyn RunStore>,
        router: EventRouter,
        config: &LoomConfig,
    ) -> Self {
        let mut reducer = SessionReducer::new();
        reducer.set_strict(config.strict_reducer());
        Self {
            inner: Arc::new(ControllerInner {
                reducer: Arc::new(Mutex::new(reducer)),
                router,
                bridge,
                runs,
                snapshots: None,
                generation: GenerationCounter::new(),
                in_flight: InFlightSlot::new(),
                timers: Mutex::new(RunTimers::default()),
                timeouts: config.timeouts.clone(),
            }),
        }
    }

    /// Attaches a snapshot cache. Must be called before the controller is shared.
    pub fn with_snapshot_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.snapshots = Some(cache),
            None => tracing::warn!("Snapshot cache ignored; controller already shared"),
        }
        self
    }

    pub fn reducer(&self) -> Arc<Mutex<SessionReducer>> {
        Arc::clone(&self.inner.reducer)
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// A copy of the current state.
    pub fn state(&self) -> ReducerState {
        lock_unpoisoned(&self.inner.reducer).state().clone()
    }

    pub fn with_state<R>(&self, read: impl FnOnce(&ReducerState) -> R) -> R {
        read(lock_unpoisoned(&self.inner.reducer).state())
    }

    pub fn phase(&self) -> SessionPhase {
        lock_unpoisoned(&self.inner.reducer).phase()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StateRevision> {
        lock_unpoisoned(&self.inner.reducer).subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.generation.is_mounted()
    }

    pub fn apply_event(&self, envelope: &EventEnvelope) -> Result<()> {
        lock_unpoisoned(&self.inner.reducer).apply_event(envelope)?;
        Ok(())
    }

    pub fn apply_event_batch(
        &self,
        envelopes: &[EventEnvelope],
        options: BatchOptions,
    ) -> Result<Duration> {
        Ok(lock_unpoisoned(&self.inner.reducer).apply_event_batch(envelopes, options)?)
    }

    /// Clears the session and abandons every in-flight operation.
    pub fn reset(&self) {
        self.inner.generation.invalidate();
        self.inner.cancel_timers();
        self.inner.router.unsubscribe();
        lock_unpoisoned(&self.inner.reducer).reset();
    }

    /// Loads a run for display, from its snapshot when it has one.
    pub async fn load_run(&self, run_id: &str) -> Result<RunInfo> {
        let token = self.inner.generation.begin();
        self.inner.cancel_timers();
        lock_unpoisoned(&self.inner.reducer).set_phase(SessionPhase::Loading, "load_run");

        let result = self.load_run_inner(run_id, &token).await;
        if let Err(err) = result.as_ref() {
            self.inner.fail_if_current(&token, err, "load_run");
        }
        result
    }

    async fn load_run_inner(&self, run_id: &str, token: &OperationToken) -> Result<RunInfo> {
        let run = self.inner.fetch_run(run_id).await?;
        token.ensure_current()?;

        let history = self.inner.fetch_history(&run).await?;
        token.ensure_current()?;

        let replayed = self.inner.install_history(&run, history)?;
        if run.status.is_active() {
            self.inner.router.subscribe(&run.id, self.inner.sink());
        } else {
            self.inner.router.unsubscribe();
        }

        if let Some(event_count) = replayed {
            self.inner.persist_snapshot(&run, event_count, token).await;
        }

        tracing::info!(run_id = %run.id, status = run.status.as_str(), "Run loaded");
        Ok(run)
    }

    pub async fn start_session(
        &self,
        prompt: &str,
        cwd: &str,
        attachments: &[String],
    ) -> Result<RunInfo> {
        let token = self.inner.generation.begin();
        self.inner.cancel_timers();
        self.inner.router.unsubscribe();
        {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.reset();
            reducer.set_phase(SessionPhase::Spawning, "start_session");
            reducer.push_optimistic_user(prompt, attachments);
        }

        let request = StartRequest {
            prompt: prompt.to_string(),
            cwd: cwd.to_string(),
            attachments: attachments.to_vec(),
            model: None,
        };
        let run = match self.inner.bridge.start_session(request).await {
            Ok(run) => run,
            Err(err) => {
                self.inner.fail_if_current(&token, &err, "start_session");
                return Err(err);
            }
        };

        if let Err(err) = token.ensure_current() {
            tracing::info!(run_id = %run.id, "Start superseded; stopping orphaned run");
            if let Err(stop_err) = self.inner.bridge.stop(&run.id).await {
                tracing::warn!(run_id = %run.id, error = %stop_err, "Failed to stop superseded run");
            }
            return Err(err);
        }

        lock_unpoisoned(&self.inner.reducer).set_run(run.clone());
        self.inner.router.subscribe(&run.id, self.inner.sink());
        self.inner.arm_spawn_timer(&run.id);
        self.inner.arm_response_timer(&run.id);
        tracing::info!(run_id = %run.id, cwd, "Session started");
        Ok(run)
    }

    pub async fn send_message(&self, text: &str, attachments: &[String]) -> Result<()> {
        let run_id = self.inner.live_run_id()?;
        {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.clear_error();
            reducer.push_optimistic_user(text, attachments);
            if matches!(reducer.phase(), SessionPhase::Idle | SessionPhase::Ready) {
                reducer.set_phase(SessionPhase::Running, "send_message");
            }
        }

        if let Err(err) = self
            .inner
            .bridge
            .send_message(&run_id, text, attachments)
            .await
        {
            if self.inner.is_current_run(&run_id) {
                lock_unpoisoned(&self.inner.reducer)
                    .set_error(CurrentError::from_upstream(None, &err.to_string()));
            }
            return Err(err);
        }

        if self.inner.is_current_run(&run_id) {
            self.inner.arm_response_timer(&run_id);
        }
        Ok(())
    }

    pub async fn interrupt(&self) -> Result<()> {
        let run_id = self.inner.live_run_id()?;
        self.inner.bridge.interrupt(&run_id).await?;
        tracing::info!(run_id = %run_id, "Interrupt requested");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let run_id = self.inner.current_run_id().ok_or(SessionError::NoActiveRun)?;
        self.inner.cancel_timers();
        self.inner.bridge.stop(&run_id).await?;

        if self.inner.is_current_run(&run_id) {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.set_phase(SessionPhase::Stopped, "stop");
            reducer.set_run_status(RunStatus::Stopped);
            reducer.finalize_terminal();
        }
        tracing::info!(run_id = %run_id, "Session stopped");
        Ok(())
    }

    pub async fn set_model(&self, model: &str) -> Result<()> {
        let run_id = self.inner.live_run_id()?;
        self.inner.bridge.set_model(&run_id, model).await?;

        if self.inner.is_current_run(&run_id) {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            let run = reducer.state().run.clone();
            if let Some(mut run) = run {
                run.model = Some(model.to_string());
                reducer.set_run(run);
            }
        }
        Ok(())
    }

    /// Reattaches a stored run to a live agent process.
    ///
    /// `Fork` runs both fork phases back to back.
    pub async fn resume_session(
        &self,
        run_id: &str,
        mode: ResumeMode,
        message: Option<&str>,
        attachments: &[String],
    ) -> Result<RunInfo> {
        if mode == ResumeMode::Fork {
            let forked = self.fork_session(run_id).await?;
            self.connect_session(&forked.id, forked.session_id.as_deref())
                .await?;
            if let Some(text) = message {
                self.send_message(text, attachments).await?;
            }
            return Ok(forked);
        }

        let _permit = self.inner.in_flight.try_acquire()?;
        let token = self.inner.generation.begin();

        let result = self
            .resume_inner(run_id, mode, message, attachments, &token)
            .await;
        if let Err(err) = result.as_ref() {
            if !matches!(
                err,
                SessionError::MissingSessionId(_) | SessionError::RunNotFound(_)
            ) {
                self.inner.fail_if_current(&token, err, "resume_session");
            }
        }
        result
    }

    async fn resume_inner(
        &self,
        run_id: &str,
        mode: ResumeMode,
        message: Option<&str>,
        attachments: &[String],
        token: &OperationToken,
    ) -> Result<RunInfo> {
        let mut run = self.inner.fetch_run(run_id).await?;
        token.ensure_current()?;

        let mut reattach = false;
        if run.status.is_active() {
            let alive = self.inner.bridge.is_process_alive(&run.id).await?;
            token.ensure_current()?;
            if alive {
                reattach = true;
            } else {
                tracing::warn!(run_id = %run.id, "Run is marked active but its process is gone; stopping it");
                if let Err(err) = self.inner.bridge.stop(&run.id).await {
                    tracing::warn!(run_id = %run.id, error = %err, "Failed to stop orphaned run");
                }
                run = self.inner.fetch_run(run_id).await?;
                token.ensure_current()?;
            }
        }

        let session_id = run.session_id.clone().filter(|id| !id.trim().is_empty());
        if mode.requires_session_id() && session_id.is_none() {
            return Err(SessionError::MissingSessionId(run.id.clone()));
        }

        // Fetch before clearing so the view never flashes empty.
        let history = self.inner.fetch_history(&run).await?;
        token.ensure_current()?;
        self.inner.invalidate_snapshot(&run.id).await;
        token.ensure_current()?;

        self.inner.cancel_timers();
        self.inner.install_history(&run, history)?;
        {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.clear_error();
            if !reattach {
                reducer.set_phase(SessionPhase::Spawning, "resume_session");
            }
            if let Some(text) = message {
                reducer.push_optimistic_user(text, attachments);
            }
        }
        self.inner.router.subscribe(&run.id, self.inner.sink());

        let request = ResumeRequest {
            run_id: run.id.clone(),
            session_id,
            mode,
            message: message.map(str::to_string),
            attachments: attachments.to_vec(),
        };
        self.inner.bridge.resume_session(request).await?;
        token.ensure_current()?;

        lock_unpoisoned(&self.inner.reducer).set_run_status(RunStatus::Running);
        if !reattach {
            self.inner.arm_spawn_timer(&run.id);
        }
        if message.is_some() {
            self.inner.arm_response_timer(&run.id);
        }
        tracing::info!(run_id = %run.id, mode = mode.as_str(), reattach, "Session resumed");
        Ok(run)
    }

    /// Fork phase one: create the branch and show its copied history.
    ///
    /// The branch is left `ready`; [`SessionController::connect_session`] makes
    /// it live.
    pub async fn fork_session(&self, run_id: &str) -> Result<RunInfo> {
        let _permit = self.inner.in_flight.try_acquire()?;
        let token = self.inner.generation.begin();

        let source = self.inner.fetch_run(run_id).await?;
        token.ensure_current()?;

        let forked = self.inner.bridge.fork_session(&source).await?;
        token.ensure_current()?;

        let events = self.inner.runs.load_events(&forked.id).await?;
        token.ensure_current()?;

        self.inner.cancel_timers();
        self.inner.router.unsubscribe();
        {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.reset();
            reducer.set_run(forked.clone());
            reducer.set_phase(SessionPhase::Loading, "fork_session");
            reducer.apply_event_batch(&events, BatchOptions::replay_only())?;
            reducer.set_phase(SessionPhase::Ready, "fork_session");
        }

        tracing::info!(source_run_id = %source.id, run_id = %forked.id, events = events.len(), "Session forked");
        Ok(forked)
    }

    /// Fork phase two: open the live connection for a prepared run.
    pub async fn connect_session(&self, run_id: &str, session_id: Option<&str>) -> Result<()> {
        let _permit = self.inner.in_flight.try_acquire()?;
        let token = self.inner.generation.begin();

        if !self.inner.is_current_run(run_id) {
            return Err(SessionError::RunNotFound(run_id.to_string()));
        }

        self.inner.invalidate_snapshot(run_id).await;
        token.ensure_current()?;

        self.inner.router.subscribe(run_id, self.inner.sink());
        {
            let mut reducer = lock_unpoisoned(&self.inner.reducer);
            reducer.clear_error();
            reducer.set_phase(SessionPhase::Spawning, "connect_session");
        }

        if let Err(err) = self.inner.bridge.connect_session(run_id, session_id).await {
            self.inner.fail_if_current(&token, &err, "connect_session");
            return Err(err);
        }
        token.ensure_current()?;

        lock_unpoisoned(&self.inner.reducer).set_run_status(RunStatus::Running);
        self.inner.arm_spawn_timer(run_id);
        tracing::info!(run_id, "Session connected");
        Ok(())
    }

    /// The owning view went away; late completions are dropped from now on.
    pub fn unmount(&self) {
        self.inner.generation.unmount();
        self.inner.cancel_timers();
        self.inner.router.unsubscribe();
    }

    pub fn mount(&self) {
        self.inner.generation.mount();
    }
}

impl ControllerInner {
    fn sink(&self) -> Arc<dyn EventSink> {
        self.reducer.clone()
    }

    fn current_run_id(&self) -> Option<String> {
        lock_unpoisoned(&self.reducer)
            .state()
            .run
            .as_ref()
            .map(|run| run.id.clone())
    }

    fn is_current_run(&self, run_id: &str) -> bool {
        self.current_run_id().as_deref() == Some(run_id)
    }

    /// The current run, provided it can still take input.
    fn live_run_id(&self) -> Result<String> {
        let reducer = lock_unpoisoned(&self.reducer);
        let state = reducer.state();
        match state.run.as_ref() {
            Some(run) if !run.status.is_terminal() && !state.phase.is_terminal() => {
                Ok(run.id.clone())
            }
            _ => Err(SessionError::NoActiveRun),
        }
    }

    async fn fetch_run(&self, run_id: &str) -> Result<RunInfo> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| SessionError::RunNotFound(run_id.to_string()))
    }

    async fn fetch_history(&self, run: &RunInfo) -> Result<History> {
        let mut rejected_snapshot = false;
        if run.status.is_terminal() {
            if let Some(cache) = self.snapshots.as_ref() {
                let key = SnapshotKey::new(run.id.clone(), run.status);
                match cache.load(&key).await {
                    Ok(Some(bytes)) => match SessionSnapshot::decode(&bytes) {
                        Ok(snapshot) => return Ok(History::Snapshot(snapshot)),
                        Err(err) => {
                            rejected_snapshot = true;
                            tracing::warn!(run_id = %run.id, error = %err, "Ignoring malformed snapshot; replaying event log");
                        }
                    },
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(run_id = %run.id, error = %err, "Failed to read snapshot; replaying event log");
                    }
                }
            }
        }

        let events = self.runs.load_events(&run.id).await?;
        Ok(History::Events {
            events,
            rejected_snapshot,
        })
    }

    /// Rebuilds state for `run`. Returns the replayed event count when the
    /// history came from the event log.
    fn install_history(&self, run: &RunInfo, history: History) -> Result<Option<usize>> {
        let mut reducer = lock_unpoisoned(&self.reducer);
        reducer.reset();
        reducer.set_run(run.clone());
        reducer.set_phase(SessionPhase::Loading, "install_history");

        let replayed = match history {
            History::Snapshot(snapshot) => {
                reducer.apply_snapshot(snapshot);
                if run.status.is_terminal() {
                    reducer.finalize_terminal();
                }
                None
            }
            History::Events {
                events,
                rejected_snapshot,
            } => {
                if rejected_snapshot {
                    reducer.state_mut().anomalies.rejected_snapshots += 1;
                }
                let elapsed = reducer.apply_event_batch(&events, BatchOptions::replay_only())?;
                tracing::debug!(
                    run_id = %run.id,
                    events = events.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Replayed event log"
                );
                Some(events.len())
            }
        };

        let phase = match run.status {
            RunStatus::Idle => SessionPhase::Ready,
            status => SessionPhase::from(status),
        };
        reducer.set_phase(phase, "install_history");
        Ok(replayed)
    }

    async fn persist_snapshot(&self, run: &RunInfo, event_count: usize, token: &OperationToken) {
        if !run.status.is_terminal() {
            return;
        }
        let Some(cache) = self.snapshots.as_ref() else {
            return;
        };

        let bytes = {
            let reducer = lock_unpoisoned(&self.reducer);
            if !should_write_snapshot(reducer.state(), event_count) {
                tracing::warn!(
                    run_id = %run.id,
                    event_count,
                    "Replay produced an empty timeline; not caching snapshot"
                );
                return;
            }
            match reducer.build_snapshot() {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(run_id = %run.id, error = %err, "Failed to build snapshot");
                    return;
                }
            }
        };

        if !token.is_current() {
            return;
        }
        let key = SnapshotKey::new(run.id.clone(), run.status);
        if let Err(err) = cache.store(&key, bytes).await {
            tracing::warn!(run_id = %run.id, error = %err, "Failed to write snapshot");
        }
    }

    async fn invalidate_snapshot(&self, run_id: &str) {
        if let Some(cache) = self.snapshots.as_ref() {
            if let Err(err) = cache.invalidate(run_id).await {
                tracing::warn!(run_id, error = %err, "Failed to invalidate snapshot");
            }
        }
    }

    fn fail_if_current(&self, token: &OperationToken, err: &SessionError, reason: &str) {
        if err.is_superseded() || !token.is_current() {
            return;
        }
        tracing::warn!(error = %err, reason, "Session operation failed");
        let mut reducer = lock_unpoisoned(&self.reducer);
        reducer.set_error(CurrentError::from_upstream(None, &err.to_string()));
        reducer.set_phase(SessionPhase::Failed, reason);
    }

    fn cancel_timers(&self) {
        lock_unpoisoned(&self.timers).cancel_all();
    }

    fn arm_spawn_timer(self: &Arc<Self>, run_id: &str) {
        let inner = Arc::clone(self);
        let run_id = run_id.to_string();
        let timeout = self.timeouts.spawn_timeout();
        let handle = tokio::spawn(async move { inner.watch_spawn(run_id, timeout).await });
        if let Some(previous) = lock_unpoisoned(&self.timers).spawn.replace(handle) {
            previous.abort();
        }
    }

    fn arm_response_timer(self: &Arc<Self>, run_id: &str) {
        let inner = Arc::clone(self);
        let run_id = run_id.to_string();
        let timeout = self.timeouts.response_timeout();
        let armed_seq = lock_unpoisoned(&self.reducer).state().content_seq;
        let handle =
            tokio::spawn(async move { inner.watch_response(run_id, armed_seq, timeout).await });
        if let Some(previous) = lock_unpoisoned(&self.timers).response.replace(handle) {
            previous.abort();
        }
    }

    /// Waits for the deadline; returns false once the phase leaves `watched`.
    async fn wait_in_phase(&self, watched: &[SessionPhase], timeout: Duration) -> bool {
        let mut revisions = lock_unpoisoned(&self.reducer).subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let phase = revisions.borrow_and_update().phase;
            if !watched.contains(&phase) {
                return false;
            }
            tokio::select! {
                _ = &mut deadline => return true,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn watch_spawn(self: Arc<Self>, run_id: String, timeout: Duration) {
        if !self.wait_in_phase(&[SessionPhase::Spawning], timeout).await {
            return;
        }

        let expired = {
            let mut reducer = lock_unpoisoned(&self.reducer);
            let state = reducer.state();
            let still_spawning = state.phase == SessionPhase::Spawning
                && !state.initialized
                && state.run.as_ref().map(|run| run.id == run_id).unwrap_or(false);
            if still_spawning {
                reducer.set_error(CurrentError {
                    category: ErrorCategory::ServerIssue,
                    message: format!(
                        "Agent did not start within {} seconds",
                        timeout.as_secs()
                    ),
                    stalled: false,
                });
                reducer.set_phase(SessionPhase::Failed, "spawn_timeout");
                reducer.set_run_status(RunStatus::Failed);
            }
            still_spawning
        };

        if expired {
            tracing::warn!(run_id = %run_id, "Spawn timeout; terminating agent process");
            if let Err(err) = self.bridge.stop(&run_id).await {
                tracing::warn!(run_id = %run_id, error = %err, "Failed to stop timed-out agent");
            }
        }
    }

    /// Waits out the spawning phase; returns true if the agent reached running.
    async fn wait_until_running(&self) -> bool {
        let mut revisions = lock_unpoisoned(&self.reducer).subscribe();
        loop {
            let phase = revisions.borrow_and_update().phase;
            if phase != SessionPhase::Spawning {
                return phase == SessionPhase::Running;
            }
            if revisions.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn watch_response(self: Arc<Self>, run_id: String, armed_seq: u64, timeout: Duration) {
        // The deadline counts from the moment the agent is running.
        if !self.wait_until_running().await {
            return;
        }
        if !self.wait_in_phase(&[SessionPhase::Running], timeout).await {
            return;
        }

        let mut reducer = lock_unpoisoned(&self.reducer);
        let state = reducer.state();
        let stalled = state.phase == SessionPhase::Running
            && state.content_seq == armed_seq
            && state.error.is_none()
            && state.run.as_ref().map(|run| run.id == run_id).unwrap_or(false);
        if stalled {
            tracing::warn!(run_id = %run_id, "No response from agent before deadline");
            reducer.set_error(CurrentError::stalled(format!(
                "No response from the agent for {} seconds",
                timeout.as_secs()
            )));
        }
    }
}
