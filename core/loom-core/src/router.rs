//! Transport demultiplexer and microbatcher.
//!
//! The router is the single registration point for transport listeners.
//! Session events are parsed, buffered per session, and flushed to their
//! subscribers once per flush interval. A buffer that grows past the overflow
//! threshold is flushed synchronously on the pushing thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use loom_protocol::{
    parse_envelope, EventEnvelope, CONTROL_SIGNAL_LISTENER, LISTENER_NAMES,
    PROCESS_STDERR_LISTENER, PROCESS_STDOUT_LISTENER, SESSION_EVENT_LISTENER,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::collaborators::{ListenerCallback, ListenerId, Transport};
use crate::config::RouterConfig;
use crate::error::ReducerError;
use crate::lock_unpoisoned;
use crate::reducer::{BatchOptions, SessionReducer};

/// Receives flushed session events.
pub trait EventSink: Send + Sync {
    fn deliver_event(&self, envelope: &EventEnvelope) -> Result<(), ReducerError>;
    fn deliver_batch(&self, envelopes: &[EventEnvelope]) -> Result<(), ReducerError>;
}

impl EventSink for Mutex<SessionReducer> {
    fn deliver_event(&self, envelope: &EventEnvelope) -> Result<(), ReducerError> {
        lock_unpoisoned(self).apply_event(envelope)
    }

    fn deliver_batch(&self, envelopes: &[EventEnvelope]) -> Result<(), ReducerError> {
        lock_unpoisoned(self)
            .apply_event_batch(envelopes, BatchOptions::live())
            .map(|_| ())
    }
}

/// Handler for raw process output: `(listener name, payload)`.
pub type RawHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type ControlHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered_events: u64,
    pub dropped_events: u64,
    pub invalid_payloads: u64,
    pub delivery_failures: u64,
    pub overflow_flushes: u64,
    pub registration_failures: u64,
}

#[derive(Clone)]
struct Subscription {
    session_id: String,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct RouterState {
    started: bool,
    listeners: Vec<ListenerId>,
    current: Option<Subscription>,
    secondary: HashMap<String, Arc<dyn EventSink>>,
    buffers: HashMap<String, Vec<EventEnvelope>>,
    flush_task: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
    raw_handler: Option<RawHandler>,
    control_handler: Option<ControlHandler>,
    stats: RouterStats,
}

impl RouterState {
    fn is_subscribed(&self, session_id: &str) -> bool {
        self.current
            .as_ref()
            .map(|current| current.session_id == session_id)
            .unwrap_or(false)
            || self.secondary.contains_key(session_id)
    }

    fn sinks_for(&self, session_id: &str) -> Vec<Arc<dyn EventSink>> {
        let mut sinks = Vec::new();
        if let Some(current) = self.current.as_ref() {
            if current.session_id == session_id {
                sinks.push(Arc::clone(&current.sink));
            }
        }
        if let Some(sink) = self.secondary.get(session_id) {
            if !sinks.iter().any(|existing| same_sink(existing, sink)) {
                sinks.push(Arc::clone(sink));
            }
        }
        sinks
    }

    fn release_buffer(&mut self, session_id: &str) {
        if !self.is_subscribed(session_id) {
            self.buffers.remove(session_id);
        }
    }
}

fn same_sink(a: &Arc<dyn EventSink>, b: &Arc<dyn EventSink>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct RouterInner {
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    state: Mutex<RouterState>,
}

#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(transport: Arc<dyn Transport>, config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                transport,
                config,
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// Registers every transport listener. Calling it again is a no-op.
    ///
    /// A listener that fails to register is logged and skipped. Returns the
    /// number of registered listeners.
    pub fn start(&self) -> usize {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.started {
                return state.listeners.len();
            }
            state.started = true;
            state.runtime = Handle::try_current().ok();
        }

        let mut registered = Vec::new();
        let mut failures = 0u64;
        for name in LISTENER_NAMES {
            let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
            let listener = name.to_string();
            let callback: ListenerCallback = Arc::new(move |payload: Value| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(&listener, payload);
                }
            });
            match self.inner.transport.listen(name, callback) {
                Ok(id) => registered.push(id),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(listener = name, error = %err, "Failed to register transport listener");
                }
            }
        }

        let mut state = lock_unpoisoned(&self.inner.state);
        state.listeners.extend(registered);
        state.stats.registration_failures += failures;
        tracing::debug!(
            registered = state.listeners.len(),
            failed = failures,
            "Event router started"
        );
        state.listeners.len()
    }

    /// Unregisters every listener and discards buffers, subscriptions, and handlers.
    pub fn destroy(&self) {
        let (listeners, task) = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let listeners = std::mem::take(&mut state.listeners);
            let task = state.flush_task.take();
            *state = RouterState::default();
            (listeners, task)
        };
        if let Some(task) = task {
            task.abort();
        }
        for id in listeners {
            self.inner.transport.unlisten(id);
        }
        tracing::debug!("Event router destroyed");
    }

    pub fn is_started(&self) -> bool {
        lock_unpoisoned(&self.inner.state).started
    }

    /// Makes `session_id` the current subscription.
    ///
    /// The same (session, sink) pair is a no-op so an in-flight buffer survives.
    pub fn subscribe(&self, session_id: &str, sink: Arc<dyn EventSink>) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(current) = state.current.as_ref() {
            if current.session_id == session_id && same_sink(&current.sink, &sink) {
                return;
            }
        }

        let previous = state.current.replace(Subscription {
            session_id: session_id.to_string(),
            sink,
        });
        if let Some(previous) = previous {
            if previous.session_id != session_id {
                state.release_buffer(&previous.session_id);
            }
        }
        tracing::debug!(session_id, "Subscribed current session");
    }

    pub fn unsubscribe(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(previous) = state.current.take() {
            state.release_buffer(&previous.session_id);
        }
    }

    pub fn add_secondary(&self, session_id: &str, sink: Arc<dyn EventSink>) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(existing) = state.secondary.get(session_id) {
            if same_sink(existing, &sink) {
                return;
            }
        }
        state.secondary.insert(session_id.to_string(), sink);
    }

    pub fn remove_secondary(&self, session_id: &str) {
        let mut state = lock_unpoisoned(&self.inner.state);
        if state.secondary.remove(session_id).is_some() {
            state.release_buffer(session_id);
        }
    }

    pub fn current_session(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.state)
            .current
            .as_ref()
            .map(|current| current.session_id.clone())
    }

    pub fn set_raw_handler(&self, handler: Option<RawHandler>) {
        lock_unpoisoned(&self.inner.state).raw_handler = handler;
    }

    pub fn set_control_handler(&self, handler: Option<ControlHandler>) {
        lock_unpoisoned(&self.inner.state).control_handler = handler;
    }

    pub fn buffered(&self, session_id: &str) -> usize {
        lock_unpoisoned(&self.inner.state)
            .buffers
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RouterStats {
        lock_unpoisoned(&self.inner.state).stats
    }

    /// Parses and routes one payload as if the transport delivered it.
    pub fn dispatch(&self, listener: &str, payload: Value) {
        self.inner.dispatch(listener, payload);
    }

    /// Flushes every buffer now, cancelling the pending timer.
    pub fn flush_now(&self) {
        let task = lock_unpoisoned(&self.inner.state).flush_task.take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.flush();
    }
}

impl RouterInner {
    fn dispatch(self: &Arc<Self>, listener: &str, payload: Value) {
        match listener {
            SESSION_EVENT_LISTENER => match parse_envelope(payload) {
                Ok(envelope) => self.push(envelope),
                Err(err) => {
                    lock_unpoisoned(&self.state).stats.invalid_payloads += 1;
                    tracing::warn!(code = %err.code, error = %err.message, "Dropping invalid session event");
                }
            },
            PROCESS_STDOUT_LISTENER | PROCESS_STDERR_LISTENER => {
                let handler = lock_unpoisoned(&self.state).raw_handler.clone();
                if let Some(handler) = handler {
                    handler(listener, &payload);
                }
            }
            CONTROL_SIGNAL_LISTENER => {
                let handler = lock_unpoisoned(&self.state).control_handler.clone();
                if let Some(handler) = handler {
                    handler(&payload);
                }
            }
            other => tracing::trace!(listener = other, "Ignoring payload for unknown listener"),
        }
    }

    fn push(self: &Arc<Self>, envelope: EventEnvelope) {
        let mut state = lock_unpoisoned(&self.state);
        let session_id = match envelope.session_id.as_deref() {
            Some(session_id) if state.is_subscribed(session_id) => session_id.to_string(),
            other => {
                state.stats.dropped_events += 1;
                tracing::trace!(session_id = ?other, "Dropping event for unsubscribed session");
                return;
            }
        };

        let buffer = state.buffers.entry(session_id.clone()).or_default();
        buffer.push(envelope);

        if buffer.len() > self.config.overflow_threshold {
            let events = state.buffers.remove(&session_id).unwrap_or_default();
            let sinks = state.sinks_for(&session_id);
            state.stats.overflow_flushes += 1;
            drop(state);
            tracing::debug!(session_id = %session_id, events = events.len(), "Buffer overflow; flushing synchronously");
            self.deliver(&session_id, &events, &sinks);
            return;
        }

        if state.flush_task.is_some() {
            return;
        }
        match state.runtime.clone() {
            Some(runtime) => {
                let weak = Arc::downgrade(self);
                let interval = self.config.flush_interval();
                state.flush_task = Some(runtime.spawn(async move {
                    tokio::time::sleep(interval).await;
                    if let Some(inner) = weak.upgrade() {
                        lock_unpoisoned(&inner.state).flush_task = None;
                        inner.flush();
                    }
                }));
            }
            None => {
                drop(state);
                self.flush();
            }
        }
    }

    fn flush(&self) {
        let work: Vec<(String, Vec<EventEnvelope>, Vec<Arc<dyn EventSink>>)> = {
            let mut state = lock_unpoisoned(&self.state);
            let buffers = std::mem::take(&mut state.buffers);
            buffers
                .into_iter()
                .filter(|(_, events)| !events.is_empty())
                .map(|(session_id, events)| {
                    let sinks = state.sinks_for(&session_id);
                    (session_id, events, sinks)
                })
                .collect()
        };

        for (session_id, events, sinks) in work {
            self.deliver(&session_id, &events, &sinks);
        }
    }

    fn deliver(&self, session_id: &str, events: &[EventEnvelope], sinks: &[Arc<dyn EventSink>]) {
        let mut delivered = 0u64;
        let mut failures = 0u64;
        for sink in sinks {
            let result = if events.len() == 1 {
                sink.deliver_event(&events[0])
            } else {
                sink.deliver_batch(events)
            };
            match result {
                Ok(()) => delivered += events.len() as u64,
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        session_id,
                        events = events.len(),
                        error = %err,
                        "Failed to deliver events to subscriber"
                    );
                }
            }
        }

        let mut state = lock_unpoisoned(&self.state);
        state.stats.delivered_events += delivered;
        state.stats.delivery_failures += failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InProcessTransport;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn calls(&self) -> Vec<(String, usize)> {
            lock_unpoisoned(&self.calls).clone()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver_event(&self, _envelope: &EventEnvelope) -> Result<(), ReducerError> {
            lock_unpoisoned(&self.calls).push(("single".to_string(), 1));
            if self.fail {
                return Err(ReducerError::UnknownEventType("boom".to_string()));
            }
            Ok(())
        }

        fn deliver_batch(&self, envelopes: &[EventEnvelope]) -> Result<(), ReducerError> {
            lock_unpoisoned(&self.calls).push(("batch".to_string(), envelopes.len()));
            if self.fail {
                return Err(ReducerError::UnknownEventType("boom".to_string()));
            }
            Ok(())
        }
    }

    fn session_event(session_id: &str, text: &str) -> Value {
        json!({"type": "message_delta", "session_id": session_id, "text": text})
    }

    fn router_with(threshold: usize) -> (Arc<InProcessTransport>, EventRouter) {
        let transport = Arc::new(InProcessTransport::new());
        let router = EventRouter::new(
            transport.clone(),
            RouterConfig {
                flush_interval_ms: 16,
                overflow_threshold: threshold,
            },
        );
        (transport, router)
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_events_into_one_batch() {
        let (transport, router) = router_with(500);
        router.start();
        let sink = Arc::new(RecordingSink::default());
        router.subscribe("s-1", sink.clone());

        for text in ["a", "b", "c"] {
            transport.emit(SESSION_EVENT_LISTENER, session_event("s-1", text));
        }
        assert!(sink.calls().is_empty());
        assert_eq!(router.buffered("s-1"), 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.calls(), vec![("batch".to_string(), 3)]);
        assert_eq!(router.stats().delivered_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_event_uses_single_path() {
        let (transport, router) = router_with(500);
        router.start();
        let sink = Arc::new(RecordingSink::default());
        router.subscribe("s-1", sink.clone());

        transport.emit(SESSION_EVENT_LISTENER, session_event("s-1", "a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.calls(), vec![("single".to_string(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_flushes_synchronously() {
        let (transport, router) = router_with(4);
        router.start();
        let sink = Arc::new(RecordingSink::default());
        router.subscribe("s-1", sink.clone());

        for index in 0..5 {
            transport.emit(
                SESSION_EVENT_LISTENER,
                session_event("s-1", &index.to_string()),
            );
        }
        assert_eq!(sink.calls(), vec![("batch".to_string(), 5)]);
        assert_eq!(router.stats().overflow_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_subscriber_does_not_block_others() {
        let (transport, router) = router_with(500);
        router.start();
        let broken = Arc::new(RecordingSink::failing());
        let healthy = Arc::new(RecordingSink::default());
        router.subscribe("s-broken", broken.clone());
        router.add_secondary("s-healthy", healthy.clone());

        transport.emit(SESSION_EVENT_LISTENER, session_event("s-broken", "x"));
        transport.emit(SESSION_EVENT_LISTENER, session_event("s-healthy", "y"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broken.calls().len(), 1);
        assert_eq!(healthy.calls(), vec![("single".to_string(), 1)]);
        assert_eq!(router.stats().delivery_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_same_pair_keeps_buffer() {
        let (transport, router) = router_with(500);
        router.start();
        let sink = Arc::new(RecordingSink::default());
        router.subscribe("s-1", sink.clone());
        transport.emit(SESSION_EVENT_LISTENER, session_event("s-1", "a"));

        router.subscribe("s-1", sink.clone());
        assert_eq!(router.buffered("s-1"), 1);

        let other = Arc::new(RecordingSink::default());
        router.subscribe("s-2", other);
        assert_eq!(router.buffered("s-1"), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_tolerates_partial_failure() {
        let (transport, router) = router_with(500);
        transport.fail_registration(PROCESS_STDERR_LISTENER);

        assert_eq!(router.start(), 3);
        assert_eq!(router.start(), 3);
        assert_eq!(transport.listener_count(), 3);
        assert_eq!(router.stats().registration_failures, 1);

        router.destroy();
        assert_eq!(transport.listener_count(), 0);
        assert!(!router.is_started());
    }

    #[tokio::test]
    async fn raw_output_goes_to_handler_and_missing_handler_is_silent() {
        let (transport, router) = router_with(500);
        router.start();

        transport.emit(PROCESS_STDOUT_LISTENER, json!("before handler"));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        router.set_raw_handler(Some(Arc::new(move |source: &str, payload: &Value| {
            lock_unpoisoned(&captured).push(format!("{}:{}", source, payload));
        })));
        transport.emit(PROCESS_STDOUT_LISTENER, json!("hello"));

        assert_eq!(
            lock_unpoisoned(&lines).clone(),
            vec![format!("{}:\"hello\"", PROCESS_STDOUT_LISTENER)]
        );
    }

    #[tokio::test]
    async fn unsubscribed_and_invalid_events_are_dropped() {
        let (transport, router) = router_with(500);
        router.start();
        transport.emit(SESSION_EVENT_LISTENER, session_event("nobody", "x"));
        transport.emit(SESSION_EVENT_LISTENER, json!({"session_id": "s-1"}));

        let stats = router.stats();
        assert_eq!(stats.dropped_events, 1);
        assert_eq!(stats.invalid_payloads, 1);
    }
}
