//! Event bus
//!
//! Listeners are invoked synchronously, in subscription order, from inside
//! `emit`. The listener list is snapshotted before dispatch so callbacks may
//! subscribe, unsubscribe or emit without deadlocking.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::EventError;
use crate::namespace::EventNamespace;
use crate::redact::redact;
use crate::Result;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Maximum number of history entries retained (oldest evicted first)
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

/// A recorded emission, with sensitive fields already redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event: String,
    pub payload: Value,
    pub timestamp: i64,
}

struct ListenerEntry {
    id: ListenerId,
    callback: Listener,
    once: bool,
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<String, Vec<ListenerEntry>>,
    history: VecDeque<HistoryEntry>,
    queue: VecDeque<(String, Value)>,
    paused: bool,
    destroyed: bool,
}

struct Inner {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    config: EventBusConfig,
}

impl Inner {
    fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let Some(entries) = state.listeners.get_mut(event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            state.listeners.remove(event);
        }

        removed
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<Inner>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove_listener(&self.event, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState::default()),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Subscribe to an event. Listeners run in subscription order.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(callback), false)
    }

    /// Subscribe for the next emission only.
    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(callback), true)
    }

    fn register(&self, event: &str, callback: Listener, once: bool) -> Subscription {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                tracing::debug!(event = %event, "Ignoring subscription on destroyed event bus");
            } else {
                state
                    .listeners
                    .entry(event.to_string())
                    .or_default()
                    .push(ListenerEntry { id, callback, once });
            }
        }

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
        }
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.remove_listener(event, id)
    }

    /// Remove every listener for `event`, or for all events when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut state = self.inner.state.lock();
        match event {
            Some(event) => {
                state.listeners.remove(event);
            }
            None => state.listeners.clear(),
        }
    }

    /// Emit an event. Returns true iff at least one listener ran.
    ///
    /// While paused the emission is recorded and queued, and false is returned.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return false;
            }

            state.history.push_back(HistoryEntry {
                event: event.to_string(),
                payload: redact(&payload),
                timestamp: Utc::now().timestamp_millis(),
            });
            while state.history.len() > self.inner.config.max_history {
                state.history.pop_front();
            }

            if state.paused {
                state.queue.push_back((event.to_string(), payload));
                return false;
            }
        }

        self.dispatch(event, &payload)
    }

    fn dispatch(&self, event: &str, payload: &Value) -> bool {
        let callbacks: Vec<Listener> = {
            let mut state = self.inner.state.lock();
            let Some(entries) = state.listeners.get_mut(event) else {
                return false;
            };

            let snapshot = entries.iter().map(|e| Arc::clone(&e.callback)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                state.listeners.remove(event);
            }
            snapshot
        };

        if callbacks.is_empty() {
            return false;
        }

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!(event = %event, "Event listener panicked");
            }
        }

        true
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Resume delivery, flushing queued emissions in FIFO order.
    pub fn resume(&self) {
        self.inner.state.lock().paused = false;

        loop {
            let next = {
                let mut state = self.inner.state.lock();
                // a listener may pause again mid-flush
                if state.paused || state.destroyed {
                    break;
                }
                state.queue.pop_front()
            };

            match next {
                Some((event, payload)) => {
                    self.dispatch(&event, &payload);
                }
                None => break,
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Recorded emissions in insertion order, optionally filtered by event.
    pub fn history(&self, event: Option<&str>) -> Vec<HistoryEntry> {
        let state = self.inner.state.lock();
        state
            .history
            .iter()
            .filter(|entry| event.map_or(true, |name| entry.event == name))
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().history.clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .state
            .lock()
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Names of events with at least one listener, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().listeners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve with the payload of the next emission of `event`.
    pub async fn wait_for(&self, event: &str, timeout: Option<Duration>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.once(event, move |payload| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(payload.clone());
            }
        });

        let closed = || EventError::Closed(event.to_string());

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| closed()),
                Err(_) => {
                    subscription.unsubscribe();
                    Err(EventError::Timeout {
                        event: event.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => rx.await.map_err(|_| closed()),
        }
    }

    /// An isolated view whose events are stored as `"<prefix>:<event>"`.
    pub fn namespace(&self, prefix: &str) -> EventNamespace {
        EventNamespace::new(self.clone(), prefix)
    }

    /// Drop all listeners, queued emissions and history. Further emits are no-ops.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        state.destroyed = true;
        state.listeners.clear();
        state.queue.clear();
        state.history.clear();
        tracing::debug!("Event bus destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::REDACTED;
    use serde_json::json;

    fn recorder(bus: &EventBus, event: &str, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) {
        let log = Arc::clone(log);
        bus.on(event, move |_| log.lock().push(tag.to_string()));
    }

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "ping", "a", &log);
        recorder(&bus, "ping", "b", &log);
        recorder(&bus, "ping", "c", &log);

        assert!(bus.emit("ping", json!(null)));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(!bus.emit("nobody-listens", json!(null)));
    }

    #[test]
    fn test_panicking_listener_does_not_block_siblings() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "ping", "before", &log);
        bus.on("ping", |_| panic!("listener failure"));
        recorder(&bus, "ping", "after", &log);

        assert!(bus.emit("ping", json!({})));
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_once_and_unsubscribe() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let once_log = Arc::clone(&log);
        bus.once("ping", move |_| once_log.lock().push("once".to_string()));
        let sub_log = Arc::clone(&log);
        let sub = bus.on("ping", move |_| sub_log.lock().push("on".to_string()));

        bus.emit("ping", json!(1));
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!bus.emit("ping", json!(2)));

        assert_eq!(*log.lock(), vec!["once", "on"]);
        assert_eq!(bus.listener_count("ping"), 0);
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn test_off_by_id_and_remove_all() {
        let bus = EventBus::default();
        let a = bus.on("a", |_| {});
        bus.on("b", |_| {});
        bus.on("b", |_| {});

        assert!(bus.off("a", a.id()));
        assert!(!bus.off("a", a.id()));
        assert_eq!(bus.event_names(), vec!["b"]);
        assert_eq!(bus.listener_count("b"), 2);

        bus.remove_all_listeners(Some("b"));
        assert_eq!(bus.listener_count("b"), 0);
    }

    #[test]
    fn test_pause_queues_and_resume_flushes_fifo() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on("n", move |payload| sink.lock().push(payload.clone()));

        bus.pause();
        assert!(!bus.emit("n", json!(1)));
        assert!(!bus.emit("n", json!(2)));
        assert!(seen.lock().is_empty());

        bus.resume();
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        assert!(!bus.is_paused());
    }

    #[test]
    fn test_history_is_capped_and_redacted() {
        let bus = EventBus::new(EventBusConfig { max_history: 2 });
        bus.emit("login", json!({ "token": "secret", "user": "alice" }));
        bus.emit("other", json!(2));
        bus.emit("login", json!({ "token": "another", "user": "bob" }));

        let history = bus.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, "other");
        assert_eq!(history[1].payload["token"], REDACTED);
        assert_eq!(history[1].payload["user"], "bob");

        assert_eq!(bus.history(Some("login")).len(), 1);
        bus.clear_history();
        assert!(bus.history(None).is_empty());
    }

    #[test]
    fn test_delivered_payload_is_not_redacted() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.on("login", move |payload| *sink.lock() = Some(payload.clone()));

        bus.emit("login", json!({ "token": "secret" }));
        assert_eq!(seen.lock().clone().unwrap()["token"], "secret");
    }

    #[test]
    fn test_reentrant_emit_from_listener() {
        let bus = EventBus::default();
        let inner_bus = bus.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        bus.on("outer", move |_| {
            inner_bus.emit("inner", json!("nested"));
        });
        bus.on("inner", move |payload| sink.lock().push(payload.clone()));

        assert!(bus.emit("outer", json!(null)));
        assert_eq!(*seen.lock(), vec![json!("nested")]);
    }

    #[test]
    fn test_destroy_stops_everything() {
        let bus = EventBus::default();
        bus.on("ping", |_| {});
        bus.emit("ping", json!(1));
        bus.destroy();

        assert!(bus.is_destroyed());
        assert!(!bus.emit("ping", json!(2)));
        assert!(bus.history(None).is_empty());
        bus.on("ping", |_| {});
        assert_eq!(bus.listener_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_with_next_payload() {
        let bus = EventBus::default();
        let emitter = bus.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            emitter.emit("ready", json!({ "ok": true }));
        });

        let payload = bus
            .wait_for("ready", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(payload, json!({ "ok": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_and_cleans_up() {
        let bus = EventBus::default();
        let err = bus
            .wait_for("never", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Timeout { timeout_ms: 50, .. }));
        assert_eq!(bus.listener_count("never"), 0);
    }
}
