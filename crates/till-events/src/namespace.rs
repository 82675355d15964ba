//! Namespaced view over an [`EventBus`]

use serde_json::Value;
use std::time::Duration;

use crate::bus::{EventBus, HistoryEntry, ListenerId, Subscription};
use crate::Result;

/// Prefixes every event name with `"<prefix>:"` so that views with different
/// prefixes never see each other's events, while sharing one bus.
#[derive(Clone)]
pub struct EventNamespace {
    bus: EventBus,
    prefix: String,
}

impl EventNamespace {
    pub(crate) fn new(bus: EventBus, prefix: &str) -> Self {
        Self {
            bus,
            prefix: prefix.to_string(),
        }
    }

    fn scoped(&self, event: &str) -> String {
        format!("{}:{}", self.prefix, event)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.on(&self.scoped(event), callback)
    }

    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.once(&self.scoped(event), callback)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.bus.off(&self.scoped(event), id)
    }

    pub fn emit(&self, event: &str, payload: Value) -> bool {
        self.bus.emit(&self.scoped(event), payload)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.bus.listener_count(&self.scoped(event))
    }

    /// Event names within this namespace, with the prefix stripped.
    pub fn event_names(&self) -> Vec<String> {
        let marker = format!("{}:", self.prefix);
        self.bus
            .event_names()
            .into_iter()
            .filter_map(|name| name.strip_prefix(&marker).map(str::to_string))
            .collect()
    }

    /// History of this namespace only; entries keep their full scoped names.
    pub fn history(&self, event: Option<&str>) -> Vec<HistoryEntry> {
        match event {
            Some(event) => self.bus.history(Some(&self.scoped(event))),
            None => {
                let marker = format!("{}:", self.prefix);
                self.bus
                    .history(None)
                    .into_iter()
                    .filter(|entry| entry.event.starts_with(&marker))
                    .collect()
            }
        }
    }

    /// Remove listeners of one event, or of every event in the namespace.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        match event {
            Some(event) => self.bus.remove_all_listeners(Some(&self.scoped(event))),
            None => {
                for name in self.event_names() {
                    self.bus.remove_all_listeners(Some(&self.scoped(&name)));
                }
            }
        }
    }

    pub async fn wait_for(&self, event: &str, timeout: Option<Duration>) -> Result<Value> {
        self.bus.wait_for(&self.scoped(event), timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_namespaces_are_isolated() {
        let bus = EventBus::default();
        let tabs = bus.namespace("tabs");
        let network = bus.namespace("network");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tabs.on("ping", move |payload| sink.lock().push(payload.clone()));

        assert!(!network.emit("ping", json!("network")));
        assert!(tabs.emit("ping", json!("tabs")));
        assert!(bus.emit("tabs:ping", json!("raw")));

        assert_eq!(*seen.lock(), vec![json!("tabs"), json!("raw")]);
        assert_eq!(tabs.event_names(), vec!["ping"]);
        assert!(network.event_names().is_empty());
        assert_eq!(tabs.history(None).len(), 2);
        assert_eq!(network.history(Some("ping")).len(), 1);
    }

    #[test]
    fn test_remove_all_listeners_is_scoped() {
        let bus = EventBus::default();
        let tabs = bus.namespace("tabs");
        tabs.on("a", |_| {});
        tabs.on("b", |_| {});
        bus.on("a", |_| {});

        tabs.remove_all_listeners(None);
        assert_eq!(tabs.listener_count("a"), 0);
        assert_eq!(tabs.listener_count("b"), 0);
        assert_eq!(bus.listener_count("a"), 1);
    }
}
