//! Cross-tab transports
//!
//! Two interchangeable backends carry [`TabMessage`]s between tabs:
//! a [`BroadcastHub`] shared in-process, or a bounded message log kept under
//! one durable-store key that every tab polls.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use till_storage::DurableStore;

use crate::message::TabMessage;
use crate::Result;

const HUB_CAPACITY: usize = 256;

/// Broadcast primitive shared by every same-origin context in the process.
#[derive(Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<TabMessage>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(HUB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: TabMessage) {
        // nobody listening is fine
        let _ = self.sender.send(message);
    }

    /// Number of attached receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Backend selected when a tab is constructed.
#[derive(Clone)]
pub enum Transport {
    Channel(BroadcastHub),
    /// Fallback for hosts without a broadcast primitive
    Storage(Arc<dyn DurableStore>),
}

impl Transport {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Transport::Storage(_))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Channel(hub) => f.debug_tuple("Channel").field(hub).finish(),
            Transport::Storage(_) => f.write_str("Storage"),
        }
    }
}

/// Message log kept as a JSON array under a single durable key.
pub(crate) struct StorageLog {
    store: Arc<dyn DurableStore>,
    key: String,
    ttl_ms: i64,
    max_entries: usize,
    /// Message id -> send timestamp
    seen: Mutex<HashMap<String, i64>>,
}

impl StorageLog {
    pub(crate) fn new(
        store: Arc<dyn DurableStore>,
        key: String,
        ttl_ms: i64,
        max_entries: usize,
    ) -> Self {
        Self {
            store,
            key,
            ttl_ms,
            max_entries: max_entries.max(1),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    fn read(&self) -> Vec<TabMessage> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read tab sync log");
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(key = %self.key, error = %e, "Discarding corrupted tab sync log");
            Vec::new()
        })
    }

    /// Append a message, dropping entries past their TTL and the oldest
    /// entries beyond the size bound.
    pub(crate) fn append(&self, message: &TabMessage, now_ms: i64) -> Result<()> {
        let cutoff = now_ms.saturating_sub(self.ttl_ms);
        let mut entries = self.read();
        entries.retain(|entry| entry.timestamp >= cutoff);
        entries.push(message.clone());

        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }

        self.seen
            .lock()
            .insert(message.id.clone(), message.timestamp);

        let raw = serde_json::to_string(&entries)?;
        self.store.set(&self.key, &raw)?;
        Ok(())
    }

    /// Messages from other tabs not delivered yet, oldest first.
    pub(crate) fn take_unseen(&self, own_id: &str, now_ms: i64) -> Vec<TabMessage> {
        let entries = self.read();
        let cutoff = now_ms.saturating_sub(self.ttl_ms);

        let mut seen = self.seen.lock();
        seen.retain(|_, timestamp| *timestamp >= cutoff);

        entries
            .into_iter()
            .filter(|entry| entry.from != own_id && entry.timestamp >= cutoff)
            .filter(|entry| seen.insert(entry.id.clone(), entry.timestamp).is_none())
            .collect()
    }

    /// Mark everything already in the log as delivered, returning the
    /// presence messages younger than `fresh_ms`. Called once on startup so a
    /// new tab learns about its peers without replaying old broadcasts.
    pub(crate) fn prime(&self, own_id: &str, now_ms: i64, fresh_ms: i64) -> Vec<TabMessage> {
        let cutoff = now_ms.saturating_sub(fresh_ms);
        self.take_unseen(own_id, now_ms)
            .into_iter()
            .filter(|entry| entry.kind.is_presence() && entry.timestamp >= cutoff)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}
