//! Durable key/value abstraction

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::Result;

/// A write observed on a durable store. `value` is `None` for removals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    pub key: String,
    pub value: Option<String>,
}

/// String key/value store shared by every context of the terminal.
///
/// Implementations publish a [`StorageChange`] for every successful write so
/// other contexts holding the same store can react without polling.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub(crate) fn notify(sender: &broadcast::Sender<StorageChange>, key: &str, value: Option<&str>) {
    // no receivers is not an error
    let _ = sender.send(StorageChange {
        key: key.to_string(),
        value: value.map(str::to_string),
    });
}
