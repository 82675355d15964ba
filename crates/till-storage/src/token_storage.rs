//! Token Storage
//!
//! Memory cache in front of a [`DurableStore`]. The cache answers every read;
//! writes go through to the durable layer except activity stamps, which are
//! flushed on a throttle.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::ValidationError;
use crate::record::{decode_record, SessionData, SessionPatch, SessionRecord, User};
use crate::store::DurableStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable key holding the serialized session record
    pub session_key: String,
    /// Lifetime applied when a saved payload carries no expiry
    pub default_lifetime_ms: i64,
    /// Minimum spacing between durable flushes of activity stamps
    pub activity_flush_interval_ms: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_key: "till.session".to_string(),
            default_lifetime_ms: 8 * 60 * 60 * 1000,
            activity_flush_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub has_session: bool,
    pub version: Option<u32>,
    pub login_at: Option<i64>,
    pub last_activity: Option<i64>,
    pub expires_at: Option<i64>,
    pub last_extension: Option<i64>,
    pub durable_bytes: usize,
}

/// What the durable layer holds under the session key.
enum DurableRead {
    Absent,
    /// Decoded record and whether it was migrated on the way in
    Record(SessionRecord, bool),
    /// Present but undecodable
    Corrupt,
    /// The store itself failed
    Unavailable,
}

struct Inner {
    cache: RwLock<Option<SessionRecord>>,
    store: Arc<dyn DurableStore>,
    clock: SharedClock,
    config: StorageConfig,
    last_flush: Mutex<i64>,
}

pub struct TokenStorage {
    inner: Arc<Inner>,
}

impl TokenStorage {
    /// Load the durable record into memory, migrating it if needed.
    pub fn new(store: Arc<dyn DurableStore>, clock: SharedClock, config: StorageConfig) -> Self {
        let storage = Self {
            inner: Arc::new(Inner {
                cache: RwLock::new(None),
                store,
                clock,
                config,
                last_flush: Mutex::new(i64::MIN),
            }),
        };

        if let DurableRead::Record(record, migrated) = storage.read_durable() {
            if migrated {
                storage.persist(&record);
            }
            tracing::debug!(user_id = %record.user.id, "Loaded session record from durable storage");
            *storage.inner.cache.write() = Some(record);
        }

        storage
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    fn read_durable(&self) -> DurableRead {
        match self.inner.store.get(&self.inner.config.session_key) {
            Ok(Some(raw)) => match decode_record(&raw) {
                Some((record, migrated)) => DurableRead::Record(record, migrated),
                None => DurableRead::Corrupt,
            },
            Ok(None) => DurableRead::Absent,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read durable session record");
                DurableRead::Unavailable
            }
        }
    }

    fn persist(&self, record: &SessionRecord) -> bool {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize session record");
                return false;
            }
        };

        match self.inner.store.set(&self.inner.config.session_key, &payload) {
            Ok(()) => {
                *self.inner.last_flush.lock() = self.now();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist session record");
                false
            }
        }
    }

    /// Validate and store a new session. Returns false, leaving any current
    /// session untouched, when the payload is malformed or cannot be written.
    pub fn save(&self, data: SessionData) -> bool {
        let record = match data.into_record(self.now(), self.inner.config.default_lifetime_ms) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(reason = %e, "Rejected session payload");
                return false;
            }
        };

        let mut cache = self.inner.cache.write();
        if !self.persist(&record) {
            return false;
        }
        tracing::info!(user_id = %record.user.id, expires_at = record.expires_at, "Saved session");
        *cache = Some(record);
        true
    }

    pub fn get(&self) -> Option<SessionRecord> {
        self.inner.cache.read().clone()
    }

    pub fn has_session(&self) -> bool {
        self.inner.cache.read().is_some()
    }

    /// Look up a value by dot path over the record's JSON form,
    /// e.g. `"user.name"` or `"limits.discount"`.
    pub fn get_field(&self, path: &str) -> Option<Value> {
        let record = self.get()?;
        let mut current = serde_json::to_value(record).ok()?;

        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut items) => {
                    let index: usize = segment.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn token(&self) -> Option<String> {
        self.inner.cache.read().as_ref().map(|r| r.token.clone())
    }

    pub fn user(&self) -> Option<User> {
        self.inner.cache.read().as_ref().map(|r| r.user.clone())
    }

    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionRecord) -> std::result::Result<(), ValidationError>,
    {
        let mut cache = self.inner.cache.write();
        let Some(current) = cache.as_ref() else {
            tracing::debug!("Ignoring session mutation without a session");
            return false;
        };

        let mut next = current.clone();
        if let Err(e) = f(&mut next) {
            tracing::warn!(reason = %e, "Rejected session update");
            return false;
        }
        // memory only moves once the durable write has landed
        if !self.persist(&next) {
            return false;
        }
        *cache = Some(next);
        true
    }

    /// Shallow-merge `patch` into the current session and persist it.
    pub fn update(&self, patch: SessionPatch) -> bool {
        self.mutate(|record| patch.apply(record))
    }

    /// Push `expires_at` to at least `now + delta_ms` and stamp the extension.
    pub fn extend_expiration(&self, delta_ms: i64) -> bool {
        let now = self.now();
        self.mutate(|record| {
            record.expires_at = record.expires_at.max(now + delta_ms);
            record.last_extension = Some(now);
            Ok(())
        })
    }

    /// Stamp activity in memory. The durable copy is refreshed at most once
    /// per `activity_flush_interval_ms`.
    pub fn record_activity(&self) {
        let now = self.now();
        {
            let mut cache = self.inner.cache.write();
            let Some(record) = cache.as_mut() else {
                return;
            };
            record.last_activity = now;
        }

        let due = now.saturating_sub(*self.inner.last_flush.lock())
            >= self.inner.config.activity_flush_interval_ms;
        if due {
            self.flush();
        }
    }

    /// Write the cached record through, keeping any later expiry that another
    /// context stored for the same token. Nothing is written when the durable
    /// layer cannot be read or no longer holds a session.
    pub fn flush(&self) -> bool {
        let durable = match self.read_durable() {
            DurableRead::Record(record, _) => Some(record),
            DurableRead::Corrupt => None,
            DurableRead::Absent => {
                tracing::debug!("Skipping flush of a session removed from durable storage");
                return false;
            }
            DurableRead::Unavailable => return false,
        };

        let merged = {
            let mut cache = self.inner.cache.write();
            let Some(record) = cache.as_mut() else {
                return false;
            };
            if let Some(durable) = durable.filter(|d| d.token == record.token) {
                if durable.expires_at > record.expires_at {
                    record.expires_at = durable.expires_at;
                    record.last_extension = durable.last_extension;
                }
                record.last_activity = record.last_activity.max(durable.last_activity);
            }
            record.clone()
        };

        self.persist(&merged)
    }

    /// True when there is no session or its expiry has passed.
    pub fn is_expired(&self) -> bool {
        let now = self.now();
        self.inner
            .cache
            .read()
            .as_ref()
            .map_or(true, |r| r.is_expired_at(now))
    }

    /// Milliseconds until expiry; negative once expired, 0 without a session.
    pub fn time_until_expiry(&self) -> i64 {
        let now = self.now();
        self.inner
            .cache
            .read()
            .as_ref()
            .map_or(0, |r| r.expires_at - now)
    }

    pub fn clear(&self) {
        *self.inner.cache.write() = None;
        if let Err(e) = self.inner.store.remove(&self.inner.config.session_key) {
            tracing::warn!(error = %e, "Failed to remove durable session record");
        }
        tracing::info!("Cleared session storage");
    }

    /// Reconcile memory with the durable layer. The most recently active
    /// record wins; a record removed elsewhere clears the cache. A store that
    /// fails to read, or holds an undecodable value, leaves the cache as is.
    /// Returns whether the cached record changed.
    pub fn sync_from_storage(&self) -> bool {
        let durable = self.read_durable();
        let mut cache = self.inner.cache.write();

        let changed = match durable {
            DurableRead::Absent => cache.take().is_some(),
            DurableRead::Corrupt | DurableRead::Unavailable => false,
            DurableRead::Record(record, _) => {
                let adopt = match cache.as_ref() {
                    None => true,
                    Some(current) => {
                        record != *current && record.freshness() >= current.freshness()
                    }
                };
                if adopt {
                    *cache = Some(record);
                }
                adopt
            }
        };

        if changed {
            tracing::debug!(has_session = cache.is_some(), "Synced session from durable storage");
        }
        changed
    }

    pub fn stats(&self) -> StorageStats {
        let durable_bytes = self
            .inner
            .store
            .get(&self.inner.config.session_key)
            .ok()
            .flatten()
            .map_or(0, |raw| raw.len());

        let cache = self.inner.cache.read();
        let record = cache.as_ref();
        StorageStats {
            has_session: record.is_some(),
            version: record.map(|r| r.version),
            login_at: record.map(|r| r.login_at),
            last_activity: record.map(|r| r.last_activity),
            expires_at: record.map(|r| r.expires_at),
            last_extension: record.and_then(|r| r.last_extension),
            durable_bytes,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }
}

impl Clone for TokenStorage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::record::CURRENT_RECORD_VERSION;
    use crate::error::StorageError;
    use crate::store::{DurableStore, StorageChange};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    const NOW: i64 = 1_700_000_000_000;

    /// Memory store whose reads or writes can be switched to fail like a
    /// locked database.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: Arc<AtomicBool>,
        fail_writes: Arc<AtomicBool>,
    }

    fn busy() -> StorageError {
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    impl DurableStore for FlakyStore {
        fn get(&self, key: &str) -> crate::Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(busy());
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> crate::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(busy());
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> crate::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(busy());
            }
            self.inner.remove(key)
        }

        fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
            self.inner.subscribe()
        }
    }

    fn flaky_setup() -> (TokenStorage, FlakyStore, Arc<ManualClock>) {
        let store = FlakyStore::default();
        let clock = Arc::new(ManualClock::new(NOW));
        let storage = TokenStorage::new(
            Arc::new(store.clone()),
            clock.clone(),
            StorageConfig::default(),
        );
        (storage, store, clock)
    }

    fn setup() -> (TokenStorage, MemoryStore, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let storage = TokenStorage::new(
            Arc::new(store.clone()),
            clock.clone(),
            StorageConfig::default(),
        );
        (storage, store, clock)
    }

    fn full_record() -> SessionRecord {
        SessionRecord {
            user: User::new("42", "Ana").with_role("manager"),
            token: "42|s3cr3t".to_string(),
            permissions: BTreeSet::from(["refund".to_string(), "void".to_string()]),
            limits: [("discount".to_string(), 20.0)].into_iter().collect(),
            interface_access: [("reports".to_string(), true)].into_iter().collect(),
            login_at: NOW,
            last_activity: NOW,
            expires_at: NOW + 60_000,
            last_extension: None,
            version: CURRENT_RECORD_VERSION,
        }
    }

    #[test]
    fn test_save_then_get_round_trips() {
        let (storage, store, _) = setup();
        let record = full_record();

        assert!(storage.save(record.clone().into()));
        assert_eq!(storage.get(), Some(record));
        assert!(store.get("till.session").unwrap().is_some());
    }

    #[test]
    fn test_returned_records_are_copies() {
        let (storage, _, _) = setup();
        assert!(storage.save(full_record().into()));

        let mut copy = storage.get().unwrap();
        copy.token = "1|changed".to_string();
        copy.permissions.clear();
        copy.user.name = "Mallory".to_string();

        let fresh = storage.get().unwrap();
        assert_eq!(fresh.token, "42|s3cr3t");
        assert_eq!(fresh.permissions.len(), 2);
        assert_eq!(fresh.user.name, "Ana");
    }

    #[test]
    fn test_invalid_save_does_not_mutate() {
        let (storage, _, _) = setup();
        assert!(storage.save(full_record().into()));

        let mut bad = SessionData::from(full_record());
        bad.token = Some("no-separator".to_string());
        assert!(!storage.save(bad));

        let mut no_user = SessionData::from(full_record());
        no_user.user = None;
        assert!(!storage.save(no_user));

        assert_eq!(storage.token().as_deref(), Some("42|s3cr3t"));
    }

    #[test]
    fn test_field_access_by_dot_path() {
        let (storage, _, _) = setup();
        assert_eq!(storage.get_field("user.name"), None);
        storage.save(full_record().into());

        assert_eq!(storage.get_field("user.name"), Some(json!("Ana")));
        assert_eq!(storage.get_field("limits.discount"), Some(json!(20.0)));
        assert_eq!(storage.get_field("interfaceAccess.reports"), Some(json!(true)));
        assert_eq!(storage.get_field("permissions.1"), Some(json!("void")));
        assert_eq!(storage.get_field("user.missing"), None);
        assert_eq!(storage.get_field("token.deeper"), None);
    }

    #[test]
    fn test_expiry_boundary() {
        let (storage, _, clock) = setup();
        assert!(storage.is_expired());
        storage.save(full_record().into());

        clock.set(NOW + 60_000 - 1);
        assert!(!storage.is_expired());
        assert_eq!(storage.time_until_expiry(), 1);

        clock.set(NOW + 60_000);
        assert!(storage.is_expired());

        clock.set(NOW + 61_000);
        assert!(storage.is_expired());
        assert_eq!(storage.time_until_expiry(), -1_000);
    }

    #[test]
    fn test_update_and_extend_require_session() {
        let (storage, _, clock) = setup();
        assert!(!storage.update(SessionPatch::default()));
        assert!(!storage.extend_expiration(1_000));

        storage.save(full_record().into());
        let patch = SessionPatch {
            permissions: Some(BTreeSet::from(["open_drawer".to_string()])),
            ..SessionPatch::default()
        };
        assert!(storage.update(patch));
        assert!(storage.get().unwrap().has_permission("open_drawer"));

        clock.advance(10_000);
        assert!(storage.extend_expiration(120_000));
        let record = storage.get().unwrap();
        assert_eq!(record.expires_at, NOW + 10_000 + 120_000);
        assert_eq!(record.last_extension, Some(NOW + 10_000));

        // never moves expiry backwards
        assert!(storage.extend_expiration(1));
        assert_eq!(storage.get().unwrap().expires_at, NOW + 130_000);
    }

    #[test]
    fn test_activity_is_flushed_on_throttle() {
        let (storage, store, clock) = setup();
        storage.save(full_record().into());

        let durable_activity = || {
            let raw = store.get("till.session").unwrap().unwrap();
            serde_json::from_str::<SessionRecord>(&raw).unwrap().last_activity
        };

        clock.advance(1_000);
        storage.record_activity();
        assert_eq!(storage.get().unwrap().last_activity, NOW + 1_000);
        assert_eq!(durable_activity(), NOW);

        clock.advance(30_000);
        storage.record_activity();
        assert_eq!(durable_activity(), NOW + 31_000);
    }

    #[test]
    fn test_clear_wipes_both_layers() {
        let (storage, store, _) = setup();
        storage.save(full_record().into());
        storage.clear();

        assert!(storage.get().is_none());
        assert!(store.get("till.session").unwrap().is_none());
    }

    #[test]
    fn test_construction_migrates_and_repersists() {
        let store = MemoryStore::new();
        store
            .set(
                "till.session",
                &json!({
                    "user": { "id": 9, "name": "Lee" },
                    "token": "9|abc",
                    "interface_access": { "pos": true },
                    "loginAt": NOW,
                    "expiresAt": NOW + 1_000
                })
                .to_string(),
            )
            .unwrap();

        let storage = TokenStorage::new(
            Arc::new(store.clone()),
            Arc::new(ManualClock::new(NOW)),
            StorageConfig::default(),
        );

        assert_eq!(storage.get().unwrap().version, CURRENT_RECORD_VERSION);
        let raw: Value = serde_json::from_str(&store.get("till.session").unwrap().unwrap()).unwrap();
        assert_eq!(raw["version"], CURRENT_RECORD_VERSION);
        assert_eq!(raw["interfaceAccess"]["pos"], true);
    }

    #[test]
    fn test_corrupt_durable_data_is_absent() {
        let store = MemoryStore::new();
        store.set("till.session", "{{{ definitely not json").unwrap();

        let storage = TokenStorage::new(
            Arc::new(store),
            Arc::new(ManualClock::new(NOW)),
            StorageConfig::default(),
        );
        assert!(storage.get().is_none());
        assert!(!storage.sync_from_storage());
    }

    #[test]
    fn test_sync_keeps_cache_when_durable_value_is_corrupt() {
        let (storage, store, _) = setup();
        storage.save(full_record().into());

        store.set("till.session", "not json").unwrap();
        assert!(!storage.sync_from_storage());
        assert_eq!(storage.token().as_deref(), Some("42|s3cr3t"));
    }

    #[test]
    fn test_read_failure_keeps_cached_session() {
        let (storage, store, clock) = flaky_setup();
        assert!(storage.save(full_record().into()));

        store.fail_reads.store(true, Ordering::SeqCst);
        assert!(!storage.sync_from_storage());
        assert_eq!(storage.token().as_deref(), Some("42|s3cr3t"));

        // flush must not overwrite what it could not read
        clock.advance(40_000);
        storage.record_activity();
        assert!(!storage.flush());

        store.fail_reads.store(false, Ordering::SeqCst);
        let raw = store.inner.get("till.session").unwrap().unwrap();
        assert_eq!(serde_json::from_str::<SessionRecord>(&raw).unwrap().last_activity, NOW);
        assert!(!storage.sync_from_storage());
        assert!(storage.has_session());
    }

    #[test]
    fn test_write_failure_is_reported_and_leaves_state() {
        let (storage, store, clock) = flaky_setup();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(!storage.save(full_record().into()));
        assert!(!storage.has_session());
        assert!(store.inner.get("till.session").unwrap().is_none());

        store.fail_writes.store(false, Ordering::SeqCst);
        assert!(storage.save(full_record().into()));

        store.fail_writes.store(true, Ordering::SeqCst);
        clock.advance(1_000);
        assert!(!storage.extend_expiration(500_000));
        let patch = SessionPatch {
            permissions: Some(BTreeSet::from(["open_drawer".to_string()])),
            ..SessionPatch::default()
        };
        assert!(!storage.update(patch));

        let record = storage.get().unwrap();
        assert_eq!(record, full_record());
        assert_eq!(record.last_extension, None);
        assert!(!record.has_permission("open_drawer"));
    }

    #[test]
    fn test_flush_does_not_resurrect_removed_record() {
        let (storage, store, _) = setup();
        storage.save(full_record().into());

        store.remove("till.session").unwrap();
        assert!(!storage.flush());
        assert!(store.get("till.session").unwrap().is_none());
    }

    #[test]
    fn test_sync_prefers_most_recent_activity() {
        let (first, store, clock) = setup();
        let second = TokenStorage::new(
            Arc::new(store.clone()),
            clock.clone(),
            StorageConfig::default(),
        );

        first.save(full_record().into());
        assert!(second.sync_from_storage());
        assert_eq!(second.token().as_deref(), Some("42|s3cr3t"));
        assert!(!second.sync_from_storage());

        // second tab is more recently active in memory than the durable copy
        clock.advance(5_000);
        second.record_activity();
        assert!(!second.sync_from_storage());

        // another login lands later in durable storage
        clock.advance(5_000);
        let mut newer = full_record();
        newer.token = "43|other".to_string();
        newer.login_at = NOW + 10_000;
        newer.last_activity = NOW + 10_000;
        newer.expires_at = NOW + 100_000;
        first.save(newer.into());
        assert!(second.sync_from_storage());
        assert_eq!(second.token().as_deref(), Some("43|other"));
    }

    #[test]
    fn test_sync_clears_when_removed_externally() {
        let (storage, store, _) = setup();
        storage.save(full_record().into());

        store.remove("till.session").unwrap();
        assert!(storage.sync_from_storage());
        assert!(!storage.has_session());
    }

    #[test]
    fn test_flush_keeps_extension_from_other_context() {
        let (first, store, clock) = setup();
        first.save(full_record().into());
        let second = TokenStorage::new(Arc::new(store), clock.clone(), StorageConfig::default());

        clock.advance(1_000);
        assert!(second.extend_expiration(500_000));

        clock.advance(40_000);
        first.record_activity();

        let record = first.get().unwrap();
        assert_eq!(record.expires_at, NOW + 501_000);
        assert_eq!(record.last_activity, NOW + 41_000);
    }

    #[test]
    fn test_stats() {
        let (storage, _, _) = setup();
        assert!(!storage.stats().has_session);

        storage.save(full_record().into());
        let stats = storage.stats();
        assert!(stats.has_session);
        assert_eq!(stats.expires_at, Some(NOW + 60_000));
        assert!(stats.durable_bytes > 0);
    }
}
