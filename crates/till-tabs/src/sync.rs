//! Tab Sync
//!
//! Each [`TabSync`] owns a heartbeat timer, a settle timer and a receive loop,
//! all tokio tasks aborted on [`TabSync::destroy`] or when the last handle is
//! dropped. The tasks hold only weak references back to the tab.
//!
//! Election: after the settle window, the leader is the live tab with the most
//! recent leadership claim, or failing any claim, the smallest tab id. A peer
//! is live while its last message is younger than the heartbeat timeout.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use till_events::{EventBus, EventBusConfig, Subscription};
use till_storage::{SharedClock, StorageChange};

use crate::error::TabSyncError;
use crate::event::TabEvent;
use crate::message::{MessageKind, TabMessage};
use crate::transport::{BroadcastHub, StorageLog, Transport};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabSyncConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is considered gone
    pub heartbeat_timeout_ms: u64,
    /// Delay after construction before the first election
    pub settle_window_ms: u64,
    /// Storage fallback only
    pub poll_interval_ms: u64,
    /// Storage fallback only: age after which log entries are pruned
    pub log_ttl_ms: u64,
    /// Storage fallback only
    pub max_log_entries: usize,
    /// Storage fallback only
    pub storage_key: String,
}

impl Default for TabSyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 6_000,
            settle_window_ms: 2_500,
            poll_interval_ms: 500,
            log_ttl_ms: 10_000,
            max_log_entries: 50,
            storage_key: "till.tab_sync".to_string(),
        }
    }
}

impl TabSyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSyncStatus {
    pub tab_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub using_fallback: bool,
    /// Live tabs, this one included
    pub known_tabs: usize,
}

struct Peer {
    last_seen: Instant,
    claimed_at: Option<i64>,
}

#[derive(Default)]
struct Election {
    peers: HashMap<String, Peer>,
    own_claim: Option<i64>,
    settled: bool,
    leader_id: Option<String>,
}

impl Election {
    fn prune(&mut self, timeout: Duration) {
        self.peers.retain(|_, peer| peer.last_seen.elapsed() < timeout);
    }

    /// Latest claim first, then smallest id.
    fn winner<'a>(&'a self, own_id: &'a str) -> &'a str {
        let own = (own_id, self.own_claim);
        self.peers
            .iter()
            .map(|(id, peer)| (id.as_str(), peer.claimed_at))
            .chain(std::iter::once(own))
            .min_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
            .map_or(own_id, |(id, _)| id)
    }

    fn latest_peer_claim(&self) -> Option<i64> {
        self.peers.values().filter_map(|peer| peer.claimed_at).max()
    }
}

enum Link {
    Channel(BroadcastHub),
    Storage(StorageLog),
}

struct Inner {
    tab_id: String,
    config: TabSyncConfig,
    clock: SharedClock,
    link: Link,
    bus: EventBus,
    election: Mutex<Election>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Inner {
    fn send(&self, kind: MessageKind) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TabSyncError::Destroyed);
        }
        self.send_unchecked(kind)
    }

    fn send_unchecked(&self, kind: MessageKind) -> Result<()> {
        let message = TabMessage::new(&self.tab_id, self.clock.now_ms(), kind);
        match &self.link {
            Link::Channel(hub) => {
                hub.publish(message);
                Ok(())
            }
            Link::Storage(log) => log.append(&message, self.clock.now_ms()),
        }
    }

    fn heartbeat(&self) {
        let claimed_at = self.election.lock().own_claim;
        if let Err(e) = self.send(MessageKind::Heartbeat { claimed_at }) {
            tracing::warn!(tab_id = %self.tab_id, error = %e, "Failed to send heartbeat");
        }
        self.evaluate();
    }

    fn settle(&self) {
        self.election.lock().settled = true;
        tracing::debug!(tab_id = %self.tab_id, "Tab settled, running first election");
        self.evaluate();
    }

    /// Re-run the election and announce a changed outcome.
    fn evaluate(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let leader_id = {
            let mut election = self.election.lock();
            if !election.settled {
                return;
            }
            election.prune(self.config.heartbeat_timeout());

            let winner = election.winner(&self.tab_id).to_string();
            if election.leader_id.as_deref() == Some(winner.as_str()) {
                return;
            }
            election.leader_id = Some(winner.clone());
            winner
        };

        let is_leader = leader_id == self.tab_id;
        if is_leader {
            tracing::info!(tab_id = %self.tab_id, "Tab became leader");
        } else {
            tracing::debug!(tab_id = %self.tab_id, leader_id = %leader_id, "Leader changed");
        }

        self.bus.emit(
            TabEvent::Leader.as_str(),
            json!({ "leaderId": leader_id, "isLeader": is_leader }),
        );
    }

    fn receive(&self, message: TabMessage) {
        if message.from == self.tab_id || self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let from = message.from;
        {
            let mut election = self.election.lock();
            match &message.kind {
                MessageKind::Leaving => {
                    election.peers.remove(&from);
                }
                kind => {
                    let peer = election.peers.entry(from.clone()).or_insert(Peer {
                        last_seen: Instant::now(),
                        claimed_at: None,
                    });
                    peer.last_seen = Instant::now();
                    match kind {
                        MessageKind::Heartbeat { claimed_at } => peer.claimed_at = *claimed_at,
                        MessageKind::Claim { claimed_at } => peer.claimed_at = Some(*claimed_at),
                        _ => {}
                    }
                }
            }
        }

        let (event, payload) = match message.kind {
            MessageKind::Heartbeat { .. } | MessageKind::Claim { .. } | MessageKind::Leaving => {
                self.evaluate();
                return;
            }
            MessageKind::SessionUpdate(data) => {
                (TabEvent::SessionUpdate, json!({ "from": from, "data": data }))
            }
            MessageKind::Logout { reason } => {
                (TabEvent::Logout, json!({ "from": from, "reason": reason }))
            }
            MessageKind::Activity => (
                TabEvent::Activity,
                json!({ "from": from, "timestamp": message.timestamp }),
            ),
            MessageKind::TokenRefresh(data) => {
                (TabEvent::TokenRefresh, json!({ "from": from, "data": data }))
            }
        };

        tracing::debug!(tab_id = %self.tab_id, from = %from, event = %event, "Received tab broadcast");
        self.bus.emit(event.as_str(), payload);
    }

    fn poll_storage(&self) {
        if let Link::Storage(log) = &self.link {
            for message in log.take_unseen(&self.tab_id, self.clock.now_ms()) {
                self.receive(message);
            }
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Handle to this context's participation in cross-tab coordination.
pub struct TabSync {
    inner: Arc<Inner>,
}

impl TabSync {
    /// Join the tab group reachable through `transport`. Must be called inside
    /// a tokio runtime.
    pub fn new(transport: Transport, clock: SharedClock, config: TabSyncConfig) -> Self {
        let tab_id = Uuid::new_v4().to_string();
        let using_fallback = transport.is_fallback();

        let link = match transport {
            Transport::Channel(hub) => Link::Channel(hub),
            Transport::Storage(store) => Link::Storage(StorageLog::new(
                store,
                config.storage_key.clone(),
                config.log_ttl_ms as i64,
                config.max_log_entries,
            )),
        };

        let inner = Arc::new(Inner {
            tab_id,
            config,
            clock,
            link,
            bus: EventBus::new(EventBusConfig::default()),
            election: Mutex::new(Election::default()),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });

        let receiver = match &inner.link {
            Link::Channel(hub) => spawn_channel_loop(Arc::downgrade(&inner), hub.subscribe()),
            Link::Storage(log) => {
                let fresh = log.prime(
                    &inner.tab_id,
                    inner.clock.now_ms(),
                    inner.config.heartbeat_timeout_ms as i64,
                );
                for message in fresh {
                    inner.receive(message);
                }
                spawn_storage_loop(
                    Arc::downgrade(&inner),
                    log.store().subscribe(),
                    log.key().to_string(),
                    inner.config.poll_interval(),
                )
            }
        };

        let heartbeat =
            spawn_heartbeat_loop(Arc::downgrade(&inner), inner.config.heartbeat_interval());
        let settle = {
            let weak = Arc::downgrade(&inner);
            let window = inner.config.settle_window();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(inner) = weak.upgrade() {
                    inner.settle();
                }
            })
        };

        inner.tasks.lock().extend([receiver, heartbeat, settle]);

        tracing::info!(tab_id = %inner.tab_id, using_fallback, "Tab sync started");

        Self { inner }
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id().as_deref() == Some(self.inner.tab_id.as_str())
    }

    /// `None` until the settle window has passed.
    pub fn leader_id(&self) -> Option<String> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.election.lock().leader_id.clone()
    }

    /// Claim leadership now. The claim holds until a later claim arrives or
    /// this tab stops sending heartbeats.
    pub fn force_leadership(&self) -> Result<()> {
        let claimed_at = {
            let mut election = self.inner.election.lock();
            let now = self.inner.clock.now_ms();
            let claimed_at = match election.latest_peer_claim() {
                Some(latest) if latest >= now => latest + 1,
                _ => now,
            };
            election.own_claim = Some(claimed_at);
            election.settled = true;
            claimed_at
        };

        self.inner.send(MessageKind::Claim { claimed_at })?;
        tracing::info!(tab_id = %self.inner.tab_id, "Leadership claimed");
        self.inner.evaluate();
        Ok(())
    }

    pub fn broadcast_session_update(&self, data: Value) -> Result<()> {
        self.inner.send(MessageKind::SessionUpdate(data))
    }

    pub fn broadcast_logout(&self, reason: &str) -> Result<()> {
        self.inner.send(MessageKind::Logout {
            reason: reason.to_string(),
        })
    }

    pub fn broadcast_activity(&self) -> Result<()> {
        self.inner.send(MessageKind::Activity)
    }

    pub fn broadcast_token_refresh(&self, data: Value) -> Result<()> {
        self.inner.send(MessageKind::TokenRefresh(data))
    }

    /// Listen for `event`. Handlers run on the receive loop, in subscription
    /// order; a panicking handler does not affect the others.
    pub fn on<F>(&self, event: TabEvent, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.on(event.as_str(), handler)
    }

    pub fn status(&self) -> TabSyncStatus {
        let live_peers = {
            let mut election = self.inner.election.lock();
            election.prune(self.inner.config.heartbeat_timeout());
            election.peers.len()
        };
        let leader_id = self.leader_id();

        TabSyncStatus {
            tab_id: self.inner.tab_id.clone(),
            is_leader: leader_id.as_deref() == Some(self.inner.tab_id.as_str()),
            leader_id,
            using_fallback: matches!(self.inner.link, Link::Storage(_)),
            known_tabs: live_peers + 1,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Leave the tab group: tell peers, stop timers, drop listeners.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.inner.send_unchecked(MessageKind::Leaving) {
            tracing::warn!(tab_id = %self.inner.tab_id, error = %e, "Failed to announce departure");
        }
        self.inner.abort_tasks();
        self.inner.election.lock().leader_id = None;
        self.inner.bus.destroy();

        tracing::info!(tab_id = %self.inner.tab_id, "Tab sync destroyed");
    }
}

impl Clone for TabSync {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for TabSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabSync")
            .field("tab_id", &self.inner.tab_id)
            .finish()
    }
}

fn spawn_heartbeat_loop(weak: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.heartbeat();
        }
    })
}

fn spawn_channel_loop(weak: Weak<Inner>, mut receiver: Receiver<TabMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match receiver.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Tab channel lagged, messages dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.receive(message);
        }
    })
}

fn spawn_storage_loop(
    weak: Weak<Inner>,
    changes: Receiver<StorageChange>,
    key: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = Some(changes);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                woke = next_change(&mut changes, &key) => {
                    if !woke {
                        continue;
                    }
                }
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.poll_storage();
        }
    })
}

/// Resolves true when `key` may have changed. Never resolves once the store's
/// change feed has closed; polling continues alone.
async fn next_change(changes: &mut Option<Receiver<StorageChange>>, key: &str) -> bool {
    let Some(receiver) = changes.as_mut() else {
        return std::future::pending().await;
    };

    match receiver.recv().await {
        Ok(change) => change.key == key,
        Err(RecvError::Lagged(_)) => true,
        Err(RecvError::Closed) => {
            *changes = None;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use till_storage::{DurableStore, MemoryStore, SystemClock};

    fn clock() -> SharedClock {
        Arc::new(SystemClock)
    }

    fn spawn_tabs(count: usize, transport: &Transport) -> Vec<TabSync> {
        (0..count)
            .map(|_| TabSync::new(transport.clone(), clock(), TabSyncConfig::default()))
            .collect()
    }

    async fn settle() {
        let config = TabSyncConfig::default();
        tokio::time::sleep(config.settle_window() + config.heartbeat_interval()).await;
    }

    fn assert_single_leader(tabs: &[TabSync]) -> String {
        let leaders: Vec<&TabSync> = tabs.iter().filter(|tab| tab.is_leader()).collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader");

        let leader_id = leaders[0].tab_id().to_string();
        for tab in tabs {
            assert_eq!(tab.leader_id().as_deref(), Some(leader_id.as_str()));
        }
        leader_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_over_channel() {
        let tabs = spawn_tabs(5, &Transport::Channel(BroadcastHub::new()));
        assert!(tabs.iter().all(|tab| tab.leader_id().is_none()));

        settle().await;
        let leader_id = assert_single_leader(&tabs);

        let smallest = tabs.iter().map(|tab| tab.tab_id()).min().unwrap();
        assert_eq!(leader_id, smallest);
        assert_eq!(tabs[0].status().known_tabs, 5);
        assert!(!tabs[0].status().using_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_over_storage_fallback() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let tabs = spawn_tabs(4, &Transport::Storage(store));

        settle().await;
        assert_single_leader(&tabs);
        assert!(tabs.iter().all(|tab| tab.status().using_fallback));
        assert_eq!(tabs[1].status().known_tabs, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_others_not_sender() {
        let tabs = spawn_tabs(3, &Transport::Channel(BroadcastHub::new()));
        let received = Arc::new(Mutex::new(Vec::new()));

        for (index, tab) in tabs.iter().enumerate() {
            let received = Arc::clone(&received);
            tab.on(TabEvent::SessionUpdate, move |payload| {
                received.lock().push((index, payload["data"]["user"].clone()));
            });
        }

        tabs[0]
            .broadcast_session_update(json!({ "user": { "id": "42" } }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut received = received.lock().clone();
        received.sort_by_key(|(index, _)| *index);
        assert_eq!(
            received,
            vec![(1, json!({ "id": "42" })), (2, json!({ "id": "42" }))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_over_storage_fallback() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let tabs = spawn_tabs(2, &Transport::Storage(Arc::clone(&store)));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = Arc::clone(&reasons);
            tabs[1].on(TabEvent::Logout, move |payload| {
                reasons.lock().push(payload["reason"].clone());
            });
        }

        tabs[0].broadcast_logout("user").unwrap();
        tokio::time::sleep(TabSyncConfig::default().poll_interval() * 2).await;

        assert_eq!(*reasons.lock(), vec![json!("user")]);
        let raw = store.get("till.tab_sync").unwrap().unwrap();
        let log: Vec<TabMessage> = serde_json::from_str(&raw).unwrap();
        assert!(log.len() <= TabSyncConfig::default().max_log_entries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_block_others() {
        let tabs = spawn_tabs(2, &Transport::Channel(BroadcastHub::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        tabs[1].on(TabEvent::Activity, |_| panic!("handler failure"));
        {
            let hits = Arc::clone(&hits);
            tabs[1].on(TabEvent::Activity, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        tabs[0].broadcast_activity().unwrap();
        tabs[0].broadcast_activity().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_leadership_overrides_id_order() {
        let tabs = spawn_tabs(3, &Transport::Channel(BroadcastHub::new()));
        settle().await;
        let natural = assert_single_leader(&tabs);

        let challenger = tabs
            .iter()
            .find(|tab| tab.tab_id() != natural)
            .unwrap()
            .clone();
        challenger.force_leadership().unwrap();
        assert!(challenger.is_leader());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(assert_single_leader(&tabs), challenger.tab_id());

        // the claim survives ordinary heartbeats
        tokio::time::sleep(TabSyncConfig::default().heartbeat_timeout() * 2).await;
        assert_eq!(assert_single_leader(&tabs), challenger.tab_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_leader_is_replaced_without_waiting_for_timeout() {
        let mut tabs = spawn_tabs(3, &Transport::Channel(BroadcastHub::new()));
        settle().await;
        let leader_id = assert_single_leader(&tabs);

        let position = tabs.iter().position(|tab| tab.tab_id() == leader_id).unwrap();
        let leader = tabs.remove(position);
        leader.destroy();
        assert!(!leader.is_leader());
        assert!(matches!(
            leader.broadcast_activity(),
            Err(TabSyncError::Destroyed)
        ));

        // well under the heartbeat timeout, one heartbeat round re-elects
        tokio::time::sleep(TabSyncConfig::default().heartbeat_interval() + Duration::from_millis(10)).await;
        let next = assert_single_leader(&tabs);
        assert_ne!(next, leader_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_tab_expires_after_timeout() {
        let mut tabs = spawn_tabs(3, &Transport::Channel(BroadcastHub::new()));
        settle().await;
        let leader_id = assert_single_leader(&tabs);

        // dropping the last handle stops the tab without a departure message
        let position = tabs.iter().position(|tab| tab.tab_id() == leader_id).unwrap();
        drop(tabs.remove(position));

        let config = TabSyncConfig::default();
        tokio::time::sleep(config.heartbeat_timeout() + config.heartbeat_interval()).await;
        let next = assert_single_leader(&tabs);
        assert_ne!(next, leader_id);
        assert_eq!(tabs[0].status().known_tabs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_event_is_emitted() {
        let hub = BroadcastHub::new();
        let tab = TabSync::new(Transport::Channel(hub), clock(), TabSyncConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            tab.on(TabEvent::Leader, move |payload| events.lock().push(payload.clone()));
        }

        settle().await;
        assert_eq!(
            *events.lock(),
            vec![json!({ "leaderId": tab.tab_id(), "isLeader": true })]
        );
    }
}
