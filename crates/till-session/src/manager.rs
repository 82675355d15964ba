//! Session Manager
//!
//! Drives the session state machine on top of [`TokenStorage`]. Every server
//! call goes through [`NetworkRetry`]; outcomes are reported as
//! [`SessionEvent`]s on the session bus rather than as errors.
//!
//! Network trouble while verifying a stored session keeps the session (fail
//! open). Only an explicit rejection from the server invalidates it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use till_events::{EventBus, Subscription};
use till_network::{ExecuteOptions, NetworkRetry, NetworkStatus};
use till_storage::{
    SessionData, SessionPatch, SessionRecord, SharedClock, StorageStats, TokenStorage, User,
};
use till_tabs::{TabEvent, TabSync, TabSyncStatus};

use crate::api::{AuthApi, SessionCheck};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::{SessionEvent, SessionSubscription};
use crate::state::SessionState;
use crate::Result;

const LOGIN_KEY: &str = "login";
const CHECK_KEY: &str = "session-check";
const LOGOUT_KEY: &str = "logout";

/// Dedupe key for one request kind and input, so only identical requests
/// share a flight. The input is hashed to keep secrets out of debug logs.
fn request_key(kind: &str, input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{kind}:{:016x}", hasher.finish())
}

/// Invoked alongside every `EXPIRING_SOON` event with `(critical, remaining_ms)`.
pub type WarningCallback = Arc<dyn Fn(bool, i64) + Send + Sync>;

/// Collaborators a [`SessionManager`] is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub storage: TokenStorage,
    pub retry: NetworkRetry,
    pub api: Arc<dyn AuthApi>,
    /// `None` when this context runs without cross-tab coordination
    pub tabs: Option<TabSync>,
    pub bus: EventBus,
    pub clock: SharedClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutOptions {
    /// Tell the server to revoke the token (best effort, single attempt)
    pub notify_server: bool,
    /// Reason reported in the `CLEARED` event and to other tabs
    pub reason: String,
}

impl Default for LogoutOptions {
    fn default() -> Self {
        Self {
            notify_server: true,
            reason: "logout".to_string(),
        }
    }
}

impl LogoutOptions {
    pub fn local_only() -> Self {
        Self {
            notify_server: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_active: bool,
    pub time_until_expiry: i64,
    pub storage: StorageStats,
    pub network: NetworkStatus,
    pub tabs: Option<TabSyncStatus>,
}

#[derive(Default)]
struct WarningFlags {
    warned: bool,
    critical: bool,
}

struct Inner {
    storage: TokenStorage,
    retry: NetworkRetry,
    api: Arc<dyn AuthApi>,
    tabs: Option<TabSync>,
    bus: EventBus,
    clock: SharedClock,
    config: SessionConfig,
    state: Mutex<SessionState>,
    warnings: Mutex<WarningFlags>,
    warning_callback: Mutex<Option<WarningCallback>>,
    last_activity_broadcast: Mutex<i64>,
    tab_subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Validate `config` and start the expiry watch, the extension timer and
    /// the cross-tab listeners. Must be called inside a tokio runtime.
    pub fn new(context: SessionContext, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let SessionContext {
            storage,
            retry,
            api,
            tabs,
            bus,
            clock,
        } = context;

        let manager = Self {
            inner: Arc::new(Inner {
                storage,
                retry,
                api,
                tabs,
                bus,
                clock,
                config,
                state: Mutex::new(SessionState::None),
                warnings: Mutex::new(WarningFlags::default()),
                warning_callback: Mutex::new(None),
                last_activity_broadcast: Mutex::new(i64::MIN),
                tab_subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        };

        manager.start_timers();
        manager.listen_to_tabs();

        Ok(manager)
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn start_timers(&self) {
        let mut tasks = self.inner.tasks.lock();

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.expiry_check_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionManager::from_inner(inner).check_expiry();
            }
        }));

        if let Some(period) = self.inner.config.extension_interval() {
            let weak = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    SessionManager::from_inner(inner).periodic_extension().await;
                }
            }));
        }
    }

    fn listen_to_tabs(&self) {
        let Some(tabs) = &self.inner.tabs else {
            return;
        };

        let react = |weak: Weak<Inner>, event: TabEvent| {
            move |payload: &Value| {
                if let Some(inner) = weak.upgrade() {
                    SessionManager::from_inner(inner).on_tab_event(event, payload);
                }
            }
        };

        let subscriptions = [
            TabEvent::SessionUpdate,
            TabEvent::TokenRefresh,
            TabEvent::Logout,
            TabEvent::Activity,
        ]
        .into_iter()
        .map(|event| tabs.on(event, react(Arc::downgrade(&self.inner), event)))
        .collect::<Vec<_>>();

        self.inner.tab_subscriptions.lock().extend(subscriptions);
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    fn emit(&self, event: SessionEvent) {
        tracing::debug!(event = event.name(), "Session event");
        self.inner.bus.emit(event.name(), event.payload());
    }

    fn set_state(&self, to: SessionState) -> bool {
        let from = {
            let mut state = self.inner.state.lock();
            let from = *state;
            if from == to {
                return true;
            }
            if !from.can_transition_to(to) {
                tracing::warn!(from = %from, to = %to, "Ignoring invalid session state transition");
                return false;
            }
            *state = to;
            from
        };

        tracing::info!(from = %from, session_state = %to, "Session state changed");
        self.emit(SessionEvent::StateChange { from, to });
        true
    }

    fn reset_warnings(&self) {
        *self.inner.warnings.lock() = WarningFlags::default();
    }

    fn broadcast<F>(&self, what: &str, send: F)
    where
        F: FnOnce(&TabSync) -> till_tabs::Result<()>,
    {
        if let Some(tabs) = &self.inner.tabs {
            if let Err(e) = send(tabs) {
                tracing::warn!(broadcast = what, error = %e, "Tab broadcast failed");
            }
        }
    }

    fn expires_at(&self) -> i64 {
        self.inner
            .storage
            .get()
            .map_or(0, |record| record.expires_at)
    }

    /// Store a fresh session from a login response. Returns false, leaving the
    /// current state untouched, when the payload is malformed or the durable
    /// write fails.
    pub fn create_session(&self, data: SessionData) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let now = self.now();
        let data = SessionData {
            login_at: Some(now),
            last_activity: Some(now),
            expires_at: Some(now.saturating_add(self.inner.config.lifetime_ms())),
            last_extension: None,
            ..data
        };

        if !self.inner.storage.save(data) {
            return false;
        }
        let Some(record) = self.inner.storage.get() else {
            return false;
        };

        self.reset_warnings();
        self.set_state(SessionState::Active);
        tracing::info!(user_id = %record.user.id, "Session created");
        self.emit(SessionEvent::Created {
            user_id: record.user.id.clone(),
            expires_at: record.expires_at,
        });

        self.broadcast("session update", |tabs| {
            tabs.broadcast_session_update(json!({
                "userId": record.user.id,
                "expiresAt": record.expires_at,
            }))
        });
        true
    }

    /// Authenticate with the server and store the resulting session.
    pub async fn login(&self, credentials: Value) -> Result<SessionRecord> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }

        let api = Arc::clone(&self.inner.api);
        let key = request_key(LOGIN_KEY, &credentials.to_string());
        let response = self
            .inner
            .retry
            .execute(
                move || api.login(credentials.clone()),
                ExecuteOptions::new().dedupe_key(key),
            )
            .await?;

        let data = SessionData::from_value(response).ok_or_else(|| {
            SessionError::MalformedResponse("login response has an unexpected shape".to_string())
        })?;

        if !self.create_session(data) {
            return Err(SessionError::MalformedResponse(
                "login response is missing a valid user or token, or could not be stored"
                    .to_string(),
            ));
        }

        self.inner
            .storage
            .get()
            .ok_or_else(|| SessionError::MalformedResponse("session was not stored".to_string()))
    }

    /// Startup path: pick up a stored session and verify it with the server.
    pub async fn restore_session(&self) -> Option<SessionRecord> {
        if self.is_destroyed() {
            return None;
        }

        self.inner.storage.sync_from_storage();
        let Some(record) = self.inner.storage.get() else {
            tracing::debug!("No stored session to restore");
            self.set_state(SessionState::None);
            return None;
        };

        if record.is_expired_at(self.now()) {
            tracing::info!(user_id = %record.user.id, "Stored session has expired");
            self.expire();
            return None;
        }

        let token = record.token.clone();
        match self.check(token.clone()).await {
            Ok(check) if check.success => {
                if self.inner.storage.token().as_deref() != Some(token.as_str()) {
                    // replaced or cleared elsewhere while the check was in flight
                    return self.inner.storage.get();
                }
                self.merge_check_data(check.data);
                self.reset_warnings();
                self.set_state(SessionState::Active);
                tracing::info!(user_id = %record.user.id, "Session restored and verified");
                self.emit(SessionEvent::Restored {
                    verified: true,
                    expires_at: self.expires_at(),
                });
                self.extend();
                self.inner.storage.get()
            }
            Ok(_) => {
                tracing::warn!(user_id = %record.user.id, "Server rejected stored session");
                self.invalidate();
                None
            }
            Err(e) if e.is_auth_rejection() => {
                tracing::warn!(user_id = %record.user.id, error = %e, "Server rejected stored session");
                self.invalidate();
                None
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %record.user.id,
                    error = %e,
                    "Session check failed, keeping local session"
                );
                self.reset_warnings();
                self.set_state(SessionState::Active);
                self.emit(SessionEvent::Restored {
                    verified: false,
                    expires_at: record.expires_at,
                });
                self.inner.storage.get()
            }
        }
    }

    async fn check(&self, token: String) -> till_network::Result<SessionCheck> {
        let api = Arc::clone(&self.inner.api);
        let key = request_key(CHECK_KEY, &token);
        self.inner
            .retry
            .execute(
                move || api.check_session(token.clone()),
                ExecuteOptions::new().dedupe_key(key),
            )
            .await
    }

    fn merge_check_data(&self, data: Option<Value>) {
        let Some(data) = data else {
            return;
        };

        match serde_json::from_value::<SessionPatch>(data) {
            Ok(patch) if patch != SessionPatch::default() => {
                self.inner.storage.update(patch);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Ignoring unrecognized session check data"),
        }
    }

    /// Push the expiry to `now + max_lifetime`.
    pub fn extend(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        if !self
            .inner
            .storage
            .extend_expiration(self.inner.config.lifetime_ms())
        {
            return false;
        }

        let expires_at = self.expires_at();
        self.reset_warnings();
        tracing::debug!(expires_at, "Session extended");
        self.emit(SessionEvent::Extended { expires_at });
        self.broadcast("token refresh", |tabs| {
            tabs.broadcast_token_refresh(json!({ "expiresAt": expires_at }))
        });
        true
    }

    async fn periodic_extension(&self) {
        if self.is_destroyed() || !self.state().is_active() {
            return;
        }
        if let Some(tabs) = &self.inner.tabs {
            if !tabs.is_leader() {
                return;
            }
        }

        self.inner.storage.sync_from_storage();
        let Some(record) = self.inner.storage.get() else {
            return;
        };
        if self.now().saturating_sub(record.last_activity) > self.inner.config.idle_ms() {
            tracing::debug!("Skipping session extension for idle operator");
            return;
        }

        match self.check(record.token.clone()).await {
            Ok(check) if check.success => {
                self.merge_check_data(check.data);
                self.extend();
            }
            Ok(_) => {
                tracing::warn!("Server rejected session during periodic check");
                self.invalidate();
            }
            Err(e) if e.is_auth_rejection() => {
                tracing::warn!(error = %e, "Server rejected session during periodic check");
                self.invalidate();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Periodic session check failed, keeping session");
            }
        }
    }

    fn check_expiry(&self) {
        if self.is_destroyed() || !self.state().is_active() {
            return;
        }

        // another tab may have extended or cleared the session
        self.inner.storage.sync_from_storage();
        if !self.inner.storage.has_session() {
            self.clear_local("remote_logout");
            return;
        }

        let remaining = self.inner.storage.time_until_expiry();
        if remaining <= 0 {
            tracing::info!("Session expired");
            self.expire();
            return;
        }

        let critical = {
            let mut flags = self.inner.warnings.lock();
            if remaining <= self.inner.config.critical_ms() && !flags.critical {
                flags.critical = true;
                flags.warned = true;
                Some(true)
            } else if remaining <= self.inner.config.warning_ms() && !flags.warned {
                flags.warned = true;
                Some(false)
            } else {
                None
            }
        };

        if let Some(critical) = critical {
            tracing::info!(critical, remaining_ms = remaining, "Session expiring soon");
            self.emit(SessionEvent::ExpiringSoon {
                critical,
                remaining_ms: remaining,
            });

            let callback = self.inner.warning_callback.lock().clone();
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(critical, remaining))).is_err() {
                    tracing::error!("Expiry warning callback panicked");
                }
            }
        }
    }

    fn expire(&self) {
        self.inner.storage.clear();
        self.set_state(SessionState::Expired);
        self.emit(SessionEvent::cleared("expired"));
    }

    fn invalidate(&self) {
        self.inner.storage.clear();
        self.set_state(SessionState::Invalid);
        self.emit(SessionEvent::cleared("invalid"));
        self.broadcast("logout", |tabs| tabs.broadcast_logout("invalid"));
    }

    fn clear_local(&self, reason: &str) {
        let had_session = self.inner.storage.has_session();
        self.inner.storage.clear();
        let changed = self.state() != SessionState::None;
        self.set_state(SessionState::None);
        if had_session || changed {
            self.emit(SessionEvent::cleared(reason));
        }
    }

    /// End the session. Local state is cleared before the server is told, and
    /// a failing server call is only logged.
    pub async fn logout(&self, options: LogoutOptions) {
        let token = self.inner.storage.token();

        self.clear_local(&options.reason);
        self.broadcast("logout", |tabs| tabs.broadcast_logout(&options.reason));
        tracing::info!(reason = %options.reason, "Logged out");

        let Some(token) = token.filter(|_| options.notify_server) else {
            return;
        };

        let api = Arc::clone(&self.inner.api);
        let key = request_key(LOGOUT_KEY, &token);
        let result = self
            .inner
            .retry
            .execute(
                move || api.logout(token.clone()),
                ExecuteOptions::new().max_attempts(1).dedupe_key(key),
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "Server logout failed");
        }
    }

    fn on_tab_event(&self, event: TabEvent, payload: &Value) {
        if self.is_destroyed() {
            return;
        }

        match event {
            TabEvent::SessionUpdate | TabEvent::TokenRefresh => {
                self.inner.storage.sync_from_storage();
                if self.inner.storage.has_session() && !self.inner.storage.is_expired() {
                    self.reset_warnings();
                    self.set_state(SessionState::Active);
                }
            }
            TabEvent::Logout => {
                tracing::info!(
                    reason = payload["reason"].as_str().unwrap_or("unknown"),
                    "Session ended in another tab"
                );
                self.clear_local("remote_logout");
            }
            TabEvent::Activity => {
                self.inner.storage.sync_from_storage();
            }
            TabEvent::Leader => {}
        }
    }

    /// Note operator activity and let other tabs know, at most once per
    /// `activity_broadcast_interval_ms`.
    pub fn record_activity(&self) {
        if !self.inner.storage.has_session() {
            return;
        }
        self.inner.storage.record_activity();

        let now = self.now();
        let due = {
            let mut last = self.inner.last_activity_broadcast.lock();
            if now.saturating_sub(*last) >= self.inner.config.activity_broadcast_ms() {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.broadcast("activity", |tabs| tabs.broadcast_activity());
        }
    }

    /// Shallow-merge fields into the session without touching its expiry.
    pub fn update_session(&self, patch: SessionPatch) -> bool {
        if !self.inner.storage.update(patch) {
            return false;
        }
        let expires_at = self.expires_at();
        self.broadcast("session update", |tabs| {
            tabs.broadcast_session_update(json!({ "expiresAt": expires_at }))
        });
        true
    }

    pub fn set_warning_callback<F>(&self, callback: F)
    where
        F: Fn(bool, i64) + Send + Sync + 'static,
    {
        *self.inner.warning_callback.lock() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active() && !self.inner.storage.is_expired()
    }

    pub fn has_session(&self) -> bool {
        self.inner.storage.has_session()
    }

    pub fn session(&self) -> Option<SessionRecord> {
        self.inner.storage.get()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.storage.token()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.storage.user()
    }

    pub fn field(&self, path: &str) -> Option<Value> {
        self.inner.storage.get_field(path)
    }

    pub fn permissions(&self) -> BTreeSet<String> {
        self.inner
            .storage
            .get()
            .map(|record| record.permissions)
            .unwrap_or_default()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.inner
            .storage
            .get()
            .is_some_and(|record| record.has_permission(permission))
    }

    pub fn time_until_expiry(&self) -> i64 {
        self.inner.storage.time_until_expiry()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            is_active: self.is_active(),
            time_until_expiry: self.time_until_expiry(),
            storage: self.inner.storage.stats(),
            network: self.inner.retry.status(),
            tabs: self.inner.tabs.as_ref().map(TabSync::status),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn tabs(&self) -> Option<&TabSync> {
        self.inner.tabs.as_ref()
    }

    /// Bus carrying the session events plus any host-defined diagnostics.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe<F>(&self, handler: F) -> SessionSubscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        SessionSubscription::attach(&self.inner.bus, handler)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop timers and cross-tab listeners and leave the tab group. The
    /// stored session is kept.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        for subscription in self.inner.tab_subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(tabs) = &self.inner.tabs {
            tabs.destroy();
        }
        if self.inner.storage.has_session() {
            self.inner.storage.flush();
        }

        tracing::info!("Session manager destroyed");
    }
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .finish()
    }
}
