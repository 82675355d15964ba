//! Terminal: one context's fully wired session stack
//!
//! Owns the durable store and the components built on it. Every accessor
//! hands out a cheap clone of the shared component.

use serde_json::Value;
use std::sync::Arc;

use till_events::EventBus;
use till_network::NetworkRetry;
use till_session::{AuthApi, LogoutOptions, SessionContext, SessionManager, SessionStatus};
use till_storage::{Database, DurableStore, SessionRecord, SharedClock, SystemClock, TokenStorage};
use till_tabs::{BroadcastHub, TabSync, Transport};

use crate::config::Config;
use crate::Result;

pub struct Terminal {
    config: Config,
    store: Arc<dyn DurableStore>,
    events: EventBus,
    storage: TokenStorage,
    retry: NetworkRetry,
    tabs: Option<TabSync>,
    session: SessionManager,
}

impl Terminal {
    /// Open the configured database and build every component on the system
    /// clock. Tabs talk over `hub` when given, otherwise through the durable
    /// store. Must be called inside a tokio runtime.
    pub fn new(config: Config, api: Arc<dyn AuthApi>, hub: Option<BroadcastHub>) -> Result<Self> {
        let store = open_store(&config)?;
        Self::with_store(config, store, Arc::new(SystemClock), api, hub)
    }

    /// Build on an already opened store and an explicit clock.
    pub fn with_store(
        config: Config,
        store: Arc<dyn DurableStore>,
        clock: SharedClock,
        api: Arc<dyn AuthApi>,
        hub: Option<BroadcastHub>,
    ) -> Result<Self> {
        config.session.validate()?;

        let events = EventBus::new(config.events.clone());
        let storage = TokenStorage::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.storage.clone(),
        );
        let retry = NetworkRetry::new(config.retry.clone());

        let tabs = config.cross_tab.then(|| {
            let transport = match hub {
                Some(hub) => Transport::Channel(hub),
                None => Transport::Storage(Arc::clone(&store)),
            };
            TabSync::new(transport, Arc::clone(&clock), config.tabs.clone())
        });

        let session = SessionManager::new(
            SessionContext {
                storage: storage.clone(),
                retry: retry.clone(),
                api,
                tabs: tabs.clone(),
                bus: events.clone(),
                clock,
            },
            config.session.clone(),
        )?;

        tracing::info!(
            database = %config.database_path.display(),
            tab_id = tabs.as_ref().map_or("-", |t| t.tab_id()),
            fallback = tabs.as_ref().is_some_and(|t| t.status().using_fallback),
            "Terminal initialized"
        );

        Ok(Self {
            config,
            store,
            events,
            storage,
            retry,
            tabs,
            session,
        })
    }

    /// Pick up and verify a session left by an earlier run or another tab.
    pub async fn start(&self) -> Option<SessionRecord> {
        self.session.restore_session().await
    }

    pub async fn login(&self, credentials: Value) -> Result<SessionRecord> {
        Ok(self.session.login(credentials).await?)
    }

    pub async fn logout(&self) {
        self.session.logout(LogoutOptions::default()).await;
    }

    /// Report connectivity changes from the host. Offline calls fail fast.
    pub fn set_online(&self, online: bool) {
        self.retry.set_online(online);
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn storage(&self) -> &TokenStorage {
        &self.storage
    }

    pub fn network(&self) -> &NetworkRetry {
        &self.retry
    }

    pub fn tabs(&self) -> Option<&TabSync> {
        self.tabs.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop every timer and abort pending retries. The stored session
    /// survives for the next start.
    pub fn shutdown(&self) {
        self.session.destroy();
        self.retry.shutdown();
        self.events.destroy();
        tracing::info!("Terminal shut down");
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn DurableStore>> {
    if config.is_in_memory() {
        return Ok(Arc::new(Database::open_in_memory()?));
    }

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Arc::new(Database::open(&config.database_path)?))
}
