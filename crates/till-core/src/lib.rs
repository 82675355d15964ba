//! Till Core
//!
//! Wires the session and resilience components of a terminal together:
//! - `Config` aggregates every component's settings
//! - `Terminal` opens the durable store and builds the components from config
//! - `init_logging` installs the tracing subscriber

mod config;
mod error;
mod terminal;

pub use config::Config;
pub use error::CoreError;
pub use terminal::Terminal;

// Re-export the component crates' public surface
pub use till_events::{
    EventBus, EventBusConfig, EventNamespace, HistoryEntry, Subscription, REDACTED,
};
pub use till_network::{
    CircuitStateKind, ExecuteOptions, NetworkError, NetworkRetry, NetworkStatus, RetryConfig,
};
pub use till_session::{
    AuthApi, LogoutOptions, SessionCheck, SessionConfig, SessionError, SessionEvent,
    SessionManager, SessionState, SessionStatus,
};
pub use till_storage::{
    Clock, Database, DurableStore, ManualClock, MemoryStore, SessionData, SessionPatch,
    SessionRecord, SharedClock, StorageConfig, StorageError, SystemClock, TokenStorage, User,
};
pub use till_tabs::{BroadcastHub, TabEvent, TabSync, TabSyncConfig, TabSyncError, Transport};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
