//! Till Event Bus
//!
//! Generic pub/sub primitive shared by every session component:
//! - Listeners run synchronously in subscription order
//! - A panicking listener never blocks its siblings
//! - Bounded history with sensitive fields redacted
//! - Pause/resume with FIFO replay, namespaced views, wait-for-next

mod bus;
mod error;
mod namespace;
mod redact;

pub use bus::{EventBus, EventBusConfig, HistoryEntry, Listener, ListenerId, Subscription};
pub use error::EventError;
pub use namespace::EventNamespace;
pub use redact::{is_sensitive_key, redact, REDACTED};

pub type Result<T> = std::result::Result<T, EventError>;
