//! Till Tab Synchronization
//!
//! Coordinates every open terminal context ("tab") of one origin:
//! - Heartbeat-based leader election, advisory only
//! - Session update, logout, activity and token refresh broadcasts
//! - Direct broadcast channel, or a polled durable-storage log as fallback

mod error;
mod event;
mod message;
mod sync;
mod transport;

pub use error::TabSyncError;
pub use event::TabEvent;
pub use message::{MessageKind, TabMessage};
pub use sync::{TabSync, TabSyncConfig, TabSyncStatus};
pub use transport::{BroadcastHub, Transport};

pub type Result<T> = std::result::Result<T, TabSyncError>;
