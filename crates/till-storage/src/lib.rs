//! Till Storage Layer
//!
//! Durable key/value persistence plus the single source of truth for the
//! operator's session record:
//! - Two layers: in-memory cache over a durable store
//! - Versioned record schema, older records migrated on load
//! - Every read returns an owned copy of the record
//! - Corrupted durable data is treated as absent, never surfaced

mod clock;
mod database;
mod error;
mod memory;
mod migrations;
mod record;
mod store;
mod token_storage;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use database::Database;
pub use error::{StorageError, ValidationError};
pub use memory::MemoryStore;
pub use record::{
    validate_token, SessionData, SessionPatch, SessionRecord, User, CURRENT_RECORD_VERSION,
};
pub use store::{DurableStore, StorageChange};
pub use token_storage::{StorageConfig, StorageStats, TokenStorage};

pub type Result<T> = std::result::Result<T, StorageError>;
