//! Till Session Management
//!
//! Owns the operator session of one terminal context:
//! - Login and startup restore, verified against the server when reachable
//! - Fail open on network trouble, fail closed on explicit rejection
//! - Expiry warnings, automatic extension while the operator is active
//! - Session changes mirrored across tabs

mod api;
mod config;
mod error;
mod event;
mod manager;
mod state;

pub use api::{AuthApi, SessionCheck};
pub use config::SessionConfig;
pub use error::SessionError;
pub use event::{SessionEvent, SessionSubscription};
pub use manager::{LogoutOptions, SessionContext, SessionManager, SessionStatus, WarningCallback};
pub use state::SessionState;

pub type Result<T> = std::result::Result<T, SessionError>;
