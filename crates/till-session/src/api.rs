//! Server collaborator

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use till_network::Result;

/// Response of the idempotent session-check call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheck {
    pub success: bool,
    /// Fresh user or permission data to merge into the stored session
    #[serde(default)]
    pub data: Option<Value>,
}

impl SessionCheck {
    pub fn valid() -> Self {
        Self {
            success: true,
            data: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            data: None,
        }
    }
}

/// The authentication endpoints. Implementations map transport failures and
/// non-success statuses to [`till_network::NetworkError`].
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for `{user, token, permissions, limits, interface_access}`.
    fn login(&self, credentials: Value) -> BoxFuture<'static, Result<Value>>;

    fn check_session(&self, token: String) -> BoxFuture<'static, Result<SessionCheck>>;

    fn logout(&self, token: String) -> BoxFuture<'static, Result<()>>;
}
