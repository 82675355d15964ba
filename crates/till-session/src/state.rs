//! Session State Machine
//!
//! ```text
//! None ──create/restore──▶ Active ──expiry──▶ Expired
//!  │                         │
//!  │                         └──server rejection──▶ Invalid
//!  └──expired or rejected on restore──▶ Expired / Invalid
//!
//! any ──logout/clear──▶ None;  Expired / Invalid ──login──▶ Active
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No session
    #[default]
    None,
    /// Authenticated and within its lifetime
    Active,
    /// Lifetime ran out
    Expired,
    /// The server rejected the token
    Invalid,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        match (self, target) {
            (SessionState::None, SessionState::Active) => true,
            // restore can find an expired or rejected record straight away
            (SessionState::None, SessionState::Expired) => true,
            (SessionState::None, SessionState::Invalid) => true,
            (SessionState::Active, SessionState::Expired) => true,
            (SessionState::Active, SessionState::Invalid) => true,
            (SessionState::Expired, SessionState::Active) => true,
            (SessionState::Invalid, SessionState::Active) => true,
            (_, SessionState::None) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::None => "NONE",
            SessionState::Active => "ACTIVE",
            SessionState::Expired => "EXPIRED",
            SessionState::Invalid => "INVALID",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NONE" => Ok(SessionState::None),
            "ACTIVE" => Ok(SessionState::Active),
            "EXPIRED" => Ok(SessionState::Expired),
            "INVALID" => Ok(SessionState::Invalid),
            _ => Err(format!("Unknown session state: {}", s)),
        }
    }
}
