//! Events surfaced to listeners of a tab

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TabEvent {
    /// Leadership changed. Payload `{leaderId, isLeader}`
    Leader,
    /// Another tab stored new session data. Payload `{from, data}`
    SessionUpdate,
    /// Another tab logged out. Payload `{from, reason}`
    Logout,
    /// Another tab saw operator activity. Payload `{from, timestamp}`
    Activity,
    /// Another tab extended the session. Payload `{from, data}`
    TokenRefresh,
}

impl TabEvent {
    pub const ALL: [TabEvent; 5] = [
        TabEvent::Leader,
        TabEvent::SessionUpdate,
        TabEvent::Logout,
        TabEvent::Activity,
        TabEvent::TokenRefresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TabEvent::Leader => "leader",
            TabEvent::SessionUpdate => "sessionUpdate",
            TabEvent::Logout => "logout",
            TabEvent::Activity => "activity",
            TabEvent::TokenRefresh => "tokenRefresh",
        }
    }
}

impl std::fmt::Display for TabEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TabEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TabEvent::ALL
            .into_iter()
            .find(|event| event.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown tab event: {}", s))
    }
}
