//! Wire format shared by both transports

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum MessageKind {
    /// Periodic presence signal. Carries the sender's leadership claim, if any.
    Heartbeat {
        #[serde(rename = "claimedAt")]
        claimed_at: Option<i64>,
    },
    Claim {
        #[serde(rename = "claimedAt")]
        claimed_at: i64,
    },
    Leaving,
    SessionUpdate(Value),
    Logout {
        reason: String,
    },
    Activity,
    TokenRefresh(Value),
}

impl MessageKind {
    /// Heartbeats, claims and departures drive the election only.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            MessageKind::Heartbeat { .. } | MessageKind::Claim { .. } | MessageKind::Leaving
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMessage {
    pub id: String,
    pub from: String,
    /// Wall-clock send time in epoch milliseconds
    pub timestamp: i64,
    pub kind: MessageKind,
}

impl TabMessage {
    pub fn new(from: &str, timestamp: i64, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            timestamp,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let message = TabMessage::new(
            "tab-a",
            42,
            MessageKind::SessionUpdate(json!({"user": {"id": "7"}})),
        );
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["from"], "tab-a");
        assert_eq!(value["kind"]["type"], "sessionUpdate");
        assert_eq!(value["kind"]["payload"]["user"]["id"], "7");

        let heartbeat = serde_json::to_value(MessageKind::Heartbeat { claimed_at: Some(5) }).unwrap();
        assert_eq!(heartbeat, json!({"type": "heartbeat", "payload": {"claimedAt": 5}}));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TabMessage::new("t", 0, MessageKind::Activity);
        let b = TabMessage::new("t", 0, MessageKind::Activity);
        assert_ne!(a.id, b.id);
        assert!(MessageKind::Leaving.is_presence());
        assert!(!MessageKind::Activity.is_presence());
    }
}
