//! Session lifecycle events
//!
//! Each event is emitted on the session's [`EventBus`] under its name
//! (`CREATED`, `RESTORED`, ...) with a camelCase JSON payload. Tokens never
//! appear in payloads.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use till_events::{EventBus, Subscription};

use crate::state::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "CREATED")]
    Created {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "expiresAt")]
        expires_at: i64,
    },
    #[serde(rename = "RESTORED")]
    Restored {
        /// False when the server could not be reached and the local record
        /// was kept as is
        verified: bool,
        #[serde(rename = "expiresAt")]
        expires_at: i64,
    },
    #[serde(rename = "EXTENDED")]
    Extended {
        #[serde(rename = "expiresAt")]
        expires_at: i64,
    },
    #[serde(rename = "EXPIRING_SOON")]
    ExpiringSoon {
        critical: bool,
        #[serde(rename = "remainingMs")]
        remaining_ms: i64,
    },
    #[serde(rename = "CLEARED")]
    Cleared { reason: String },
    #[serde(rename = "STATE_CHANGE")]
    StateChange {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionEvent {
    pub const NAMES: [&'static str; 6] = [
        "CREATED",
        "RESTORED",
        "EXTENDED",
        "EXPIRING_SOON",
        "CLEARED",
        "STATE_CHANGE",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created { .. } => "CREATED",
            SessionEvent::Restored { .. } => "RESTORED",
            SessionEvent::Extended { .. } => "EXTENDED",
            SessionEvent::ExpiringSoon { .. } => "EXPIRING_SOON",
            SessionEvent::Cleared { .. } => "CLEARED",
            SessionEvent::StateChange { .. } => "STATE_CHANGE",
        }
    }

    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rebuild an event from its bus name and payload.
    pub fn from_parts(name: &str, payload: &Value) -> Option<Self> {
        serde_json::from_value(json!({ "type": name, "payload": payload })).ok()
    }

    pub(crate) fn cleared(reason: &str) -> Self {
        SessionEvent::Cleared {
            reason: reason.to_string(),
        }
    }
}

/// Typed listener registration made by `SessionManager::subscribe`.
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    subscriptions: Vec<Subscription>,
}

impl SessionSubscription {
    pub(crate) fn attach<F>(bus: &EventBus, handler: F) -> Self
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let handler = std::sync::Arc::new(handler);
        let subscriptions = SessionEvent::NAMES
            .into_iter()
            .map(|name| {
                let handler = std::sync::Arc::clone(&handler);
                bus.on(name, move |payload| {
                    if let Some(event) = SessionEvent::from_parts(name, payload) {
                        handler(&event);
                    }
                })
            })
            .collect();

        Self { subscriptions }
    }

    /// Remove every listener. Returns false if they were already gone.
    pub fn unsubscribe(&self) -> bool {
        self.subscriptions
            .iter()
            .fold(false, |removed, sub| sub.unsubscribe() || removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use till_events::EventBusConfig;

    #[test]
    fn test_payload_shapes() {
        let created = SessionEvent::Created {
            user_id: "7".into(),
            expires_at: 99,
        };
        assert_eq!(created.name(), "CREATED");
        assert_eq!(created.payload(), json!({ "userId": "7", "expiresAt": 99 }));

        let change = SessionEvent::StateChange {
            from: SessionState::None,
            to: SessionState::Active,
        };
        assert_eq!(change.payload(), json!({ "from": "NONE", "to": "ACTIVE" }));

        let soon = SessionEvent::ExpiringSoon {
            critical: true,
            remaining_ms: 500,
        };
        assert_eq!(
            SessionEvent::from_parts(soon.name(), &soon.payload()),
            Some(soon)
        );
        assert_eq!(SessionEvent::from_parts("CREATED", &json!({})), None);
    }

    #[test]
    fn test_typed_subscription() {
        let bus = EventBus::new(EventBusConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            SessionSubscription::attach(&bus, move |event| seen.lock().push(event.clone()))
        };

        let event = SessionEvent::cleared("logout");
        bus.emit(event.name(), event.payload());
        bus.emit("UNRELATED", json!({}));
        assert_eq!(*seen.lock(), vec![SessionEvent::cleared("logout")]);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        bus.emit(event.name(), event.payload());
        assert_eq!(seen.lock().len(), 1);
    }
}
