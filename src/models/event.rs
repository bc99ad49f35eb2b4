//! Event catalog and the envelope carried over pub/sub.

use crate::error::{AppError, AppResult};
use crate::models::presence::PresenceStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every event type the service may carry. Each has a payload schema, see [`EventType::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MessageCreated,
    ConversationCreated,
    ConversationSeen,
    ConversationTyping,
    ConversationEventCreated,
    UserConnected,
    UserDisconnected,
    VisitorConnected,
    VisitorDisconnected,
    UserPresenceUpdate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageCreated => "MESSAGE_CREATED",
            EventType::ConversationCreated => "CONVERSATION_CREATED",
            EventType::ConversationSeen => "CONVERSATION_SEEN",
            EventType::ConversationTyping => "CONVERSATION_TYPING",
            EventType::ConversationEventCreated => "CONVERSATION_EVENT_CREATED",
            EventType::UserConnected => "USER_CONNECTED",
            EventType::UserDisconnected => "USER_DISCONNECTED",
            EventType::VisitorConnected => "VISITOR_CONNECTED",
            EventType::VisitorDisconnected => "VISITOR_DISCONNECTED",
            EventType::UserPresenceUpdate => "USER_PRESENCE_UPDATE",
        }
    }

    /// Check that `data` matches the payload schema of this event type.
    pub fn validate(&self, data: &serde_json::Value) -> AppResult<()> {
        match self {
            EventType::MessageCreated => check::<MessageCreatedData>(*self, data),
            EventType::ConversationCreated => check::<ConversationCreatedData>(*self, data),
            EventType::ConversationSeen => check::<ConversationSeenData>(*self, data),
            EventType::ConversationTyping => check::<ConversationTypingData>(*self, data),
            EventType::ConversationEventCreated => {
                check::<ConversationEventCreatedData>(*self, data)
            }
            EventType::UserConnected | EventType::UserDisconnected => {
                check::<UserConnectionData>(*self, data)
            }
            EventType::VisitorConnected | EventType::VisitorDisconnected => {
                check::<VisitorConnectionData>(*self, data)
            }
            EventType::UserPresenceUpdate => check::<UserPresenceUpdateData>(*self, data),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check<T: DeserializeOwned>(event_type: EventType, data: &serde_json::Value) -> AppResult<()> {
    if !data.is_object() {
        return Err(AppError::InvalidPayload {
            event_type: event_type.to_string(),
            reason: "data must be a JSON object".to_string(),
        });
    }
    T::deserialize(data)
        .map(|_| ())
        .map_err(|e| AppError::InvalidPayload {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })
}

/// The unit of transport: `{ type, data, timestamp }`, serialized once per publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    /// Epoch milliseconds at construction.
    pub timestamp: i64,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Decode the typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> AppResult<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

// --- Payload schemas ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreatedData {
    pub message: serde_json::Value,
    pub conversation_id: String,
    pub website_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreatedData {
    pub conversation: serde_json::Value,
    pub conversation_id: String,
    pub website_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSeenData {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTypingData {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    pub is_typing: bool,
    /// Draft of what a visitor is typing, shown to agents.
    #[serde(default)]
    pub visitor_preview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEventCreatedData {
    pub event: serde_json::Value,
    pub conversation_id: String,
    pub website_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnectionData {
    pub user_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub website_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorConnectionData {
    pub visitor_id: String,
    pub connection_id: String,
    pub website_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceUpdateData {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let env = EventEnvelope::new(
            EventType::ConversationTyping,
            json!({ "conversationId": "c1", "isTyping": true }),
        );
        let raw = serde_json::to_value(&env).unwrap();
        assert_eq!(raw["type"], "CONVERSATION_TYPING");
        assert_eq!(raw["data"]["conversationId"], "c1");
        assert!(raw["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn as_str_matches_serde_name() {
        for t in [
            EventType::MessageCreated,
            EventType::ConversationEventCreated,
            EventType::VisitorDisconnected,
            EventType::UserPresenceUpdate,
        ] {
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
    }

    #[test]
    fn validate_accepts_matching_payload() {
        let data = json!({
            "message": { "text": "hi" },
            "conversationId": "c1",
            "websiteId": "w1",
            "extra": 1
        });
        assert!(EventType::MessageCreated.validate(&data).is_ok());
    }

    #[test]
    fn validate_rejects_mismatched_payload() {
        let err = EventType::UserPresenceUpdate
            .validate(&json!({ "userId": "u1", "status": "sleeping", "lastSeen": 1 }))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidPayload { .. }));

        let err = EventType::ConversationTyping
            .validate(&json!("not an object"))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidPayload { .. }));
    }

    #[test]
    fn typed_payload_roundtrip() {
        let env = EventEnvelope::new(
            EventType::UserPresenceUpdate,
            json!({ "userId": "u1", "status": "away", "lastSeen": 42 }),
        );
        let data: UserPresenceUpdateData = env.payload().unwrap();
        assert_eq!(data.user_id, "u1");
        assert_eq!(data.status, PresenceStatus::Away);
    }
}
