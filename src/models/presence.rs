//! User presence: online, away, or absent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    /// Never stored: offline is an absent key.
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Stored presence of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    /// Epoch milliseconds.
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_id: Option<String>,
}

/// Generate a process identity: `<pid>.<uuid>`.
pub fn generate_server_id() -> String {
    format!("{}.{}", std::process::id(), Uuid::new_v4().as_simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_ids_are_unique() {
        assert_ne!(generate_server_id(), generate_server_id());
    }

    #[test]
    fn record_wire_shape() {
        let record = PresenceRecord {
            status: PresenceStatus::Online,
            last_seen: 7,
            website_id: None,
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"status":"online","lastSeen":7}"#
        );
    }
}
