//! Channel kinds and naming conventions.

use serde::{Deserialize, Serialize};

/// Channel kind, one per addressable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Everyone watching one conversation from the visitor side.
    VisitorConversation,
    /// Every dashboard open on one website.
    DashboardWebsite,
    /// A single client connection.
    Connection,
}

impl ChannelKind {
    fn segment(&self) -> &'static str {
        match self {
            ChannelKind::VisitorConversation => "visitor:conversation",
            ChannelKind::DashboardWebsite => "dashboard:website",
            ChannelKind::Connection => "connection",
        }
    }

    /// Channel name for `id`: `<prefix>:<kind segment>:<id>`.
    pub fn channel(&self, prefix: &str, id: &str) -> String {
        format!("{}:{}:{}", prefix, self.segment(), id)
    }
}

pub fn conversation_channel(prefix: &str, conversation_id: &str) -> String {
    ChannelKind::VisitorConversation.channel(prefix, conversation_id)
}

pub fn website_channel(prefix: &str, website_id: &str) -> String {
    ChannelKind::DashboardWebsite.channel(prefix, website_id)
}

pub fn connection_channel(prefix: &str, connection_id: &str) -> String {
    ChannelKind::Connection.channel(prefix, connection_id)
}

/// Logical addressees of a publish or a multi-channel subscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTarget {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub website_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl ChannelTarget {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn website(id: impl Into<String>) -> Self {
        Self {
            website_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn connection(id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Resolve every populated field to its channel. Empty strings count as absent.
    pub fn channels(&self, prefix: &str) -> Vec<String> {
        [
            (ChannelKind::VisitorConversation, &self.conversation_id),
            (ChannelKind::DashboardWebsite, &self.website_id),
            (ChannelKind::Connection, &self.connection_id),
        ]
        .into_iter()
        .filter_map(|(kind, id)| {
            id.as_deref()
                .filter(|id| !id.is_empty())
                .map(|id| kind.channel(prefix, id))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels("").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_follow_kind() {
        assert_eq!(
            conversation_channel("rt", "c1"),
            "rt:visitor:conversation:c1"
        );
        assert_eq!(website_channel("rt", "w1"), "rt:dashboard:website:w1");
        assert_eq!(connection_channel("rt", "k1"), "rt:connection:k1");
    }

    #[test]
    fn channel_names_are_deterministic() {
        assert_eq!(
            conversation_channel("rt", "abc"),
            conversation_channel("rt", "abc")
        );
    }

    #[test]
    fn different_entities_never_collide() {
        let names = [
            conversation_channel("rt", "same"),
            website_channel("rt", "same"),
            connection_channel("rt", "same"),
            conversation_channel("rt", "other"),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn target_resolves_populated_fields_only() {
        let target = ChannelTarget {
            conversation_id: Some("c".into()),
            website_id: Some(String::new()),
            connection_id: Some("k".into()),
        };
        assert_eq!(
            target.channels("rt"),
            vec!["rt:visitor:conversation:c", "rt:connection:k"]
        );
        assert!(ChannelTarget::default().is_empty());
        assert!(!ChannelTarget::website("w").is_empty());
    }
}
