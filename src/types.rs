//! Shared data model for group conversations and messages.
//!
//! These types mirror what the protocol client exposes: a [`Conversation`] is
//! the local view of an encrypted group, which may be stale relative to the
//! remote network until the owning session has synchronized.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Lowercase-normalize a chain address so it can be used as a map key.
/// Sessions, member lists and signature checks all go through this.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionLevel {
    Member,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub inbox_id: String,
    pub account_addresses: Vec<String>,
    pub installation_ids: Vec<String>,
    pub permission_level: PermissionLevel,
}

/// A group conversation as assigned by the protocol on creation.
/// `id` and `created_at_ns` are immutable; metadata fields are each
/// independently updatable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub members: Vec<GroupMember>,
    pub admins: Vec<String>,
    pub super_admins: Vec<String>,
    pub created_at_ns: i64,
    pub added_by_inbox_id: String,
    pub is_active: bool,
}

impl Conversation {
    pub fn member_inbox_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.inbox_id.clone()).collect()
    }

    pub fn has_member(&self, inbox_id: &str) -> bool {
        self.members.iter().any(|m| m.inbox_id == inbox_id)
    }
}

/// Append-only message within a conversation. No edit or delete is exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub sender: String,
    pub content: String,
    pub sent_at_ns: i64,
}

/// Explicit patch object for metadata updates. Fields left as `None` are
/// untouched, never cleared. Empty strings from the transport are treated as
/// absent (see [`MetadataPatch::normalized`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

impl MetadataPatch {
    /// Drop empty-string fields so "field sent but blank" behaves like
    /// "field omitted".
    pub fn normalized(self) -> Self {
        let keep = |field: Option<String>| field.filter(|v| !v.trim().is_empty());
        MetadataPatch {
            name: keep(self.name),
            description: keep(self.description),
            image_url: keep(self.image_url),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.image_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetadata {
    pub creator_inbox_id: String,
    pub conversation_type: String,
}

/// Listing view of a conversation: the raw fields plus a derived conversation
/// type tag and the creation timestamp rendered as a calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub is_active: bool,
    pub added_by_inbox_id: String,
    pub created_at_ns: i64,
    pub created_at: String,
    pub metadata: SummaryMetadata,
    pub members: Vec<GroupMember>,
    pub admins: Vec<String>,
    pub super_admins: Vec<String>,
    pub latest_message: Option<GroupMessage>,
}

impl ConversationSummary {
    pub fn new(conversation: Conversation, latest_message: Option<GroupMessage>) -> Self {
        let created_at = DateTime::from_timestamp_nanos(conversation.created_at_ns).to_rfc3339();
        ConversationSummary {
            id: conversation.id,
            name: conversation.name,
            description: conversation.description,
            image_url: conversation.image_url,
            is_active: conversation.is_active,
            added_by_inbox_id: conversation.added_by_inbox_id.clone(),
            created_at_ns: conversation.created_at_ns,
            created_at,
            metadata: SummaryMetadata {
                creator_inbox_id: conversation.added_by_inbox_id,
                conversation_type: "default".to_string(),
            },
            members: conversation.members,
            admins: conversation.admins,
            super_admins: conversation.super_admins,
            latest_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_normalization_drops_blank_fields() {
        let patch = MetadataPatch {
            name: Some("Team".to_string()),
            description: Some("   ".to_string()),
            image_url: Some(String::new()),
        };
        let patch = patch.normalized();
        assert_eq!(patch.name.as_deref(), Some("Team"));
        assert!(patch.description.is_none());
        assert!(patch.image_url.is_none());
    }

    #[test]
    fn summary_renders_calendar_timestamp() {
        let conversation = Conversation {
            id: "g1".to_string(),
            name: "Team".to_string(),
            description: String::new(),
            image_url: String::new(),
            members: vec![],
            admins: vec![],
            super_admins: vec![],
            created_at_ns: 1_700_000_000_000_000_000,
            added_by_inbox_id: "inbox-1".to_string(),
            is_active: true,
        };
        let summary = ConversationSummary::new(conversation, None);
        assert!(summary.created_at.starts_with("2023-11-14T"));
        assert_eq!(summary.metadata.conversation_type, "default");
        assert_eq!(summary.metadata.creator_inbox_id, "inbox-1");
    }
}
