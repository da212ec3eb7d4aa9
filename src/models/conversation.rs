use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Message, ResolvedProfile, Role};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_by: Uuid,
    pub settings: sqlx::types::Json<ConversationSettings>,
    pub status: ConversationStatus,
    /// Normalized pair key; set for direct conversations only. A partial
    /// unique index over this column enforces at-most-one active direct
    /// conversation per unordered pair.
    pub direct_key: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<Uuid>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Soft-deleted conversations behave as missing for all message traffic;
    /// only the status flips, the history rows stay.
    pub fn is_deleted(&self) -> bool {
        self.status == ConversationStatus::Deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
    Support,
    Announcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSettings {
    pub allow_new_participants: bool,
    pub require_approval: bool,
    pub is_archived: bool,
    pub is_pinned: bool,
    pub mute_notifications: bool,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            allow_new_participants: true,
            require_approval: false,
            is_archived: false,
            is_pinned: false,
            mute_notifications: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub profile_id: Uuid,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Participant enriched with the resolved display identity. `identity` may be
/// the sentinel profile when the underlying record is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantWithIdentity {
    #[serde(flatten)]
    pub participant: Participant,
    pub identity: ResolvedProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationWithDetails {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<ParticipantWithIdentity>,
    pub unread_count: i64,
    pub last_message: Option<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_deleted_status_reads_as_missing() {
        let mut conv = sample_conversation();
        assert!(!conv.is_deleted());
        conv.status = ConversationStatus::Archived;
        assert!(!conv.is_deleted());
        conv.status = ConversationStatus::Deleted;
        assert!(conv.is_deleted());
    }

    fn sample_conversation() -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Direct,
            title: None,
            description: None,
            created_by: Uuid::new_v4(),
            settings: sqlx::types::Json(ConversationSettings::default()),
            status: ConversationStatus::Active,
            direct_key: None,
            last_message_at: None,
            last_message_id: None,
            message_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn default_settings_allow_new_participants() {
        let s = ConversationSettings::default();
        assert!(s.allow_new_participants);
        assert!(!s.require_approval);
        assert!(!s.mute_notifications);
    }
}
