use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Role;

/// SQL predicate for messages that count toward a recipient's unread totals.
/// Approval-gated messages (employee to admin) are visible on the wire but
/// excluded from the counts until approved, and archived rows never count.
/// Keep every unread query on this one fragment.
pub const UNREAD_COUNTABLE_SQL: &str =
    "NOT is_read AND NOT is_archived AND (is_approved OR NOT requires_approval)";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    /// Either the UUID string of a Conversation row or a derived legacy pair
    /// key with no backing row.
    pub conversation_key: String,
    pub sender_id: Uuid,
    pub sender_role: Role,
    /// Snapshot at send time; never re-resolved.
    pub sender_name: String,
    pub sender_email: String,
    pub receiver_id: Uuid,
    pub receiver_role: Role,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub is_read: bool,
    pub read_by: sqlx::types::Json<Vec<ReadReceipt>>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub reply_to_id: Option<Uuid>,
    pub is_reply: bool,
    pub requires_approval: bool,
    pub is_approved: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message counts toward inbox/unread totals once unread.
    pub fn is_inbox_visible(&self) -> bool {
        self.is_approved || !self.requires_approval
    }

    /// In-memory mirror of [`UNREAD_COUNTABLE_SQL`] scoped to one reader.
    pub fn counts_as_unread_for(&self, profile_id: Uuid, role: Role) -> bool {
        self.receiver_id == profile_id
            && self.receiver_role == role
            && !self.is_read
            && !self.is_archived
            && self.is_inbox_visible()
    }

    /// Whether `(profile_id, role)` is a wire-level party to this message:
    /// the sender or the receiver of record. Participants beyond the
    /// receiver of record are authorized against the participant rows
    /// instead.
    pub fn is_party(&self, profile_id: Uuid, role: Role) -> bool {
        (self.sender_id == profile_id && self.sender_role == role)
            || (self.receiver_id == profile_id && self.receiver_role == role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
    Image,
    System,
    Announcement,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Sent
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub profile_id: Uuid,
    pub role: Role,
    pub read_at: DateTime<Utc>,
}

/// Whether a receipt for `(profile_id, role)` is already recorded. The
/// timestamp is not part of the identity: one entry per reader.
pub fn has_read_receipt(receipts: &[ReadReceipt], profile_id: Uuid, role: Role) -> bool {
    receipts
        .iter()
        .any(|r| r.profile_id == profile_id && r.role == role)
}

/// JSONB containment marker for one reader's receipt. Used as the guard in
/// the atomic `read_by` append: containment matches on `profile_id` and
/// `role` while ignoring `read_at`, so the same reader never gets a second
/// entry even when two of their requests race.
pub fn receipt_marker(profile_id: Uuid, role: Role) -> serde_json::Value {
    serde_json::json!([{ "profile_id": profile_id, "role": role }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_lookup_keys_on_profile_and_role() {
        let reader = Uuid::new_v4();
        let receipts = vec![ReadReceipt {
            profile_id: reader,
            role: Role::Hr,
            read_at: Utc::now(),
        }];

        assert!(has_read_receipt(&receipts, reader, Role::Hr));
        // Same profile id under a different role is a distinct reader.
        assert!(!has_read_receipt(&receipts, reader, Role::Admin));
        assert!(!has_read_receipt(&receipts, Uuid::new_v4(), Role::Hr));
    }

    #[test]
    fn receipt_marker_is_a_subset_of_the_stored_receipt() {
        let reader = Uuid::new_v4();
        let stored = serde_json::to_value(ReadReceipt {
            profile_id: reader,
            role: Role::Hr,
            read_at: Utc::now(),
        })
        .unwrap();

        // Containment only holds if every marker field serializes exactly as
        // the stored receipt does.
        let marker = receipt_marker(reader, Role::Hr);
        for (key, value) in marker[0].as_object().unwrap() {
            assert_eq!(&stored[key], value, "marker field {} diverged", key);
        }
        assert!(marker[0].get("read_at").is_none());
    }

    #[test]
    fn unread_counting_is_scoped_to_the_receiver_of_record() {
        let msg = sample_message();
        assert!(msg.counts_as_unread_for(msg.receiver_id, Role::Admin));
        // Role mismatch, archived, read, and approval-gated rows never count.
        assert!(!msg.counts_as_unread_for(msg.receiver_id, Role::Hr));
        assert!(!msg.counts_as_unread_for(msg.sender_id, Role::Employee));

        let mut archived = sample_message();
        archived.is_archived = true;
        assert!(!archived.counts_as_unread_for(archived.receiver_id, Role::Admin));

        let mut gated = sample_message();
        gated.requires_approval = true;
        gated.is_approved = false;
        assert!(!gated.counts_as_unread_for(gated.receiver_id, Role::Admin));
    }

    #[test]
    fn strangers_are_not_parties_to_a_message() {
        let msg = sample_message();
        assert!(msg.is_party(msg.sender_id, Role::Employee));
        assert!(msg.is_party(msg.receiver_id, Role::Admin));
        assert!(!msg.is_party(Uuid::new_v4(), Role::Admin));
        assert!(!msg.is_party(msg.receiver_id, Role::Hr));
    }

    #[test]
    fn approval_gating_controls_inbox_visibility() {
        let mut msg = sample_message();
        msg.requires_approval = true;
        msg.is_approved = false;
        assert!(!msg.is_inbox_visible());

        msg.is_approved = true;
        assert!(msg.is_inbox_visible());

        msg.requires_approval = false;
        msg.is_approved = false;
        assert!(msg.is_inbox_visible());
    }

    fn sample_message() -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_key: Uuid::new_v4().to_string(),
            sender_id: Uuid::new_v4(),
            sender_role: Role::Employee,
            sender_name: "E. Sample".to_string(),
            sender_email: "e.sample@example.com".to_string(),
            receiver_id: Uuid::new_v4(),
            receiver_role: Role::Admin,
            content: "hello".to_string(),
            message_type: MessageType::Text,
            priority: MessagePriority::Normal,
            status: MessageStatus::Sent,
            is_read: false,
            read_by: sqlx::types::Json(Vec::new()),
            is_archived: false,
            archived_at: None,
            reply_to_id: None,
            is_reply: false,
            requires_approval: false,
            is_approved: true,
            created_at: Utc::now(),
        }
    }
}
