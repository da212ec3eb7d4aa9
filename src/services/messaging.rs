use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    api::websocket::PresenceHub,
    error::{AppError, AppResult},
    models::{
        has_read_receipt, receipt_marker, Conversation, ConversationSettings, ConversationType,
        ConversationWithDetails, Message, MessagePriority, MessageType, Participant,
        ParticipantWithIdentity, ProfileRef, ReadReceipt, ResolvedProfile, Role,
        UNREAD_COUNTABLE_SQL,
    },
    services::{
        conversation_key::{derive_pair_key, normalize_pair_key},
        events::{ConversationChanged, MessageRead, MessageReceived, MessageSent},
        identity::IdentityService,
        notify::NotificationDispatch,
        permissions,
    },
};

const NOTIFICATION_BODY_LIMIT: usize = 120;

pub struct MessagingService {
    db: PgPool,
    identity: IdentityService,
    hub: Arc<PresenceHub>,
    notify: Arc<dyn NotificationDispatch>,
}

impl MessagingService {
    pub fn new(db: PgPool, hub: Arc<PresenceHub>, notify: Arc<dyn NotificationDispatch>) -> Self {
        let identity = IdentityService::new(db.clone());
        Self {
            db,
            identity,
            hub,
            notify,
        }
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    /// Creates a conversation, deduplicating direct conversations against the
    /// existing active one for the same unordered pair.
    pub async fn create_conversation(
        &self,
        creator: &ResolvedProfile,
        participants: Vec<ProfileRef>,
        conversation_type: ConversationType,
        title: Option<String>,
        description: Option<String>,
    ) -> AppResult<ConversationWithDetails> {
        let (participants, direct_key) =
            prepare_participants(creator.profile, participants, conversation_type)?;

        if let Some(key) = &direct_key {
            let existing: Option<Conversation> = sqlx::query_as(
                "SELECT * FROM conversations WHERE direct_key = $1 AND conversation_type = 'direct' AND status = 'active'",
            )
            .bind(key)
            .fetch_optional(&self.db)
            .await?;

            if let Some(conv) = existing {
                return self.get_conversation(conv.id, creator.profile).await;
            }
        }

        let mut tx = self.db.begin().await?;

        let conv_id = Uuid::new_v4();
        // The partial unique index on direct_key closes the race between the
        // select above and this insert; on conflict the concurrent winner is
        // returned instead.
        let inserted: Option<Conversation> = sqlx::query_as(
            r#"
            INSERT INTO conversations (id, conversation_type, title, description, created_by, settings, status, direct_key, message_count)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, 0)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(conv_id)
        .bind(conversation_type)
        .bind(&title)
        .bind(&description)
        .bind(creator.id())
        .bind(sqlx::types::Json(ConversationSettings::default()))
        .bind(&direct_key)
        .fetch_optional(&mut *tx)
        .await?;

        let conversation = match settle_conversation_insert(inserted, direct_key)? {
            ConversationInsert::Created(conv) => conv,
            ConversationInsert::ExistingWins { direct_key } => {
                // Lost the direct_key race to a concurrent creator; hand the
                // winner back instead.
                tx.rollback().await?;
                let existing: Conversation = sqlx::query_as(
                    "SELECT * FROM conversations WHERE direct_key = $1 AND conversation_type = 'direct' AND status = 'active'",
                )
                .bind(&direct_key)
                .fetch_one(&self.db)
                .await?;
                return self.get_conversation(existing.id, creator.profile).await;
            }
        };

        for member in &participants {
            upsert_participant(&mut tx, conversation.id, *member).await?;
        }

        tx.commit().await?;

        let event = ConversationChanged::created(&conversation);
        for member in &participants {
            self.hub.broadcast_to_user(*member, event.clone()).await;
        }

        self.get_conversation(conversation.id, creator.profile).await
    }

    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
        requester: ProfileRef,
    ) -> AppResult<ConversationWithDetails> {
        self.require_active_participant(conversation_id, requester)
            .await?;

        let conversation: Conversation = sqlx::query_as(
            "SELECT * FROM conversations WHERE id = $1 AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

        let participants: Vec<Participant> = sqlx::query_as(
            "SELECT * FROM conversation_participants WHERE conversation_id = $1 AND is_active ORDER BY joined_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;

        let mut enriched = Vec::with_capacity(participants.len());
        for participant in participants {
            let identity = self
                .identity
                .resolve(participant.profile_id, participant.role)
                .await?;
            enriched.push(ParticipantWithIdentity {
                participant,
                identity,
            });
        }

        let key = conversation_id.to_string();
        let unread_count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM messages WHERE conversation_key = $1 AND receiver_id = $2 AND receiver_role = $3 AND {}",
            UNREAD_COUNTABLE_SQL
        ))
        .bind(&key)
        .bind(requester.id())
        .bind(requester.role())
        .fetch_one(&self.db)
        .await?;

        let last_message: Option<Message> = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_key = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(&key)
        .fetch_optional(&self.db)
        .await?;

        Ok(ConversationWithDetails {
            conversation,
            participants: enriched,
            unread_count: unread_count.0,
            last_message,
        })
    }

    pub async fn list_conversations(
        &self,
        requester: ProfileRef,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ConversationWithDetails>> {
        let conversations: Vec<Conversation> = sqlx::query_as(
            r#"
            SELECT c.* FROM conversations c
            JOIN conversation_participants p ON c.id = p.conversation_id
            WHERE p.profile_id = $1 AND p.role = $2 AND p.is_active AND c.status != 'deleted'
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(requester.id())
        .bind(requester.role())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        let mut result = Vec::with_capacity(conversations.len());
        for conv in conversations {
            result.push(self.get_conversation(conv.id, requester).await?);
        }
        Ok(result)
    }

    /// Sends into a Conversation-backed thread. The permission matrix is
    /// checked against every other active participant before anything is
    /// persisted.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender: &ResolvedProfile,
        content: String,
        message_type: MessageType,
        priority: MessagePriority,
        reply_to: Option<Uuid>,
    ) -> AppResult<Message> {
        if content.trim().is_empty() {
            return Err(AppError::MissingField("content"));
        }

        // Soft-deleted conversations read as missing. Participant rows
        // survive deletion, so the status check cannot be left to the
        // participant lookup below.
        let conversation: Conversation =
            sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or(AppError::ConversationNotFound)?;
        if conversation.is_deleted() {
            return Err(AppError::ConversationNotFound);
        }

        self.require_active_participant(conversation_id, sender.profile)
            .await?;

        let others: Vec<Participant> = sqlx::query_as(
            r#"
            SELECT * FROM conversation_participants
            WHERE conversation_id = $1 AND is_active AND NOT (profile_id = $2 AND role = $3)
            ORDER BY joined_at
            "#,
        )
        .bind(conversation_id)
        .bind(sender.id())
        .bind(sender.role())
        .fetch_all(&self.db)
        .await?;

        if others.is_empty() {
            return Err(AppError::InvalidParticipants);
        }

        let roles: Vec<Role> = others.iter().map(|p| p.role).collect();
        let requires_approval = permissions::check_recipients(sender.role(), &roles)?;

        // Receiver of record: the other side of a direct thread, otherwise
        // the longest-standing other participant. Unread counts key off it.
        let receiver = &others[0];

        let message = self
            .persist_message(NewMessage {
                conversation_key: conversation_id.to_string(),
                sender,
                receiver: ProfileRef::new(receiver.role, receiver.profile_id),
                content,
                message_type,
                priority,
                reply_to,
                requires_approval,
            })
            .await?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = $2, last_message_id = $3, message_count = message_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(message.created_at)
        .bind(message.id)
        .execute(&self.db)
        .await?;

        self.fan_out(&message, sender, others.iter().map(|p| ProfileRef::new(p.role, p.profile_id)))
            .await;

        Ok(message)
    }

    /// Messages of a conversation, newest first. For two-party direct
    /// threads this also surfaces rows stored under a duplicate key for the
    /// same two identities, matched by resolved email (merge-on-read
    /// compensation for pre-normalization data).
    pub async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
        requester: ProfileRef,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Message>> {
        self.require_active_participant(conversation_id, requester)
            .await?;

        let conversation: Conversation = sqlx::query_as(
            "SELECT * FROM conversations WHERE id = $1 AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

        let key = conversation_id.to_string();

        if conversation.conversation_type == ConversationType::Direct {
            let participants: Vec<Participant> = sqlx::query_as(
                "SELECT * FROM conversation_participants WHERE conversation_id = $1 AND is_active ORDER BY joined_at",
            )
            .bind(conversation_id)
            .fetch_all(&self.db)
            .await?;

            if participants.len() == 2 {
                let a = self
                    .identity
                    .resolve(participants[0].profile_id, participants[0].role)
                    .await?;
                let b = self
                    .identity
                    .resolve(participants[1].profile_id, participants[1].role)
                    .await?;

                return Ok(sqlx::query_as(
                    r#"
                    SELECT * FROM messages
                    WHERE conversation_key = $1
                       OR (sender_email = $2 AND receiver_id = $3)
                       OR (sender_email = $4 AND receiver_id = $5)
                    ORDER BY created_at DESC
                    LIMIT $6 OFFSET $7
                    "#,
                )
                .bind(&key)
                .bind(&a.email)
                .bind(b.id())
                .bind(&b.email)
                .bind(a.id())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await?);
            }
        }

        Ok(sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_key = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(&key)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?)
    }

    /// Legacy two-party send: no Conversation row, messages keyed by the
    /// derived pair key.
    pub async fn send_pair_message(
        &self,
        sender: &ResolvedProfile,
        receiver: ProfileRef,
        content: String,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> AppResult<Message> {
        if content.trim().is_empty() {
            return Err(AppError::MissingField("content"));
        }

        let requires_approval =
            permissions::check_recipients(sender.role(), &[receiver.role()])?;

        let message = self
            .persist_message(NewMessage {
                conversation_key: derive_pair_key(sender.profile, receiver),
                sender,
                receiver,
                content,
                message_type,
                priority,
                reply_to: None,
                requires_approval,
            })
            .await?;

        self.fan_out(&message, sender, std::iter::once(receiver)).await;

        Ok(message)
    }

    /// History of a legacy pair thread, merged across duplicate keys by
    /// resolved email identity.
    pub async fn pair_history(
        &self,
        requester: &ResolvedProfile,
        other: ProfileRef,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Message>> {
        let other_identity = self.identity.resolve_ref(other).await?;
        let key = derive_pair_key(requester.profile, other);

        Ok(sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE conversation_key = $1
               OR (sender_email = $2 AND receiver_id = $3)
               OR (sender_email = $4 AND receiver_id = $5)
            ORDER BY created_at DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(&key)
        .bind(&requester.email)
        .bind(other.id())
        .bind(&other_identity.email)
        .bind(requester.id())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?)
    }

    /// Idempotent read receipt. A repeat read by the same reader changes
    /// nothing and emits nothing. Only a party to the message or an active
    /// conversation participant may mark it.
    pub async fn mark_as_read(
        &self,
        message_id: Uuid,
        reader: ProfileRef,
    ) -> AppResult<Message> {
        let message: Message = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(AppError::MessageNotFound)?;

        self.require_read_access(&message, reader).await?;

        if has_read_receipt(&message.read_by.0, reader.id(), reader.role()) {
            return Ok(message);
        }

        let read_at = Utc::now();
        let receipt = ReadReceipt {
            profile_id: reader.id(),
            role: reader.role(),
            read_at,
        };
        let receiver_read =
            message.receiver_id == reader.id() && message.receiver_role == reader.role();

        // Atomic append. The containment guard keys idempotence off the row
        // itself, so two readers (or one reader racing against themselves)
        // append rather than overwrite each other's receipts.
        let updated: Option<Message> = sqlx::query_as(
            r#"
            UPDATE messages
            SET read_by = read_by || $2::jsonb,
                is_read = CASE WHEN $3 THEN true ELSE is_read END,
                status = CASE WHEN $3 THEN 'read'::message_status ELSE status END
            WHERE id = $1 AND NOT read_by @> $4::jsonb
            RETURNING *
            "#,
        )
        .bind(message_id)
        .bind(sqlx::types::Json([&receipt]))
        .bind(receiver_read)
        .bind(receipt_marker(reader.id(), reader.role()))
        .fetch_optional(&self.db)
        .await?;

        // None means a concurrent request by the same reader won; nothing
        // changed here and nothing is emitted.
        let Some(message) = updated else {
            return Ok(message);
        };

        let receipt = MessageRead::receipt(&message, reader, read_at);
        self.hub
            .broadcast_to_user(
                ProfileRef::new(message.sender_role, message.sender_id),
                receipt,
            )
            .await;

        Ok(message)
    }

    /// Read access: a party to the message, or for conversation-backed
    /// threads an active participant.
    async fn require_read_access(&self, message: &Message, reader: ProfileRef) -> AppResult<()> {
        if message.is_party(reader.id(), reader.role()) {
            return Ok(());
        }
        if let Ok(conversation_id) = message.conversation_key.parse::<Uuid>() {
            return self
                .require_active_participant(conversation_id, reader)
                .await;
        }
        Err(AppError::NotParticipant)
    }

    /// Bulk-marks everything unread addressed to `reader` in the scope.
    /// `scope` is either a conversation UUID string or a legacy pair key.
    pub async fn mark_conversation_seen(
        &self,
        scope: &str,
        reader: ProfileRef,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET is_read = true, status = 'read'
            WHERE conversation_key = $1 AND receiver_id = $2 AND NOT is_read
            "#,
        )
        .bind(scope)
        .bind(reader.id())
        .execute(&self.db)
        .await?;

        if let Ok(conversation_id) = scope.parse::<Uuid>() {
            sqlx::query(
                r#"
                UPDATE conversation_participants
                SET last_seen_at = NOW()
                WHERE conversation_id = $1 AND profile_id = $2 AND role = $3
                "#,
            )
            .bind(conversation_id)
            .bind(reader.id())
            .bind(reader.role())
            .execute(&self.db)
            .await?;
        }

        Ok(result.rows_affected())
    }

    /// Unread messages addressed to `reader`, excluding approval-gated ones.
    pub async fn unread_count(&self, reader: ProfileRef) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = $1 AND receiver_role = $2 AND {}",
            UNREAD_COUNTABLE_SQL
        ))
        .bind(reader.id())
        .bind(reader.role())
        .fetch_one(&self.db)
        .await?;
        Ok(count.0)
    }

    /// Admin approval for an employee-to-admin message. Idempotent.
    pub async fn approve_message(
        &self,
        message_id: Uuid,
        approver: &ResolvedProfile,
    ) -> AppResult<Message> {
        if approver.role() != Role::Admin {
            return Err(AppError::AdminOnly);
        }

        let message: Message = sqlx::query_as(
            "UPDATE messages SET is_approved = true WHERE id = $1 RETURNING *",
        )
        .bind(message_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::MessageNotFound)?;

        Ok(message)
    }

    pub async fn archive_message(
        &self,
        message_id: Uuid,
        requester: ProfileRef,
    ) -> AppResult<Message> {
        let message: Message = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(AppError::MessageNotFound)?;

        if message.sender_id != requester.id() && message.receiver_id != requester.id() {
            return Err(AppError::NotParticipant);
        }

        Ok(sqlx::query_as(
            "UPDATE messages SET is_archived = true, archived_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(message_id)
        .fetch_one(&self.db)
        .await?)
    }

    /// Administrative override. Message history is otherwise append-only.
    pub async fn delete_message(
        &self,
        message_id: Uuid,
        requester: &ResolvedProfile,
    ) -> AppResult<()> {
        if requester.role() != Role::Admin {
            return Err(AppError::AdminOnly);
        }

        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::MessageNotFound);
        }
        Ok(())
    }

    /// Adds (or reactivates) a participant.
    pub async fn add_participant(
        &self,
        conversation_id: Uuid,
        requester: ProfileRef,
        new_member: ProfileRef,
    ) -> AppResult<ConversationWithDetails> {
        self.require_active_participant(conversation_id, requester)
            .await?;

        let conversation: Conversation = sqlx::query_as(
            "SELECT * FROM conversations WHERE id = $1 AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

        if !conversation.settings.0.allow_new_participants {
            return Err(AppError::BadRequest(
                "Conversation does not allow new participants".to_string(),
            ));
        }
        if conversation.conversation_type == ConversationType::Direct {
            return Err(AppError::BadRequest(
                "Direct conversations cannot gain participants".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;
        upsert_participant(&mut tx, conversation_id, new_member).await?;
        sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.emit_conversation_updated(conversation_id).await?;
        self.get_conversation(conversation_id, requester).await
    }

    /// Deactivates a participant. Their later sends fail as NotParticipant;
    /// history stays intact.
    pub async fn remove_participant(
        &self,
        conversation_id: Uuid,
        requester: &ResolvedProfile,
        target: ProfileRef,
    ) -> AppResult<()> {
        let self_removal = requester.profile == target;
        if !self_removal && requester.role() != Role::Admin {
            return Err(AppError::AdminOnly);
        }
        self.require_active_participant(conversation_id, requester.profile)
            .await?;

        let result = sqlx::query(
            r#"
            UPDATE conversation_participants
            SET is_active = false
            WHERE conversation_id = $1 AND profile_id = $2 AND role = $3 AND is_active
            "#,
        )
        .bind(conversation_id)
        .bind(target.id())
        .bind(target.role())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotParticipant);
        }

        sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.db)
            .await?;

        self.emit_conversation_updated(conversation_id).await?;
        Ok(())
    }

    /// Maintenance job: rewrites legacy pair keys stored before the
    /// order-independence rule to their canonical form, merging split
    /// threads. Returns the number of rewritten messages.
    pub async fn normalize_legacy_keys(&self, requester: &ResolvedProfile) -> AppResult<u64> {
        if requester.role() != Role::Admin {
            return Err(AppError::AdminOnly);
        }

        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT conversation_key FROM messages WHERE conversation_key LIKE '%|%'",
        )
        .fetch_all(&self.db)
        .await?;

        let mut rewritten = 0u64;
        for (key,) in keys {
            let Some(normalized) = normalize_pair_key(&key) else {
                tracing::warn!("Skipping unparseable legacy key: {}", key);
                continue;
            };
            if normalized == key {
                continue;
            }
            let result = sqlx::query(
                "UPDATE messages SET conversation_key = $2 WHERE conversation_key = $1",
            )
            .bind(&key)
            .bind(&normalized)
            .execute(&self.db)
            .await?;
            rewritten += result.rows_affected();
            tracing::info!(
                "Normalized legacy key {} -> {} ({} messages)",
                key,
                normalized,
                result.rows_affected()
            );
        }

        Ok(rewritten)
    }

    async fn require_active_participant(
        &self,
        conversation_id: Uuid,
        profile: ProfileRef,
    ) -> AppResult<()> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = $1 AND profile_id = $2 AND role = $3 AND is_active",
        )
        .bind(conversation_id)
        .bind(profile.id())
        .bind(profile.role())
        .fetch_optional(&self.db)
        .await?;

        if row.is_none() {
            return Err(AppError::NotParticipant);
        }
        Ok(())
    }

    async fn persist_message(&self, new: NewMessage<'_>) -> AppResult<Message> {
        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (
                id, conversation_key,
                sender_id, sender_role, sender_name, sender_email,
                receiver_id, receiver_role,
                content, message_type, priority, status,
                is_read, read_by, is_archived,
                reply_to_id, is_reply,
                requires_approval, is_approved
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'sent', false, '[]'::jsonb, false, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.conversation_key)
        .bind(new.sender.id())
        .bind(new.sender.role())
        .bind(&new.sender.name)
        .bind(&new.sender.email)
        .bind(new.receiver.id())
        .bind(new.receiver.role())
        .bind(&new.content)
        .bind(new.message_type)
        .bind(new.priority)
        .bind(new.reply_to)
        .bind(new.reply_to.is_some())
        .bind(new.requires_approval)
        .bind(!new.requires_approval)
        .fetch_one(&self.db)
        .await?;

        Ok(message)
    }

    /// Real-time fan-out and offline hand-off. Best effort: persisted state
    /// is the source of truth, so nothing here can fail the send.
    async fn fan_out(
        &self,
        message: &Message,
        sender: &ResolvedProfile,
        recipients: impl Iterator<Item = ProfileRef>,
    ) {
        self.hub
            .broadcast_to_user(sender.profile, MessageSent::from_message(message))
            .await;

        let received = MessageReceived::from_message(message);
        let mut body: String = message.content.chars().take(NOTIFICATION_BODY_LIMIT).collect();
        if body.len() < message.content.len() {
            body.push('…');
        }

        for recipient in recipients {
            self.hub.broadcast_to_user(recipient, received.clone()).await;
            self.notify
                .dispatch(
                    recipient,
                    &format!("New message from {}", sender.name),
                    &body,
                    serde_json::json!({
                        "message_id": message.id,
                        "conversation_id": message.conversation_key,
                    }),
                )
                .await;
        }
    }

    async fn emit_conversation_updated(&self, conversation_id: Uuid) -> AppResult<()> {
        let conversation: Option<Conversation> =
            sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.db)
                .await?;

        let Some(conversation) = conversation else {
            return Ok(());
        };

        let participants: Vec<Participant> = sqlx::query_as(
            "SELECT * FROM conversation_participants WHERE conversation_id = $1 AND is_active",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;

        let event = ConversationChanged::updated(&conversation);
        for p in participants {
            self.hub
                .broadcast_to_user(ProfileRef::new(p.role, p.profile_id), event.clone())
                .await;
        }
        Ok(())
    }
}

/// Validates and canonicalizes the participant set for a new conversation.
/// The creator is always included, duplicate `(profileId, role)` pairs
/// collapse, and direct threads must net out to exactly two participants,
/// yielding their order-independent dedupe key.
fn prepare_participants(
    creator: ProfileRef,
    mut participants: Vec<ProfileRef>,
    conversation_type: ConversationType,
) -> AppResult<(Vec<ProfileRef>, Option<String>)> {
    if !participants.contains(&creator) {
        participants.push(creator);
    }

    let mut seen = HashSet::new();
    participants.retain(|p| seen.insert(*p));

    if participants.len() < 2 {
        return Err(AppError::InvalidParticipants);
    }

    let direct_key = match conversation_type {
        ConversationType::Direct => {
            if participants.len() != 2 {
                return Err(AppError::InvalidParticipants);
            }
            Some(derive_pair_key(participants[0], participants[1]))
        }
        _ => None,
    };

    Ok((participants, direct_key))
}

/// Outcome of the guarded conversation insert. `None` from the insert means
/// the partial unique index saw an existing active direct thread, which then
/// wins over the new row.
enum ConversationInsert {
    Created(Conversation),
    ExistingWins { direct_key: String },
}

fn settle_conversation_insert(
    inserted: Option<Conversation>,
    direct_key: Option<String>,
) -> AppResult<ConversationInsert> {
    match inserted {
        Some(conv) => Ok(ConversationInsert::Created(conv)),
        None => {
            let direct_key = direct_key.ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "conversation insert conflict without a direct key"
                ))
            })?;
            Ok(ConversationInsert::ExistingWins { direct_key })
        }
    }
}

struct NewMessage<'a> {
    conversation_key: String,
    sender: &'a ResolvedProfile,
    receiver: ProfileRef,
    content: String,
    message_type: MessageType,
    priority: MessagePriority,
    reply_to: Option<Uuid>,
    requires_approval: bool,
}

// Re-adding an existing (profileId, role) pair reactivates instead of
// duplicating.
async fn upsert_participant(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    conversation_id: Uuid,
    member: ProfileRef,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO conversation_participants (id, conversation_id, profile_id, role, joined_at, is_active)
        VALUES ($1, $2, $3, $4, NOW(), true)
        ON CONFLICT (conversation_id, profile_id, role)
        DO UPDATE SET is_active = true
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(conversation_id)
    .bind(member.id())
    .bind(member.role())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConversationStatus;

    #[test]
    fn direct_threads_derive_the_same_key_from_either_side() {
        let a = ProfileRef::Employee(Uuid::new_v4());
        let b = ProfileRef::Employee(Uuid::new_v4());

        let (_, key_ab) = prepare_participants(a, vec![b], ConversationType::Direct).unwrap();
        let (_, key_ba) = prepare_participants(b, vec![a], ConversationType::Direct).unwrap();

        // Both creators hit the same direct_key, so the partial unique index
        // holds at most one active direct conversation for the pair.
        assert_eq!(key_ab, key_ba);
        assert!(key_ab.is_some());
    }

    #[test]
    fn participant_set_collapses_duplicates_and_includes_the_creator() {
        let creator = ProfileRef::Hr(Uuid::new_v4());
        let other = ProfileRef::Employee(Uuid::new_v4());

        let (participants, key) = prepare_participants(
            creator,
            vec![other, other, creator],
            ConversationType::Direct,
        )
        .unwrap();

        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&creator));
        assert!(key.is_some());
    }

    #[test]
    fn conversations_need_at_least_two_distinct_participants() {
        let creator = ProfileRef::Admin(Uuid::new_v4());

        let err = prepare_participants(creator, vec![creator], ConversationType::Group)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidParticipants));

        // Direct threads are exactly two; a third member is rejected.
        let err = prepare_participants(
            creator,
            vec![
                ProfileRef::Employee(Uuid::new_v4()),
                ProfileRef::Employee(Uuid::new_v4()),
            ],
            ConversationType::Direct,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidParticipants));
    }

    #[test]
    fn insert_conflict_on_a_direct_key_yields_the_existing_thread() {
        let key = "Employee:a|Employee:b".to_string();

        match settle_conversation_insert(None, Some(key.clone())).unwrap() {
            ConversationInsert::ExistingWins { direct_key } => assert_eq!(direct_key, key),
            ConversationInsert::Created(_) => panic!("conflict must defer to the existing row"),
        }

        // A conflict without a direct key has no row to defer to.
        assert!(settle_conversation_insert(None, None).is_err());
    }

    #[test]
    fn clean_insert_keeps_the_new_conversation() {
        let conv = sample_conversation();
        let id = conv.id;
        match settle_conversation_insert(Some(conv), None).unwrap() {
            ConversationInsert::Created(conv) => assert_eq!(conv.id, id),
            ConversationInsert::ExistingWins { .. } => panic!("no conflict occurred"),
        }
    }

    fn sample_conversation() -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Group,
            title: Some("Quarterly review".to_string()),
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
}
