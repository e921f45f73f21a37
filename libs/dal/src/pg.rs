use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    Conversation, ConversationId, ConversationKind, ConversationMember, MemberRole, Message,
    MessageEnvelope, MessageId, MessageType, ReceiptState, UserId,
};
use sqlx::Row;
use sqlx::postgres::PgRow;
use time::OffsetDateTime;
use tracing::instrument;

use crate::cache::CacheHandle;
use crate::error::DalError;
use crate::pool::DbPools;
use crate::store::{
    ConversationListRow, ConversationStore, HistoryFilter, ListCursor, MessageStore,
    PersistOutcome, ReceiptStore,
};

const CONVERSATION_CACHE_TTL: Duration = Duration::from_secs(30);

/// Postgres-backed datastore. Replica-eligible reads consult the breaker via
/// [`DbPools::read_pool`]; every envelope's write set runs in one transaction
/// on the primary.
pub struct PgDatastore {
    pools: DbPools,
    cache: CacheHandle,
}

impl PgDatastore {
    pub fn new(pools: DbPools, cache: CacheHandle) -> Self {
        Self { pools, cache }
    }

    /// Applies the schema idempotently.
    pub async fn ensure_schema(&self) -> Result<(), DalError> {
        sqlx::raw_sql(include_str!("../schema.sql"))
            .execute(self.pools.primary())
            .await?;
        Ok(())
    }

    pub fn pools(&self) -> &DbPools {
        &self.pools
    }

    fn conversation_cache_key(id: &ConversationId) -> String {
        format!("conv:{id}")
    }

    fn conversation_from_row(row: &PgRow) -> Result<Conversation, DalError> {
        let kind: String = row.try_get("kind")?;
        let last_message_id: Option<String> = row.try_get("last_message_id")?;
        Ok(Conversation {
            id: ConversationId::new(row.try_get::<String, _>("id")?),
            kind: match kind.as_str() {
                "direct" => ConversationKind::Direct,
                _ => ConversationKind::Group,
            },
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            last_message_id: last_message_id.as_deref().and_then(MessageId::parse),
            last_message_at: row.try_get("last_message_at")?,
        })
    }

    fn member_from_row(row: &PgRow) -> Result<ConversationMember, DalError> {
        let role: String = row.try_get("role")?;
        Ok(ConversationMember {
            conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            role: parse_role(&role)?,
            is_active: row.try_get("is_active")?,
            joined_at: row.try_get("joined_at")?,
        })
    }

    fn message_from_row(row: &PgRow) -> Result<Message, DalError> {
        let id: String = row.try_get("id")?;
        let content_type: String = row.try_get("content_type")?;
        let deleted_by: Option<String> = row.try_get("deleted_by")?;
        let reply_to_id: Option<String> = row.try_get("reply_to_id")?;
        Ok(Message {
            id: parse_message_id(&id)?,
            conversation_id: ConversationId::new(row.try_get::<String, _>("conversation_id")?),
            sender_id: UserId::new(row.try_get::<String, _>("sender_id")?),
            content: row.try_get("content")?,
            content_type: parse_content_type(&content_type)?,
            created_at: row.try_get("created_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            is_edited: row.try_get("is_edited")?,
            is_deleted: row.try_get("is_deleted")?,
            deleted_by: deleted_by.map(UserId::new),
            reply_to_id: reply_to_id.as_deref().and_then(MessageId::parse),
            thread_id: row.try_get("thread_id")?,
            is_pinned: row.try_get("is_pinned")?,
        })
    }
}

fn parse_role(raw: &str) -> Result<MemberRole, DalError> {
    match raw {
        "owner" => Ok(MemberRole::Owner),
        "admin" => Ok(MemberRole::Admin),
        "member" => Ok(MemberRole::Member),
        other => Err(DalError::Store(format!("unknown role {other:?}"))),
    }
}

fn parse_content_type(raw: &str) -> Result<MessageType, DalError> {
    match raw {
        "TEXT" => Ok(MessageType::Text),
        "IMAGE" => Ok(MessageType::Image),
        "FILE" => Ok(MessageType::File),
        "VOICE" => Ok(MessageType::Voice),
        other => Err(DalError::Store(format!("unknown content type {other:?}"))),
    }
}

fn parse_message_id(raw: &str) -> Result<MessageId, DalError> {
    MessageId::parse(raw).ok_or_else(|| DalError::Store(format!("bad message id {raw:?}")))
}

/// Neutralizes LIKE metacharacters so the caller's query is matched
/// literally, the same way the in-memory store's `contains` check behaves.
fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

async fn run_history(
    pool: &sqlx::PgPool,
    conversation: &ConversationId,
    viewer: &UserId,
    filter: &HistoryFilter,
) -> Result<Vec<PgRow>, sqlx::Error> {
    sqlx::query(
        "SELECT * FROM messages \
         WHERE conversation_id = $1 \
           AND ($2::text IS NULL OR id > $2) \
           AND ($3::timestamptz IS NULL OR created_at < $3) \
           AND ($4::timestamptz IS NULL OR created_at > $4) \
           AND (NOT is_deleted OR deleted_by = $5) \
         ORDER BY id ASC \
         LIMIT $6",
    )
    .bind(conversation.as_str())
    .bind(filter.after_id.map(|id| id.to_string()))
    .bind(filter.before)
    .bind(filter.after)
    .bind(viewer.as_str())
    .bind(filter.limit.max(1) as i64)
    .fetch_all(pool)
    .await
}

#[async_trait]
impl ConversationStore for PgDatastore {
    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> Result<(), DalError> {
        let mut tx = self.pools.primary().begin().await?;
        sqlx::query(
            "INSERT INTO conversations \
                 (id, kind, title, description, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(conversation.id.as_str())
        .bind(match conversation.kind {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        })
        .bind(&conversation.title)
        .bind(&conversation.description)
        .bind(conversation.is_active)
        .bind(conversation.created_at)
        .execute(&mut *tx)
        .await?;

        for member in &members {
            sqlx::query(
                "INSERT INTO conversation_members \
                     (conversation_id, user_id, role, is_active, joined_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (conversation_id, user_id) \
                 DO UPDATE SET is_active = EXCLUDED.is_active, role = EXCLUDED.role",
            )
            .bind(member.conversation_id.as_str())
            .bind(member.user_id.as_str())
            .bind(member.role.as_str())
            .bind(member.is_active)
            .bind(member.joined_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, DalError> {
        let cache_key = Self::conversation_cache_key(id);
        if let Some(cached) = self.cache.get_json::<Conversation>(&cache_key).await {
            return Ok(Some(cached));
        }
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(self.pools.primary())
            .await?;
        let conversation = row.as_ref().map(Self::conversation_from_row).transpose()?;
        if let Some(conversation) = &conversation {
            self.cache
                .put_json(&cache_key, conversation, CONVERSATION_CACHE_TTL)
                .await;
        }
        Ok(conversation)
    }

    async fn find_direct_between(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<Conversation>, DalError> {
        let row = sqlx::query(
            "SELECT c.* FROM conversations c \
             WHERE c.kind = 'direct' AND c.is_active \
               AND EXISTS (SELECT 1 FROM conversation_members m \
                           WHERE m.conversation_id = c.id AND m.user_id = $1 AND m.is_active) \
               AND EXISTS (SELECT 1 FROM conversation_members m \
                           WHERE m.conversation_id = c.id AND m.user_id = $2 AND m.is_active) \
             LIMIT 1",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .fetch_optional(self.pools.primary())
        .await?;
        row.as_ref().map(Self::conversation_from_row).transpose()
    }

    async fn member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<ConversationMember>, DalError> {
        let row = sqlx::query(
            "SELECT * FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .fetch_optional(self.pools.primary())
        .await?;
        row.as_ref().map(Self::member_from_row).transpose()
    }

    async fn members(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<ConversationMember>, DalError> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_members WHERE conversation_id = $1 ORDER BY joined_at",
        )
        .bind(conversation.as_str())
        .fetch_all(self.pools.primary())
        .await?;
        rows.iter().map(Self::member_from_row).collect()
    }

    async fn add_member(&self, member: ConversationMember) -> Result<(), DalError> {
        sqlx::query(
            "INSERT INTO conversation_members \
                 (conversation_id, user_id, role, is_active, joined_at) \
             VALUES ($1, $2, $3, TRUE, $4) \
             ON CONFLICT (conversation_id, user_id) \
             DO UPDATE SET is_active = TRUE, role = EXCLUDED.role",
        )
        .bind(member.conversation_id.as_str())
        .bind(member.user_id.as_str())
        .bind(member.role.as_str())
        .bind(member.joined_at)
        .execute(self.pools.primary())
        .await?;
        Ok(())
    }

    async fn deactivate_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<(), DalError> {
        sqlx::query(
            "UPDATE conversation_members SET is_active = FALSE \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .execute(self.pools.primary())
        .await?;
        Ok(())
    }

    async fn update_member_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: MemberRole,
    ) -> Result<(), DalError> {
        sqlx::query(
            "UPDATE conversation_members SET role = $3 \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .bind(role.as_str())
        .execute(self.pools.primary())
        .await?;
        Ok(())
    }

    async fn set_conversation_active(
        &self,
        conversation: &ConversationId,
        active: bool,
    ) -> Result<(), DalError> {
        sqlx::query("UPDATE conversations SET is_active = $2 WHERE id = $1")
            .bind(conversation.as_str())
            .bind(active)
            .execute(self.pools.primary())
            .await?;
        self.cache
            .invalidate(&Self::conversation_cache_key(conversation))
            .await;
        Ok(())
    }

    async fn set_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        archived: bool,
    ) -> Result<(), DalError> {
        if archived {
            sqlx::query(
                "INSERT INTO conversation_archives (conversation_id, user_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(conversation.as_str())
            .bind(user.as_str())
            .execute(self.pools.primary())
            .await?;
        } else {
            sqlx::query(
                "DELETE FROM conversation_archives WHERE conversation_id = $1 AND user_id = $2",
            )
            .bind(conversation.as_str())
            .bind(user.as_str())
            .execute(self.pools.primary())
            .await?;
        }
        Ok(())
    }

    async fn is_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM conversation_archives \
                            WHERE conversation_id = $1 AND user_id = $2) AS archived",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .fetch_one(self.pools.primary())
        .await?;
        Ok(row.try_get("archived")?)
    }

    #[instrument(name = "dal.list_conversations", skip(self), fields(user = %user))]
    async fn list_conversations_for(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<ListCursor>,
    ) -> Result<Vec<ConversationListRow>, DalError> {
        let (cursor_at, cursor_id) = match cursor {
            Some(cursor) => (cursor.last_message_at, Some(cursor.id.as_str().to_string())),
            None => (None, None),
        };
        // Page first, then two grouped aggregate queries over the page's ids:
        // a constant number of round trips regardless of page size.
        let rows = sqlx::query(
            "SELECT c.*, m.role FROM conversation_members m \
             JOIN conversations c ON c.id = m.conversation_id \
             WHERE m.user_id = $1 AND m.is_active \
               AND ($3::text IS NULL OR \
                    (COALESCE(c.last_message_at, 'epoch'::timestamptz), c.id) < \
                    (COALESCE($2::timestamptz, 'epoch'::timestamptz), $3)) \
             ORDER BY COALESCE(c.last_message_at, 'epoch'::timestamptz) DESC, c.id DESC \
             LIMIT $4",
        )
        .bind(user.as_str())
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit as i64)
        .fetch_all(self.pools.primary())
        .await?;

        let mut page = Vec::with_capacity(rows.len());
        for row in &rows {
            let conversation = Self::conversation_from_row(row)?;
            let role: String = row.try_get("role")?;
            page.push((conversation, parse_role(&role)?));
        }
        let ids: Vec<String> = page
            .iter()
            .map(|(conversation, _)| conversation.id.as_str().to_string())
            .collect();

        let unread_rows = sqlx::query(
            "SELECT m.conversation_id, COUNT(*) AS unread FROM messages m \
             WHERE m.conversation_id = ANY($1) AND m.sender_id <> $2 AND NOT m.is_deleted \
               AND NOT EXISTS (SELECT 1 FROM receipts r \
                               WHERE r.message_id = m.id AND r.recipient_id = $2 \
                                 AND r.state = 'read') \
             GROUP BY m.conversation_id",
        )
        .bind(&ids)
        .bind(user.as_str())
        .fetch_all(self.pools.primary())
        .await?;
        let participant_rows = sqlx::query(
            "SELECT conversation_id, COUNT(*) AS participants FROM conversation_members \
             WHERE conversation_id = ANY($1) AND is_active \
             GROUP BY conversation_id",
        )
        .bind(&ids)
        .fetch_all(self.pools.primary())
        .await?;

        let mut unread = std::collections::HashMap::new();
        for row in &unread_rows {
            let id: String = row.try_get("conversation_id")?;
            unread.insert(id, row.try_get::<i64, _>("unread")?);
        }
        let mut participants = std::collections::HashMap::new();
        for row in &participant_rows {
            let id: String = row.try_get("conversation_id")?;
            participants.insert(id, row.try_get::<i64, _>("participants")?);
        }

        Ok(page
            .into_iter()
            .map(|(conversation, role)| {
                let id = conversation.id.as_str().to_string();
                ConversationListRow {
                    unread_count: unread.get(&id).copied().unwrap_or(0),
                    participant_count: participants.get(&id).copied().unwrap_or(0),
                    conversation,
                    role,
                }
            })
            .collect())
    }

    async fn missing_users(&self, users: &[UserId]) -> Result<Vec<UserId>, DalError> {
        let ids: Vec<String> = users.iter().map(|u| u.as_str().to_string()).collect();
        let rows = sqlx::query("SELECT id FROM users WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(self.pools.primary())
            .await?;
        let mut known = std::collections::HashSet::new();
        for row in &rows {
            known.insert(row.try_get::<String, _>("id")?);
        }
        Ok(users
            .iter()
            .filter(|user| !known.contains(user.as_str()))
            .cloned()
            .collect())
    }

    async fn is_user_blocked(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM blocked_members \
                            WHERE conversation_id = $1 AND user_id = $2) AS blocked",
        )
        .bind(conversation.as_str())
        .bind(user.as_str())
        .fetch_one(self.pools.primary())
        .await?;
        Ok(row.try_get("blocked")?)
    }
}

#[async_trait]
impl MessageStore for PgDatastore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageId>, DalError> {
        let row = sqlx::query("SELECT id FROM messages WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(self.pools.primary())
            .await?;
        match row {
            Some(row) => Ok(Some(parse_message_id(&row.try_get::<String, _>("id")?)?)),
            None => Ok(None),
        }
    }

    #[instrument(
        name = "dal.persist_envelope",
        skip_all,
        fields(
            conversation_id = %envelope.conversation_id,
            message_id = %envelope.message_id
        )
    )]
    async fn persist_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<PersistOutcome, DalError> {
        let started = std::time::Instant::now();
        let flags = envelope.metadata.flags.clone().unwrap_or_default();
        let mut tx = self.pools.primary().begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO messages \
                 (id, conversation_id, sender_id, content, content_type, created_at, \
                  idempotency_key, correlation_id, is_edited, is_deleted, reply_to_id, thread_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(envelope.message_id.to_string())
        .bind(envelope.conversation_id.as_str())
        .bind(envelope.sender_id.as_str())
        .bind(&envelope.metadata.content)
        .bind(envelope.metadata.content_type.as_str())
        .bind(envelope.created_at)
        .bind(&envelope.idempotency_key)
        .bind(envelope.correlation_id.as_str())
        .bind(flags.is_edited)
        .bind(flags.is_deleted)
        .bind(flags.reply_to_id.map(|id| id.to_string()))
        .bind(&flags.thread_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback().await?;
            return Ok(PersistOutcome { inserted: false });
        }

        let recipients: Vec<String> = envelope
            .recipients()
            .map(|user| user.as_str().to_string())
            .collect();
        if !recipients.is_empty() {
            sqlx::query(
                "INSERT INTO receipts (message_id, recipient_id, state, recorded_at) \
                 SELECT $1, r, 'sent', $3 FROM unnest($2::text[]) AS r \
                 ON CONFLICT DO NOTHING",
            )
            .bind(envelope.message_id.to_string())
            .bind(&recipients)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;
        }

        for (position, attachment) in envelope.metadata.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO message_attachments (message_id, position, payload) \
                 VALUES ($1, $2, $3)",
            )
            .bind(envelope.message_id.to_string())
            .bind(position as i32)
            .bind(attachment.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE conversations SET last_message_id = $2, last_message_at = $3 \
             WHERE id = $1 AND (last_message_at IS NULL OR last_message_at <= $3)",
        )
        .bind(envelope.conversation_id.as_str())
        .bind(envelope.message_id.to_string())
        .bind(envelope.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.cache
            .invalidate(&Self::conversation_cache_key(&envelope.conversation_id))
            .await;
        metrics::histogram!("relay_persist_seconds").record(started.elapsed().as_secs_f64());
        Ok(PersistOutcome { inserted: true })
    }

    async fn message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<Option<Message>, DalError> {
        let row = sqlx::query("SELECT * FROM messages WHERE conversation_id = $1 AND id = $2")
            .bind(conversation.as_str())
            .bind(id.to_string())
            .fetch_optional(self.pools.primary())
            .await?;
        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        filter: &HistoryFilter,
        use_replica: bool,
    ) -> Result<Vec<Message>, DalError> {
        let (pool, routed_to_replica) = self.pools.read_pool(use_replica);
        let rows = match run_history(pool, conversation, viewer, filter).await {
            Ok(rows) => {
                if routed_to_replica {
                    self.pools.breaker().record_result(true);
                }
                rows
            }
            Err(err) if routed_to_replica => {
                // Replica read failed: reopen the gate and fall back to the
                // primary so the caller still gets an answer.
                self.pools.breaker().record_result(false);
                tracing::warn!(error = %err, "replica read failed; retrying on primary");
                run_history(self.pools.primary(), conversation, viewer, filter).await?
            }
            Err(err) => return Err(err.into()),
        };
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn search(
        &self,
        user: &UserId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError> {
        let rows = sqlx::query(
            "SELECT m.* FROM messages m \
             JOIN conversation_members cm \
               ON cm.conversation_id = m.conversation_id \
              AND cm.user_id = $1 AND cm.is_active \
             WHERE NOT m.is_deleted \
               AND m.content ILIKE '%' || $2 || '%' ESCAPE '\\' \
             ORDER BY m.created_at DESC, m.id DESC \
             LIMIT $3",
        )
        .bind(user.as_str())
        .bind(escape_like(query))
        .bind(limit as i64)
        .fetch_all(self.pools.primary())
        .await?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn search_in_conversation(
        &self,
        conversation: &ConversationId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError> {
        let rows = sqlx::query(
            "SELECT * FROM messages \
             WHERE conversation_id = $1 AND NOT is_deleted \
               AND content ILIKE '%' || $2 || '%' ESCAPE '\\' \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3",
        )
        .bind(conversation.as_str())
        .bind(escape_like(query))
        .bind(limit as i64)
        .fetch_all(self.pools.primary())
        .await?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn mark_edited(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        content: String,
    ) -> Result<bool, DalError> {
        let result = sqlx::query(
            "UPDATE messages SET content = $3, is_edited = TRUE \
             WHERE conversation_id = $1 AND id = $2 AND NOT is_deleted",
        )
        .bind(conversation.as_str())
        .bind(id.to_string())
        .bind(content)
        .execute(self.pools.primary())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        deleter: &UserId,
    ) -> Result<bool, DalError> {
        let result = sqlx::query(
            "UPDATE messages SET is_deleted = TRUE, deleted_by = $3 \
             WHERE conversation_id = $1 AND id = $2",
        )
        .bind(conversation.as_str())
        .bind(id.to_string())
        .bind(deleter.as_str())
        .execute(self.pools.primary())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_pinned(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        pinned: bool,
    ) -> Result<bool, DalError> {
        let result = sqlx::query(
            "UPDATE messages SET is_pinned = $3 WHERE conversation_id = $1 AND id = $2",
        )
        .bind(conversation.as_str())
        .bind(id.to_string())
        .bind(pinned)
        .execute(self.pools.primary())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReceiptStore for PgDatastore {
    async fn record_receipt(
        &self,
        message: &MessageId,
        recipient: &UserId,
        state: ReceiptState,
    ) -> Result<bool, DalError> {
        let states: Vec<String> = state
            .implied()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(
            "INSERT INTO receipts (message_id, recipient_id, state, recorded_at) \
             SELECT $1, $2, s, $4 FROM unnest($3::text[]) AS s \
             ON CONFLICT DO NOTHING \
             RETURNING state",
        )
        .bind(message.to_string())
        .bind(recipient.as_str())
        .bind(&states)
        .bind(OffsetDateTime::now_utc())
        .fetch_all(self.pools.primary())
        .await?;
        let mut target_inserted = false;
        for row in &rows {
            if row.try_get::<String, _>("state")? == state.as_str() {
                target_inserted = true;
            }
        }
        Ok(target_inserted)
    }

    async fn receipt_state(
        &self,
        message: &MessageId,
        recipient: &UserId,
    ) -> Result<Option<ReceiptState>, DalError> {
        let rows = sqlx::query(
            "SELECT state FROM receipts WHERE message_id = $1 AND recipient_id = $2",
        )
        .bind(message.to_string())
        .bind(recipient.as_str())
        .fetch_all(self.pools.primary())
        .await?;
        let mut best: Option<ReceiptState> = None;
        for row in &rows {
            let state = match row.try_get::<String, _>("state")?.as_str() {
                "read" => ReceiptState::Read,
                "delivered" => ReceiptState::Delivered,
                _ => ReceiptState::Sent,
            };
            if best.is_none_or(|current| state.follows(Some(current))) {
                best = Some(state);
            }
        }
        Ok(best)
    }

    async fn unread_total(&self, user: &UserId) -> Result<i64, DalError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unread FROM messages m \
             JOIN conversation_members cm \
               ON cm.conversation_id = m.conversation_id \
              AND cm.user_id = $1 AND cm.is_active \
             WHERE m.sender_id <> $1 AND NOT m.is_deleted \
               AND NOT EXISTS (SELECT 1 FROM receipts r \
                               WHERE r.message_id = m.id AND r.recipient_id = $1 \
                                 AND r.state = 'read')",
        )
        .bind(user.as_str())
        .fetch_one(self.pools.primary())
        .await?;
        Ok(row.try_get("unread")?)
    }
}
