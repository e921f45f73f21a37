use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{
    Conversation, ConversationId, ConversationMember, MemberRole, Message, MessageEnvelope,
    MessageId, ReceiptState, UserId,
};
use time::OffsetDateTime;

use crate::error::DalError;

/// Outcome of the idempotency-guarded persistence upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    /// False means the idempotency key already had a row — a duplicate.
    pub inserted: bool,
}

/// One row of a conversation listing, with its batched aggregates.
#[derive(Debug, Clone)]
pub struct ConversationListRow {
    pub conversation: Conversation,
    pub role: MemberRole,
    pub unread_count: i64,
    pub participant_count: i64,
}

/// Position in the listing's (last-message timestamp, id) descending order;
/// results strictly after it are returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ListCursor {
    pub last_message_at: Option<OffsetDateTime>,
    pub id: ConversationId,
}

/// History page selector. `after_id` is the pagination cursor; `before` and
/// `after` are timestamp filters.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub limit: usize,
    pub after_id: Option<MessageId>,
    pub before: Option<OffsetDateTime>,
    pub after: Option<OffsetDateTime>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> Result<(), DalError>;

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, DalError>;

    /// The unique active direct conversation between two users, if any.
    async fn find_direct_between(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<Conversation>, DalError>;

    async fn member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<ConversationMember>, DalError>;

    async fn members(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<ConversationMember>, DalError>;

    async fn add_member(&self, member: ConversationMember) -> Result<(), DalError>;

    async fn deactivate_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<(), DalError>;

    async fn update_member_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: MemberRole,
    ) -> Result<(), DalError>;

    async fn set_conversation_active(
        &self,
        conversation: &ConversationId,
        active: bool,
    ) -> Result<(), DalError>;

    async fn set_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        archived: bool,
    ) -> Result<(), DalError>;

    async fn is_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError>;

    /// Active memberships ordered by last-message timestamp descending, with
    /// unread and participant counts fetched in a constant number of round
    /// trips regardless of page size.
    async fn list_conversations_for(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<ListCursor>,
    ) -> Result<Vec<ConversationListRow>, DalError>;

    /// Of the given users, those with no account row.
    async fn missing_users(&self, users: &[UserId]) -> Result<Vec<UserId>, DalError>;

    async fn is_user_blocked(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageId>, DalError>;

    /// The consumer's single persistence call: message row (unique on the
    /// idempotency key), `sent` receipts for every recipient, attachments,
    /// and the conversation's last-message pointer, all in one transaction.
    async fn persist_envelope(&self, envelope: &MessageEnvelope)
    -> Result<PersistOutcome, DalError>;

    async fn message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<Option<Message>, DalError>;

    /// Ascending history page. Soft-deleted messages are hidden from everyone
    /// but their deleter. `use_replica` requests replica routing, subject to
    /// the breaker.
    async fn history(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        filter: &HistoryFilter,
        use_replica: bool,
    ) -> Result<Vec<Message>, DalError>;

    /// Messages in the user's conversations matching `query`, newest first.
    /// The query is matched literally; LIKE metacharacters have no special
    /// meaning.
    async fn search(
        &self,
        user: &UserId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError>;

    /// Messages of one conversation matching `query`, newest first. Ranking
    /// and `limit` apply within the conversation, so matches elsewhere never
    /// crowd these out.
    async fn search_in_conversation(
        &self,
        conversation: &ConversationId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError>;

    async fn mark_edited(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        content: String,
    ) -> Result<bool, DalError>;

    async fn soft_delete(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        deleter: &UserId,
    ) -> Result<bool, DalError>;

    async fn set_pinned(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        pinned: bool,
    ) -> Result<bool, DalError>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Records a receipt, materializing the implied prior states. Returns
    /// true when the row for `state` itself was newly inserted; repeats and
    /// backward transitions are idempotent no-ops.
    async fn record_receipt(
        &self,
        message: &MessageId,
        recipient: &UserId,
        state: ReceiptState,
    ) -> Result<bool, DalError>;

    /// Highest state recorded for the pair.
    async fn receipt_state(
        &self,
        message: &MessageId,
        recipient: &UserId,
    ) -> Result<Option<ReceiptState>, DalError>;

    /// Unread messages across all of the user's active conversations.
    async fn unread_total(&self, user: &UserId) -> Result<i64, DalError>;
}

pub trait Datastore: ConversationStore + MessageStore + ReceiptStore {}
impl<T: ConversationStore + MessageStore + ReceiptStore> Datastore for T {}

pub type SharedDatastore = Arc<dyn Datastore>;
