use relay_core::{
    Conversation, ConversationId, ConversationKind, ConversationMember, MemberRole, Message,
    MessageId, ReceiptState, UserId,
};
use relay_dal::{ConversationListRow, HistoryFilter, SharedDatastore};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

use crate::cursor::{HistoryCursor, ListingCursor};
use crate::error::ChatError;

const MAX_PAGE_LIMIT: usize = 100;
const MAX_SEARCH_LIMIT: usize = 50;
const DEFAULT_PAGE_LIMIT: usize = 50;
const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationPage {
    pub items: Vec<ConversationListRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationDetails {
    pub conversation: Conversation,
    pub members: Vec<ConversationMember>,
    pub archived: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub before: Option<OffsetDateTime>,
    pub after: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// The request/reply chat facade. Every operation is gated on the caller's
/// membership; administration additionally requires an admin or owner role.
pub struct ChatService {
    store: SharedDatastore,
}

impl ChatService {
    pub fn new(store: SharedDatastore) -> Self {
        Self { store }
    }

    async fn require_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<ConversationMember, ChatError> {
        let member = self
            .store
            .member(conversation, user)
            .await?
            .filter(|m| m.is_active)
            .ok_or(ChatError::NotMember)?;
        Ok(member)
    }

    async fn require_admin(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<ConversationMember, ChatError> {
        let member = self.require_member(conversation, user).await?;
        if !member.role.can_administer() {
            return Err(ChatError::Forbidden(
                "administrator role required".into(),
            ));
        }
        Ok(member)
    }

    fn page_limit(limit: Option<usize>, default: usize, max: usize) -> Result<usize, ChatError> {
        let limit = limit.unwrap_or(default);
        if limit == 0 || limit > max {
            return Err(ChatError::Validation(format!(
                "limit must be within 1..={max}"
            )));
        }
        Ok(limit)
    }

    /// Creates a conversation. For the direct kind an existing active direct
    /// conversation between the pair is returned instead of a duplicate; the
    /// second element of the result says whether a new one was created.
    #[instrument(name = "chat.create_conversation", skip_all, fields(creator = %creator))]
    pub async fn create_conversation(
        &self,
        creator: &UserId,
        request: CreateConversationRequest,
    ) -> Result<(Conversation, bool), ChatError> {
        let mut participants: Vec<UserId> = Vec::new();
        for user in std::iter::once(creator).chain(request.participant_ids.iter()) {
            if user.as_str().trim().is_empty() {
                return Err(ChatError::Validation("empty participant id".into()));
            }
            if !participants.contains(user) {
                participants.push(user.clone());
            }
        }

        match request.kind {
            ConversationKind::Direct if participants.len() != 2 => {
                return Err(ChatError::Validation(
                    "direct conversations have exactly two participants".into(),
                ));
            }
            ConversationKind::Group if participants.is_empty() => {
                return Err(ChatError::Validation(
                    "group conversations need at least one participant".into(),
                ));
            }
            _ => {}
        }

        let missing = self.store.missing_users(&participants).await?;
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|u| u.as_str()).collect();
            return Err(ChatError::Validation(format!(
                "unknown participants: {}",
                names.join(", ")
            )));
        }

        if request.kind == ConversationKind::Direct {
            if let Some(existing) = self
                .store
                .find_direct_between(&participants[0], &participants[1])
                .await?
            {
                return Ok((existing, false));
            }
        }

        let now = OffsetDateTime::now_utc();
        let conversation = Conversation {
            id: ConversationId::new(format!("conv-{}", Uuid::new_v4())),
            kind: request.kind,
            title: request.title,
            description: request.description,
            is_active: true,
            created_at: now,
            last_message_id: None,
            last_message_at: None,
        };
        let members = participants
            .iter()
            .map(|user| ConversationMember {
                conversation_id: conversation.id.clone(),
                user_id: user.clone(),
                role: if user == creator {
                    MemberRole::Owner
                } else {
                    MemberRole::Member
                },
                is_active: true,
                joined_at: now,
            })
            .collect();
        self.store
            .create_conversation(conversation.clone(), members)
            .await?;
        metrics::counter!("relay_conversations_created_total").increment(1);
        Ok((conversation, true))
    }

    /// Active memberships ordered by last activity, newest first, with a
    /// cursor that pages with no duplicates and no gaps.
    pub async fn list_conversations(
        &self,
        user: &UserId,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<ConversationPage, ChatError> {
        let limit = Self::page_limit(limit, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)?;
        let cursor = match cursor {
            Some(raw) => Some(
                ListingCursor::decode(raw)
                    .ok_or_else(|| ChatError::Validation("malformed cursor".into()))?
                    .0,
            ),
            None => None,
        };
        let items = self
            .store
            .list_conversations_for(user, limit, cursor)
            .await?;
        let next_cursor = (items.len() == limit)
            .then(|| {
                items.last().map(|row| {
                    ListingCursor(relay_dal::ListCursor {
                        last_message_at: row.conversation.last_message_at,
                        id: row.conversation.id.clone(),
                    })
                    .encode()
                })
            })
            .flatten();
        Ok(ConversationPage { items, next_cursor })
    }

    pub async fn conversation_details(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<ConversationDetails, ChatError> {
        self.require_member(conversation, user).await?;
        let record = self
            .store
            .conversation(conversation)
            .await?
            .ok_or(ChatError::NotFound)?;
        let members = self.store.members(conversation).await?;
        let archived = self.store.is_archived(conversation, user).await?;
        Ok(ConversationDetails {
            conversation: record,
            members,
            archived,
        })
    }

    /// Paginated history in ascending time order. Cursor pagination is
    /// primary; `before`/`after` are timestamp filters on top of it.
    pub async fn get_messages(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        request: HistoryRequest,
    ) -> Result<HistoryPage, ChatError> {
        self.require_member(conversation, user).await?;
        let limit = Self::page_limit(request.limit, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)?;
        let after_id = match &request.cursor {
            Some(raw) => Some(
                HistoryCursor::decode(raw)
                    .ok_or_else(|| ChatError::Validation("malformed cursor".into()))?
                    .0,
            ),
            None => None,
        };
        let messages = self
            .store
            .history(
                conversation,
                user,
                &HistoryFilter {
                    limit,
                    after_id,
                    before: request.before,
                    after: request.after,
                },
                true,
            )
            .await?;
        let next_cursor = (messages.len() == limit)
            .then(|| messages.last().map(|m| HistoryCursor(m.id).encode()))
            .flatten();
        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    /// Records `read` receipts for the listed messages. Idempotent; returns
    /// the ids that were newly marked read, for the `messages_read`
    /// broadcast to other participants.
    #[instrument(name = "chat.mark_read", skip_all, fields(conversation_id = %conversation, user = %user))]
    pub async fn mark_read(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>, ChatError> {
        self.require_member(conversation, user).await?;
        let mut newly_read = Vec::new();
        for id in message_ids {
            let Some(message) = self.store.message(conversation, id).await? else {
                continue;
            };
            if &message.sender_id == user {
                continue;
            }
            if self
                .store
                .record_receipt(id, user, ReceiptState::Read)
                .await?
            {
                newly_read.push(*id);
            }
        }
        Ok(newly_read)
    }

    /// Adds participants; admin-gated. Returns the users actually added.
    pub async fn add_participants(
        &self,
        conversation: &ConversationId,
        actor: &UserId,
        users: &[UserId],
    ) -> Result<Vec<UserId>, ChatError> {
        self.require_admin(conversation, actor).await?;
        let record = self
            .store
            .conversation(conversation)
            .await?
            .ok_or(ChatError::NotFound)?;
        if !record.is_active {
            return Err(ChatError::Validation(
                "conversation is inactive".into(),
            ));
        }
        let missing = self.store.missing_users(users).await?;
        if !missing.is_empty() {
            return Err(ChatError::Validation("unknown participants".into()));
        }
        let mut added = Vec::new();
        for user in users {
            let existing = self.store.member(conversation, user).await?;
            if existing.as_ref().is_some_and(|m| m.is_active) {
                continue;
            }
            self.store
                .add_member(ConversationMember {
                    conversation_id: conversation.clone(),
                    user_id: user.clone(),
                    role: MemberRole::Member,
                    is_active: true,
                    joined_at: OffsetDateTime::now_utc(),
                })
                .await?;
            added.push(user.clone());
        }
        Ok(added)
    }

    /// Removes (deactivates) a participant. Admin-gated, except that any
    /// member may remove themself. The owner cannot be removed; ownership
    /// must be transferred first.
    pub async fn remove_participant(
        &self,
        conversation: &ConversationId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<(), ChatError> {
        if actor != target {
            self.require_admin(conversation, actor).await?;
        } else {
            self.require_member(conversation, actor).await?;
        }
        let member = self
            .store
            .member(conversation, target)
            .await?
            .filter(|m| m.is_active)
            .ok_or(ChatError::NotMember)?;
        if member.role == MemberRole::Owner {
            return Err(ChatError::LastOwner);
        }
        self.store.deactivate_member(conversation, target).await?;
        Ok(())
    }

    /// Role changes. Granting `owner` transfers ownership and is reserved to
    /// the current owner (who becomes an admin); demoting the owner directly
    /// is forbidden since it would leave no owner.
    pub async fn update_role(
        &self,
        conversation: &ConversationId,
        actor: &UserId,
        target: &UserId,
        role: MemberRole,
    ) -> Result<(), ChatError> {
        let actor_member = self.require_member(conversation, actor).await?;
        let target_member = self
            .store
            .member(conversation, target)
            .await?
            .filter(|m| m.is_active)
            .ok_or(ChatError::NotMember)?;

        if role == MemberRole::Owner {
            if actor_member.role != MemberRole::Owner {
                return Err(ChatError::Forbidden(
                    "only the owner can transfer ownership".into(),
                ));
            }
            if target == actor {
                return Ok(());
            }
            self.store
                .update_member_role(conversation, target, MemberRole::Owner)
                .await?;
            self.store
                .update_member_role(conversation, actor, MemberRole::Admin)
                .await?;
            return Ok(());
        }

        if target_member.role == MemberRole::Owner {
            return Err(ChatError::LastOwner);
        }
        if !actor_member.role.can_administer() {
            return Err(ChatError::Forbidden("administrator role required".into()));
        }
        self.store
            .update_member_role(conversation, target, role)
            .await?;
        Ok(())
    }

    pub async fn set_message_pinned(
        &self,
        conversation: &ConversationId,
        actor: &UserId,
        message: &MessageId,
        pinned: bool,
    ) -> Result<(), ChatError> {
        self.require_admin(conversation, actor).await?;
        if !self.store.set_pinned(conversation, message, pinned).await? {
            return Err(ChatError::NotFound);
        }
        Ok(())
    }

    /// Per-viewer archive flag; membership-gated.
    pub async fn set_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        archived: bool,
    ) -> Result<(), ChatError> {
        self.require_member(conversation, user).await?;
        self.store.set_archived(conversation, user, archived).await?;
        Ok(())
    }

    pub async fn search(
        &self,
        user: &UserId,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = Self::page_limit(limit, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT)?;
        if query.trim().is_empty() {
            return Err(ChatError::Validation("query must not be empty".into()));
        }
        Ok(self.store.search(user, query.trim(), limit).await?)
    }

    /// Search scoped to one conversation; membership-gated. Ranking and the
    /// limit apply within the conversation, so busier conversations elsewhere
    /// cannot crowd its matches out.
    pub async fn search_in_conversation(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        self.require_member(conversation, user).await?;
        let limit = Self::page_limit(limit, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT)?;
        if query.trim().is_empty() {
            return Err(ChatError::Validation("query must not be empty".into()));
        }
        Ok(self
            .store
            .search_in_conversation(conversation, query.trim(), limit)
            .await?)
    }

    pub async fn unread_count(&self, user: &UserId) -> Result<i64, ChatError> {
        Ok(self.store.unread_total(user).await?)
    }

    /// Sender-only edit; deleted messages cannot be edited.
    pub async fn edit_message(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message: &MessageId,
        content: String,
    ) -> Result<(), ChatError> {
        self.require_member(conversation, user).await?;
        let record = self
            .store
            .message(conversation, message)
            .await?
            .ok_or(ChatError::NotFound)?;
        if &record.sender_id != user {
            return Err(ChatError::Forbidden(
                "only the sender can edit a message".into(),
            ));
        }
        if !self.store.mark_edited(conversation, message, content).await? {
            return Err(ChatError::Forbidden(
                "deleted messages cannot be edited".into(),
            ));
        }
        Ok(())
    }

    /// Soft delete by the sender or an administrator.
    pub async fn delete_message(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message: &MessageId,
    ) -> Result<(), ChatError> {
        let member = self.require_member(conversation, user).await?;
        let record = self
            .store
            .message(conversation, message)
            .await?
            .ok_or(ChatError::NotFound)?;
        if &record.sender_id != user && !member.role.can_administer() {
            return Err(ChatError::Forbidden(
                "only the sender or an administrator can delete a message".into(),
            ));
        }
        self.store.soft_delete(conversation, message, user).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        CorrelationId, EnvelopeMetadata, MessageEnvelope, MessageType, Priority,
    };
    use relay_dal::{ConversationStore, MemoryDatastore, MessageStore};
    use std::sync::Arc;

    fn service_with_store() -> (ChatService, Arc<MemoryDatastore>) {
        let store = Arc::new(MemoryDatastore::new());
        for user in ["u-1", "u-2", "u-3"] {
            store.add_user(UserId::from(user));
        }
        (ChatService::new(store.clone()), store)
    }

    async fn group(
        service: &ChatService,
        creator: &str,
        participants: &[&str],
    ) -> Conversation {
        let (conversation, created) = service
            .create_conversation(
                &UserId::from(creator),
                CreateConversationRequest {
                    kind: ConversationKind::Group,
                    participant_ids: participants.iter().map(|p| UserId::from(*p)).collect(),
                    title: Some("room".into()),
                    description: None,
                },
            )
            .await
            .expect("create group");
        assert!(created);
        conversation
    }

    fn envelope(conversation: &ConversationId, sender: &str, content: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId::generate(),
            conversation_id: conversation.clone(),
            sender_id: UserId::from(sender),
            created_at: OffsetDateTime::now_utc(),
            payload_key: None,
            idempotency_key: format!("idem_{}", MessageId::generate()),
            correlation_id: CorrelationId::generate(),
            metadata: EnvelopeMetadata {
                content: Some(content.into()),
                content_type: MessageType::Text,
                priority: Priority::Normal,
                retry_count: 0,
                recipient_ids: Vec::new(),
                client: None,
                flags: None,
                attachments: Vec::new(),
                media_url: None,
            },
        }
    }

    #[tokio::test]
    async fn direct_conversations_are_unique_per_pair() {
        let (service, _) = service_with_store();
        let request = CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![UserId::from("u-2")],
            title: None,
            description: None,
        };
        let (first, created) = service
            .create_conversation(&UserId::from("u-1"), request.clone())
            .await
            .unwrap();
        assert!(created);
        let (second, created) = service
            .create_conversation(&UserId::from("u-1"), request)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn direct_conversation_requires_exactly_two() {
        let (service, _) = service_with_store();
        let err = service
            .create_conversation(
                &UserId::from("u-1"),
                CreateConversationRequest {
                    kind: ConversationKind::Direct,
                    participant_ids: vec![UserId::from("u-2"), UserId::from("u-3")],
                    title: None,
                    description: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn unknown_participants_are_rejected() {
        let (service, _) = service_with_store();
        let err = service
            .create_conversation(
                &UserId::from("u-1"),
                CreateConversationRequest {
                    kind: ConversationKind::Group,
                    participant_ids: vec![UserId::from("u-ghost")],
                    title: None,
                    description: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("u-ghost"));
    }

    #[tokio::test]
    async fn creator_becomes_owner() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let member = store
            .member(&conversation.id, &UserId::from("u-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.role, MemberRole::Owner);
    }

    #[tokio::test]
    async fn listing_rejects_limit_over_max() {
        let (service, _) = service_with_store();
        assert!(
            service
                .list_conversations(&UserId::from("u-1"), Some(100), None)
                .await
                .is_ok()
        );
        let err = service
            .list_conversations(&UserId::from("u-1"), Some(101), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn listing_pages_without_duplicates() {
        let (service, store) = service_with_store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let conversation = group(&service, "u-1", &["u-2"]).await;
            store
                .persist_envelope(&envelope(&conversation.id, "u-2", &format!("m{i}")))
                .await
                .unwrap();
            ids.push(conversation.id.clone());
        }

        let user = UserId::from("u-1");
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = service
                .list_conversations(&user, Some(2), cursor.as_deref())
                .await
                .unwrap();
            for row in &page.items {
                assert!(!seen.contains(&row.conversation.id), "duplicate in paging");
                seen.push(row.conversation.id.clone());
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), ids.len());
    }

    #[tokio::test]
    async fn details_are_membership_gated() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        assert!(
            service
                .conversation_details(&conversation.id, &UserId::from("u-2"))
                .await
                .is_ok()
        );
        let err = service
            .conversation_details(&conversation.id, &UserId::from("u-3"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_member");
    }

    #[tokio::test]
    async fn history_limit_boundary() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let user = UserId::from("u-1");
        assert!(
            service
                .get_messages(
                    &conversation.id,
                    &user,
                    HistoryRequest { limit: Some(100), ..Default::default() }
                )
                .await
                .is_ok()
        );
        let err = service
            .get_messages(
                &conversation.id,
                &user,
                HistoryRequest { limit: Some(101), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn history_pages_in_order_with_cursor() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        for i in 0..5 {
            store
                .persist_envelope(&envelope(&conversation.id, "u-1", &format!("m{i}")))
                .await
                .unwrap();
        }
        let user = UserId::from("u-2");
        let first = service
            .get_messages(
                &conversation.id,
                &user,
                HistoryRequest { limit: Some(2), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[0].content.as_deref(), Some("m0"));
        let second = service
            .get_messages(
                &conversation.id,
                &user,
                HistoryRequest {
                    limit: Some(10),
                    cursor: first.next_cursor,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[0].content.as_deref(), Some("m2"));
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_skips_own_messages() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let theirs = envelope(&conversation.id, "u-1", "hello");
        let mine = envelope(&conversation.id, "u-2", "mine");
        store.persist_envelope(&theirs).await.unwrap();
        store.persist_envelope(&mine).await.unwrap();

        let reader = UserId::from("u-2");
        let newly = service
            .mark_read(
                &conversation.id,
                &reader,
                &[theirs.message_id, mine.message_id],
            )
            .await
            .unwrap();
        assert_eq!(newly, vec![theirs.message_id]);

        let again = service
            .mark_read(&conversation.id, &reader, &[theirs.message_id])
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn role_administration_rules() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2", "u-3"]).await;
        let owner = UserId::from("u-1");
        let member = UserId::from("u-2");
        let other = UserId::from("u-3");

        // Members cannot administer.
        let err = service
            .update_role(&conversation.id, &member, &other, MemberRole::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        // Owner promotes an admin; admins can change member roles.
        service
            .update_role(&conversation.id, &owner, &member, MemberRole::Admin)
            .await
            .unwrap();
        service
            .update_role(&conversation.id, &member, &other, MemberRole::Admin)
            .await
            .unwrap();

        // Only the owner can transfer ownership.
        let err = service
            .update_role(&conversation.id, &member, &other, MemberRole::Owner)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        // Demoting the owner directly would leave no owner.
        let err = service
            .update_role(&conversation.id, &member, &owner, MemberRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "last_owner");

        // Transfer keeps exactly one owner.
        service
            .update_role(&conversation.id, &owner, &member, MemberRole::Owner)
            .await
            .unwrap();
        let new_owner = store
            .member(&conversation.id, &member)
            .await
            .unwrap()
            .unwrap();
        let old_owner = store.member(&conversation.id, &owner).await.unwrap().unwrap();
        assert_eq!(new_owner.role, MemberRole::Owner);
        assert_eq!(old_owner.role, MemberRole::Admin);
    }

    #[tokio::test]
    async fn owner_cannot_be_removed() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        service
            .update_role(
                &conversation.id,
                &UserId::from("u-1"),
                &UserId::from("u-2"),
                MemberRole::Admin,
            )
            .await
            .unwrap();
        let err = service
            .remove_participant(&conversation.id, &UserId::from("u-2"), &UserId::from("u-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "last_owner");
    }

    #[tokio::test]
    async fn members_may_leave_without_admin_rights() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        service
            .remove_participant(&conversation.id, &UserId::from("u-2"), &UserId::from("u-2"))
            .await
            .unwrap();
        let member = store
            .member(&conversation.id, &UserId::from("u-2"))
            .await
            .unwrap()
            .unwrap();
        assert!(!member.is_active);
    }

    #[tokio::test]
    async fn add_participants_is_admin_gated_and_idempotent() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;

        let err = service
            .add_participants(&conversation.id, &UserId::from("u-2"), &[UserId::from("u-3")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let added = service
            .add_participants(&conversation.id, &UserId::from("u-1"), &[UserId::from("u-3")])
            .await
            .unwrap();
        assert_eq!(added, vec![UserId::from("u-3")]);

        let added_again = service
            .add_participants(&conversation.id, &UserId::from("u-1"), &[UserId::from("u-3")])
            .await
            .unwrap();
        assert!(added_again.is_empty());
    }

    #[tokio::test]
    async fn pins_are_admin_gated() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let env = envelope(&conversation.id, "u-1", "pin me");
        store.persist_envelope(&env).await.unwrap();

        let err = service
            .set_message_pinned(&conversation.id, &UserId::from("u-2"), &env.message_id, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        service
            .set_message_pinned(&conversation.id, &UserId::from("u-1"), &env.message_id, true)
            .await
            .unwrap();
        let message = store
            .message(&conversation.id, &env.message_id)
            .await
            .unwrap()
            .unwrap();
        assert!(message.is_pinned);
    }

    #[tokio::test]
    async fn archive_is_a_personal_flag() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        service
            .set_archived(&conversation.id, &UserId::from("u-2"), true)
            .await
            .unwrap();
        let for_two = service
            .conversation_details(&conversation.id, &UserId::from("u-2"))
            .await
            .unwrap();
        assert!(for_two.archived);
        let for_one = service
            .conversation_details(&conversation.id, &UserId::from("u-1"))
            .await
            .unwrap();
        assert!(!for_one.archived);
    }

    #[tokio::test]
    async fn scoped_search_is_not_crowded_out_by_busier_conversations() {
        let (service, store) = service_with_store();
        let quiet = group(&service, "u-1", &["u-2"]).await;
        let busy = group(&service, "u-1", &["u-2"]).await;

        store
            .persist_envelope(&envelope(&quiet.id, "u-1", "deploy finished"))
            .await
            .unwrap();
        // Enough newer matches in the busy conversation to fill any global
        // top-N slice on their own.
        for _ in 0..10 {
            store
                .persist_envelope(&envelope(&busy.id, "u-2", "deploy chatter"))
                .await
                .unwrap();
        }

        let hits = service
            .search_in_conversation(&quiet.id, &UserId::from("u-1"), "deploy", Some(3))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content.as_deref(), Some("deploy finished"));
        assert!(hits.iter().all(|m| m.conversation_id == quiet.id));
    }

    #[tokio::test]
    async fn scoped_search_is_membership_gated() {
        let (service, _) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let err = service
            .search_in_conversation(&conversation.id, &UserId::from("u-3"), "x", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_member");
    }

    #[tokio::test]
    async fn search_limit_boundary() {
        let (service, _) = service_with_store();
        assert!(
            service
                .search(&UserId::from("u-1"), "hello", Some(50))
                .await
                .is_ok()
        );
        let err = service
            .search(&UserId::from("u-1"), "hello", Some(51))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn edit_is_sender_only() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let env = envelope(&conversation.id, "u-1", "original");
        store.persist_envelope(&env).await.unwrap();

        let err = service
            .edit_message(
                &conversation.id,
                &UserId::from("u-2"),
                &env.message_id,
                "hijack".into(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        service
            .edit_message(
                &conversation.id,
                &UserId::from("u-1"),
                &env.message_id,
                "fixed".into(),
            )
            .await
            .unwrap();
        let message = store
            .message(&conversation.id, &env.message_id)
            .await
            .unwrap()
            .unwrap();
        assert!(message.is_edited);
        assert_eq!(message.content.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn admins_may_delete_others_messages() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let env = envelope(&conversation.id, "u-2", "offensive");
        store.persist_envelope(&env).await.unwrap();

        service
            .delete_message(&conversation.id, &UserId::from("u-1"), &env.message_id)
            .await
            .unwrap();
        let message = store
            .message(&conversation.id, &env.message_id)
            .await
            .unwrap()
            .unwrap();
        assert!(message.is_deleted);
        assert_eq!(message.deleted_by, Some(UserId::from("u-1")));
    }

    #[tokio::test]
    async fn unread_count_reflects_receipts() {
        let (service, store) = service_with_store();
        let conversation = group(&service, "u-1", &["u-2"]).await;
        let env = envelope(&conversation.id, "u-1", "hello");
        store.persist_envelope(&env).await.unwrap();

        let reader = UserId::from("u-2");
        assert_eq!(service.unread_count(&reader).await.unwrap(), 1);
        service
            .mark_read(&conversation.id, &reader, &[env.message_id])
            .await
            .unwrap();
        assert_eq!(service.unread_count(&reader).await.unwrap(), 0);
    }
}
