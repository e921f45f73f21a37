use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use relay_core::{
    Conversation, ConversationId, ConversationMember, MemberRole, Message, MessageEnvelope,
    MessageId, ReceiptState, UserId,
};
use time::OffsetDateTime;

use crate::error::DalError;
use crate::store::{
    ConversationListRow, ConversationStore, HistoryFilter, ListCursor, MessageStore,
    PersistOutcome, ReceiptStore,
};

#[derive(Default)]
struct State {
    users: HashSet<UserId>,
    conversations: HashMap<ConversationId, Conversation>,
    members: HashMap<ConversationId, Vec<ConversationMember>>,
    messages: HashMap<ConversationId, Vec<Message>>,
    by_idem: HashMap<String, (ConversationId, MessageId)>,
    receipt_rows: HashSet<(MessageId, UserId, ReceiptState)>,
    archived: HashSet<(ConversationId, UserId)>,
    blocked: HashSet<(ConversationId, UserId)>,
}

/// In-memory datastore with the same semantics as the Postgres one; used in
/// tests and mock-mode runs.
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an account row (the user graph itself is owned elsewhere).
    pub fn add_user(&self, user: UserId) {
        self.lock().users.insert(user);
    }

    pub fn block_user(&self, conversation: ConversationId, user: UserId) {
        self.lock().blocked.insert((conversation, user));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn unread_in(state: &State, conversation: &ConversationId, viewer: &UserId) -> i64 {
        state
            .messages
            .get(conversation)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| {
                        &m.sender_id != viewer
                            && !m.is_deleted
                            && !state.receipt_rows.contains(&(
                                m.id,
                                viewer.clone(),
                                ReceiptState::Read,
                            ))
                    })
                    .count() as i64
            })
            .unwrap_or(0)
    }

    fn visible_to(message: &Message, viewer: &UserId) -> bool {
        !message.is_deleted || message.deleted_by.as_ref() == Some(viewer)
    }

    fn list_key(conversation: &Conversation) -> (Option<OffsetDateTime>, ConversationId) {
        (conversation.last_message_at, conversation.id.clone())
    }
}

#[async_trait]
impl ConversationStore for MemoryDatastore {
    async fn create_conversation(
        &self,
        conversation: Conversation,
        members: Vec<ConversationMember>,
    ) -> Result<(), DalError> {
        let mut state = self.lock();
        state.members.insert(conversation.id.clone(), members);
        state
            .conversations
            .insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, DalError> {
        Ok(self.lock().conversations.get(id).cloned())
    }

    async fn find_direct_between(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<Conversation>, DalError> {
        let state = self.lock();
        Ok(state
            .conversations
            .values()
            .find(|conversation| {
                conversation.kind == relay_core::ConversationKind::Direct
                    && conversation.is_active
                    && state
                        .members
                        .get(&conversation.id)
                        .is_some_and(|members| {
                            let active: Vec<_> =
                                members.iter().filter(|m| m.is_active).collect();
                            active.iter().any(|m| &m.user_id == a)
                                && active.iter().any(|m| &m.user_id == b)
                        })
            })
            .cloned())
    }

    async fn member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<ConversationMember>, DalError> {
        Ok(self
            .lock()
            .members
            .get(conversation)
            .and_then(|members| members.iter().find(|m| &m.user_id == user))
            .cloned())
    }

    async fn members(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<ConversationMember>, DalError> {
        Ok(self.lock().members.get(conversation).cloned().unwrap_or_default())
    }

    async fn add_member(&self, member: ConversationMember) -> Result<(), DalError> {
        let mut state = self.lock();
        let members = state.members.entry(member.conversation_id.clone()).or_default();
        match members.iter_mut().find(|m| m.user_id == member.user_id) {
            Some(existing) => {
                existing.is_active = true;
                existing.role = member.role;
            }
            None => members.push(member),
        }
        Ok(())
    }

    async fn deactivate_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<(), DalError> {
        let mut state = self.lock();
        if let Some(members) = state.members.get_mut(conversation) {
            if let Some(member) = members.iter_mut().find(|m| &m.user_id == user) {
                member.is_active = false;
            }
        }
        Ok(())
    }

    async fn update_member_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: MemberRole,
    ) -> Result<(), DalError> {
        let mut state = self.lock();
        if let Some(members) = state.members.get_mut(conversation) {
            if let Some(member) = members.iter_mut().find(|m| &m.user_id == user) {
                member.role = role;
            }
        }
        Ok(())
    }

    async fn set_conversation_active(
        &self,
        conversation: &ConversationId,
        active: bool,
    ) -> Result<(), DalError> {
        let mut state = self.lock();
        if let Some(existing) = state.conversations.get_mut(conversation) {
            existing.is_active = active;
        }
        Ok(())
    }

    async fn set_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        archived: bool,
    ) -> Result<(), DalError> {
        let mut state = self.lock();
        let key = (conversation.clone(), user.clone());
        if archived {
            state.archived.insert(key);
        } else {
            state.archived.remove(&key);
        }
        Ok(())
    }

    async fn is_archived(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError> {
        Ok(self
            .lock()
            .archived
            .contains(&(conversation.clone(), user.clone())))
    }

    async fn list_conversations_for(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<ListCursor>,
    ) -> Result<Vec<ConversationListRow>, DalError> {
        let state = self.lock();
        let mut rows: Vec<(Conversation, MemberRole)> = state
            .members
            .iter()
            .filter_map(|(conversation_id, members)| {
                let member = members
                    .iter()
                    .find(|m| &m.user_id == user && m.is_active)?;
                let conversation = state.conversations.get(conversation_id)?;
                Some((conversation.clone(), member.role))
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| Self::list_key(b).cmp(&Self::list_key(a)));

        let cursor_key = cursor.map(|c| (c.last_message_at, c.id));
        let page: Vec<_> = rows
            .into_iter()
            .filter(|(conversation, _)| match &cursor_key {
                Some(cursor_key) => &Self::list_key(conversation) < cursor_key,
                None => true,
            })
            .take(limit)
            .collect();

        Ok(page
            .into_iter()
            .map(|(conversation, role)| {
                let unread_count = Self::unread_in(&state, &conversation.id, user);
                let participant_count = state
                    .members
                    .get(&conversation.id)
                    .map(|members| members.iter().filter(|m| m.is_active).count() as i64)
                    .unwrap_or(0);
                ConversationListRow {
                    conversation,
                    role,
                    unread_count,
                    participant_count,
                }
            })
            .collect())
    }

    async fn missing_users(&self, users: &[UserId]) -> Result<Vec<UserId>, DalError> {
        let state = self.lock();
        Ok(users
            .iter()
            .filter(|user| !state.users.contains(*user))
            .cloned()
            .collect())
    }

    async fn is_user_blocked(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DalError> {
        Ok(self
            .lock()
            .blocked
            .contains(&(conversation.clone(), user.clone())))
    }
}

#[async_trait]
impl MessageStore for MemoryDatastore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<MessageId>, DalError> {
        Ok(self.lock().by_idem.get(key).map(|(_, id)| *id))
    }

    async fn persist_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<PersistOutcome, DalError> {
        let mut state = self.lock();
        if state.by_idem.contains_key(&envelope.idempotency_key) {
            return Ok(PersistOutcome { inserted: false });
        }
        let flags = envelope.metadata.flags.clone().unwrap_or_default();
        let message = Message {
            id: envelope.message_id,
            conversation_id: envelope.conversation_id.clone(),
            sender_id: envelope.sender_id.clone(),
            content: envelope.metadata.content.clone(),
            content_type: envelope.metadata.content_type,
            created_at: envelope.created_at,
            idempotency_key: envelope.idempotency_key.clone(),
            correlation_id: envelope.correlation_id.to_string(),
            is_edited: flags.is_edited,
            is_deleted: flags.is_deleted,
            deleted_by: None,
            reply_to_id: flags.reply_to_id,
            thread_id: flags.thread_id,
            is_pinned: false,
        };
        state.by_idem.insert(
            envelope.idempotency_key.clone(),
            (envelope.conversation_id.clone(), envelope.message_id),
        );
        let messages = state.messages.entry(envelope.conversation_id.clone()).or_default();
        messages.push(message);
        messages.sort_by_key(|m| m.id);

        for recipient in envelope.recipients() {
            state.receipt_rows.insert((
                envelope.message_id,
                recipient.clone(),
                ReceiptState::Sent,
            ));
        }

        if let Some(conversation) = state.conversations.get_mut(&envelope.conversation_id) {
            if conversation
                .last_message_at
                .is_none_or(|at| at <= envelope.created_at)
            {
                conversation.last_message_id = Some(envelope.message_id);
                conversation.last_message_at = Some(envelope.created_at);
            }
        }
        Ok(PersistOutcome { inserted: true })
    }

    async fn message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<Option<Message>, DalError> {
        Ok(self
            .lock()
            .messages
            .get(conversation)
            .and_then(|messages| messages.iter().find(|m| &m.id == id))
            .cloned())
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        filter: &HistoryFilter,
        _use_replica: bool,
    ) -> Result<Vec<Message>, DalError> {
        let state = self.lock();
        let Some(messages) = state.messages.get(conversation) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .iter()
            .filter(|m| filter.after_id.is_none_or(|cursor| m.id > cursor))
            .filter(|m| filter.before.is_none_or(|ts| m.created_at < ts))
            .filter(|m| filter.after.is_none_or(|ts| m.created_at > ts))
            .filter(|m| Self::visible_to(m, viewer))
            .take(filter.limit.max(1))
            .cloned()
            .collect())
    }

    async fn search(
        &self,
        user: &UserId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError> {
        let state = self.lock();
        let needle = query.to_lowercase();
        let mut hits: Vec<Message> = state
            .members
            .iter()
            .filter(|(_, members)| {
                members.iter().any(|m| &m.user_id == user && m.is_active)
            })
            .filter_map(|(conversation_id, _)| state.messages.get(conversation_id))
            .flatten()
            .filter(|m| !m.is_deleted)
            .filter(|m| {
                m.content
                    .as_deref()
                    .is_some_and(|content| content.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_in_conversation(
        &self,
        conversation: &ConversationId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DalError> {
        let state = self.lock();
        let needle = query.to_lowercase();
        let mut hits: Vec<Message> = state
            .messages
            .get(conversation)
            .into_iter()
            .flatten()
            .filter(|m| !m.is_deleted)
            .filter(|m| {
                m.content
                    .as_deref()
                    .is_some_and(|content| content.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn mark_edited(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        content: String,
    ) -> Result<bool, DalError> {
        let mut state = self.lock();
        let Some(message) = state
            .messages
            .get_mut(conversation)
            .and_then(|messages| messages.iter_mut().find(|m| &m.id == id))
        else {
            return Ok(false);
        };
        if message.is_deleted {
            return Ok(false);
        }
        message.content = Some(content);
        message.is_edited = true;
        Ok(true)
    }

    async fn soft_delete(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        deleter: &UserId,
    ) -> Result<bool, DalError> {
        let mut state = self.lock();
        let Some(message) = state
            .messages
            .get_mut(conversation)
            .and_then(|messages| messages.iter_mut().find(|m| &m.id == id))
        else {
            return Ok(false);
        };
        message.is_deleted = true;
        message.deleted_by = Some(deleter.clone());
        Ok(true)
    }

    async fn set_pinned(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        pinned: bool,
    ) -> Result<bool, DalError> {
        let mut state = self.lock();
        let Some(message) = state
            .messages
            .get_mut(conversation)
            .and_then(|messages| messages.iter_mut().find(|m| &m.id == id))
        else {
            return Ok(false);
        };
        message.is_pinned = pinned;
        Ok(true)
    }
}

#[async_trait]
impl ReceiptStore for MemoryDatastore {
    async fn record_receipt(
        &self,
        message: &MessageId,
        recipient: &UserId,
        state: ReceiptState,
    ) -> Result<bool, DalError> {
        let mut guard = self.lock();
        let mut target_inserted = false;
        for implied in state.implied() {
            let inserted =
                guard
                    .receipt_rows
                    .insert((*message, recipient.clone(), *implied));
            if *implied == state {
                target_inserted = inserted;
            }
        }
        Ok(target_inserted)
    }

    async fn receipt_state(
        &self,
        message: &MessageId,
        recipient: &UserId,
    ) -> Result<Option<ReceiptState>, DalError> {
        let guard = self.lock();
        for state in [ReceiptState::Read, ReceiptState::Delivered, ReceiptState::Sent] {
            if guard
                .receipt_rows
                .contains(&(*message, recipient.clone(), state))
            {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    async fn unread_total(&self, user: &UserId) -> Result<i64, DalError> {
        let state = self.lock();
        Ok(state
            .members
            .iter()
            .filter(|(_, members)| {
                members.iter().any(|m| &m.user_id == user && m.is_active)
            })
            .map(|(conversation_id, _)| Self::unread_in(&state, conversation_id, user))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        ConversationKind, CorrelationId, EnvelopeMetadata, MessageType, Priority,
    };

    fn conversation(id: &str, kind: ConversationKind) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            kind,
            title: None,
            description: None,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            last_message_id: None,
            last_message_at: None,
        }
    }

    fn member(conversation: &str, user: &str, role: MemberRole) -> ConversationMember {
        ConversationMember {
            conversation_id: ConversationId::from(conversation),
            user_id: UserId::from(user),
            role,
            is_active: true,
            joined_at: OffsetDateTime::now_utc(),
        }
    }

    fn envelope(conversation: &str, sender: &str, content: &str, key: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId::generate(),
            conversation_id: ConversationId::from(conversation),
            sender_id: UserId::from(sender),
            created_at: OffsetDateTime::now_utc(),
            payload_key: None,
            idempotency_key: key.into(),
            correlation_id: CorrelationId::generate(),
            metadata: EnvelopeMetadata {
                content: Some(content.into()),
                content_type: MessageType::Text,
                priority: Priority::Normal,
                retry_count: 0,
                recipient_ids: vec![UserId::from(sender), UserId::from("u-2")],
                client: None,
                flags: None,
                attachments: Vec::new(),
                media_url: None,
            },
        }
    }

    async fn seeded() -> MemoryDatastore {
        let store = MemoryDatastore::new();
        store.add_user(UserId::from("u-1"));
        store.add_user(UserId::from("u-2"));
        store
            .create_conversation(
                conversation("c-1", ConversationKind::Direct),
                vec![
                    member("c-1", "u-1", MemberRole::Owner),
                    member("c-1", "u-2", MemberRole::Member),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn persist_is_idempotent_on_key() {
        let store = seeded().await;
        let env = envelope("c-1", "u-1", "hi", "client_abc");
        assert!(store.persist_envelope(&env).await.unwrap().inserted);
        let mut retry = envelope("c-1", "u-1", "hi", "client_abc");
        retry.message_id = MessageId::generate();
        assert!(!store.persist_envelope(&retry).await.unwrap().inserted);

        let history = store
            .history(
                &ConversationId::from("c-1"),
                &UserId::from("u-1"),
                &HistoryFilter { limit: 10, ..Default::default() },
                false,
            )
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            store.find_by_idempotency_key("client_abc").await.unwrap(),
            Some(env.message_id)
        );
    }

    #[tokio::test]
    async fn persist_records_sent_receipts_and_pointer() {
        let store = seeded().await;
        let env = envelope("c-1", "u-1", "hi", "client_abc");
        store.persist_envelope(&env).await.unwrap();

        assert_eq!(
            store
                .receipt_state(&env.message_id, &UserId::from("u-2"))
                .await
                .unwrap(),
            Some(ReceiptState::Sent)
        );
        // The sender gets no receipt row.
        assert_eq!(
            store
                .receipt_state(&env.message_id, &UserId::from("u-1"))
                .await
                .unwrap(),
            None
        );
        let conversation = store
            .conversation(&ConversationId::from("c-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id, Some(env.message_id));
    }

    #[tokio::test]
    async fn receipts_are_monotone_and_idempotent() {
        let store = seeded().await;
        let env = envelope("c-1", "u-1", "hi", "client_abc");
        store.persist_envelope(&env).await.unwrap();
        let recipient = UserId::from("u-2");

        assert!(
            store
                .record_receipt(&env.message_id, &recipient, ReceiptState::Read)
                .await
                .unwrap()
        );
        // Second read is an idempotent no-op.
        assert!(
            !store
                .record_receipt(&env.message_id, &recipient, ReceiptState::Read)
                .await
                .unwrap()
        );
        // Backwards transition is a no-op: read already implied delivered.
        assert!(
            !store
                .record_receipt(&env.message_id, &recipient, ReceiptState::Delivered)
                .await
                .unwrap()
        );
        assert_eq!(
            store
                .receipt_state(&env.message_id, &recipient)
                .await
                .unwrap(),
            Some(ReceiptState::Read)
        );
    }

    #[tokio::test]
    async fn unread_counts_ignore_own_and_read_messages() {
        let store = seeded().await;
        let viewer = UserId::from("u-2");
        let first = envelope("c-1", "u-1", "one", "k1");
        let second = envelope("c-1", "u-1", "two", "k2");
        let mine = envelope("c-1", "u-2", "mine", "k3");
        store.persist_envelope(&first).await.unwrap();
        store.persist_envelope(&second).await.unwrap();
        store.persist_envelope(&mine).await.unwrap();

        assert_eq!(store.unread_total(&viewer).await.unwrap(), 2);
        store
            .record_receipt(&first.message_id, &viewer, ReceiptState::Read)
            .await
            .unwrap();
        assert_eq!(store.unread_total(&viewer).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_orders_by_last_message_and_paginates_stably() {
        let store = seeded().await;
        for i in 2..=4 {
            let id = format!("c-{i}");
            store
                .create_conversation(
                    conversation(&id, ConversationKind::Group),
                    vec![member(&id, "u-1", MemberRole::Owner)],
                )
                .await
                .unwrap();
        }
        // Touch conversations in a known order: c-3, c-1, c-4 (c-2 silent).
        for id in ["c-3", "c-1", "c-4"] {
            store
                .persist_envelope(&envelope(id, "u-1", "hi", &format!("k-{id}")))
                .await
                .unwrap();
        }

        let user = UserId::from("u-1");
        let first_page = store.list_conversations_for(&user, 2, None).await.unwrap();
        let ids: Vec<_> = first_page
            .iter()
            .map(|row| row.conversation.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["c-4", "c-1"]);

        let cursor = ListCursor {
            last_message_at: first_page[1].conversation.last_message_at,
            id: first_page[1].conversation.id.clone(),
        };
        let second_page = store
            .list_conversations_for(&user, 10, Some(cursor))
            .await
            .unwrap();
        let ids: Vec<_> = second_page
            .iter()
            .map(|row| row.conversation.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["c-3", "c-2"]);
    }

    #[tokio::test]
    async fn listing_carries_aggregates() {
        let store = seeded().await;
        store
            .persist_envelope(&envelope("c-1", "u-1", "hi", "k1"))
            .await
            .unwrap();
        let rows = store
            .list_conversations_for(&UserId::from("u-2"), 10, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].unread_count, 1);
        assert_eq!(rows[0].participant_count, 2);
    }

    #[tokio::test]
    async fn deleted_messages_hidden_except_from_deleter() {
        let store = seeded().await;
        let env = envelope("c-1", "u-1", "oops", "k1");
        store.persist_envelope(&env).await.unwrap();
        store
            .soft_delete(
                &ConversationId::from("c-1"),
                &env.message_id,
                &UserId::from("u-1"),
            )
            .await
            .unwrap();

        let filter = HistoryFilter { limit: 10, ..Default::default() };
        let for_deleter = store
            .history(&ConversationId::from("c-1"), &UserId::from("u-1"), &filter, false)
            .await
            .unwrap();
        assert_eq!(for_deleter.len(), 1);
        let for_other = store
            .history(&ConversationId::from("c-1"), &UserId::from("u-2"), &filter, false)
            .await
            .unwrap();
        assert!(for_other.is_empty());
    }

    #[tokio::test]
    async fn edit_refuses_deleted_messages() {
        let store = seeded().await;
        let env = envelope("c-1", "u-1", "x", "k1");
        store.persist_envelope(&env).await.unwrap();
        let conv = ConversationId::from("c-1");
        assert!(
            store
                .mark_edited(&conv, &env.message_id, "y".into())
                .await
                .unwrap()
        );
        store
            .soft_delete(&conv, &env.message_id, &UserId::from("u-1"))
            .await
            .unwrap();
        assert!(
            !store
                .mark_edited(&conv, &env.message_id, "z".into())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn search_is_membership_gated_and_recency_ranked() {
        let store = seeded().await;
        store
            .create_conversation(
                conversation("c-private", ConversationKind::Group),
                vec![member("c-private", "u-3", MemberRole::Owner)],
            )
            .await
            .unwrap();
        store
            .persist_envelope(&envelope("c-1", "u-1", "deploy done", "k1"))
            .await
            .unwrap();
        store
            .persist_envelope(&envelope("c-private", "u-3", "deploy secret", "k2"))
            .await
            .unwrap();

        let hits = store
            .search(&UserId::from("u-2"), "deploy", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content.as_deref(), Some("deploy done"));
    }

    #[tokio::test]
    async fn scoped_search_stays_inside_the_conversation() {
        let store = seeded().await;
        store
            .create_conversation(
                conversation("c-2", ConversationKind::Group),
                vec![member("c-2", "u-1", MemberRole::Owner)],
            )
            .await
            .unwrap();
        store
            .persist_envelope(&envelope("c-1", "u-1", "deploy done", "k1"))
            .await
            .unwrap();
        // Newer matches elsewhere must not displace this conversation's hit.
        for i in 0..5 {
            store
                .persist_envelope(&envelope("c-2", "u-1", "deploy again", &format!("k-noise-{i}")))
                .await
                .unwrap();
        }

        let hits = store
            .search_in_conversation(&ConversationId::from("c-1"), "deploy", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content.as_deref(), Some("deploy done"));
    }

    #[tokio::test]
    async fn search_treats_like_metacharacters_literally() {
        let store = seeded().await;
        store
            .persist_envelope(&envelope("c-1", "u-1", "progress: 50% done", "k1"))
            .await
            .unwrap();
        store
            .persist_envelope(&envelope("c-1", "u-1", "snake_case names", "k2"))
            .await
            .unwrap();

        let user = UserId::from("u-2");
        assert_eq!(store.search(&user, "50%", 10).await.unwrap().len(), 1);
        assert_eq!(store.search(&user, "e_c", 10).await.unwrap().len(), 1);
        // `%` is not a wildcard: this would match "50% done" if it were.
        assert!(store.search(&user, "5%e", 10).await.unwrap().is_empty());
        assert_eq!(
            store
                .search_in_conversation(&ConversationId::from("c-1"), "50%", 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn direct_lookup_finds_existing_pair() {
        let store = seeded().await;
        let found = store
            .find_direct_between(&UserId::from("u-2"), &UserId::from("u-1"))
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(
            store
                .find_direct_between(&UserId::from("u-1"), &UserId::from("u-9"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn history_cursor_returns_strictly_after() {
        let store = seeded().await;
        let envs: Vec<_> = (0..4)
            .map(|i| envelope("c-1", "u-1", &format!("m{i}"), &format!("k{i}")))
            .collect();
        for env in &envs {
            store.persist_envelope(env).await.unwrap();
        }
        let page = store
            .history(
                &ConversationId::from("c-1"),
                &UserId::from("u-2"),
                &HistoryFilter {
                    limit: 10,
                    after_id: Some(envs[1].message_id),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, envs[2].message_id);
    }
}
