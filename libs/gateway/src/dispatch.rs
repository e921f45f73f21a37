use std::sync::Arc;
use std::time::Duration;

use relay_chat::ChatService;
use relay_core::{
    ClientMeta, ConversationId, CorrelationId, MessageId, UserId, rfc3339,
};
use relay_dal::SharedDatastore;
use relay_pipeline::{Producer, SendRequest};
use relay_presence::SharedPresence;
use relay_replay::ReplayCache;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::protocol::{
    ClientEvent, ClientFrame, MarkReadPayload, ResumePayload, SendMessagePayload, ServerFrame,
    message_payload,
};
use crate::registry::SessionRegistry;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    /// Time allowed for token verification and for the auth first-frame.
    pub auth_timeout: Duration,
    pub dedupe_capacity: usize,
    pub instance_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(25_000),
            heartbeat_grace: Duration::from_millis(10_000),
            auth_timeout: Duration::from_secs(5),
            dedupe_capacity: 200,
            instance_id: "relay-dev".into(),
        }
    }
}

/// Event dispatch for authenticated sessions. Transport-independent: the
/// WebSocket loop feeds frames in, emissions leave through each session's
/// outbound channel.
pub struct Gateway {
    pub(crate) verifier: Arc<relay_auth::TokenVerifier>,
    pub(crate) producer: Arc<Producer>,
    pub(crate) chat: Arc<ChatService>,
    pub(crate) store: SharedDatastore,
    pub(crate) presence: SharedPresence,
    pub(crate) replay: Arc<ReplayCache>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) config: GatewayConfig,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<relay_auth::TokenVerifier>,
        producer: Arc<Producer>,
        chat: Arc<ChatService>,
        store: SharedDatastore,
        presence: SharedPresence,
        replay: Arc<ReplayCache>,
        registry: Arc<SessionRegistry>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            verifier,
            producer,
            chat,
            store,
            presence,
            replay,
            registry,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Handles one inbound frame on an authenticated session. A frame that
    /// cannot be serviced yields a single `error` event; the session stays
    /// open.
    pub async fn handle_frame(&self, session: &Arc<Session>, frame: ClientFrame) {
        let event = match ClientEvent::parse(&frame) {
            Ok(event) => event,
            Err(reason) => {
                session.emit_error(
                    &format!("malformed payload: {reason}"),
                    Some("invalid_schema"),
                    Some(&frame.event),
                );
                return;
            }
        };

        // Identity enforcement: a payload naming someone else is dropped
        // before any handler runs.
        if let Some(claimed) = event.claimed_user() {
            if claimed != &session.user_id {
                metrics::counter!("relay_identity_mismatch_total").increment(1);
                session.emit_error("userId mismatch", None, Some(event.name()));
                return;
            }
        }

        match event {
            ClientEvent::Auth(_) => {
                // Already authenticated; a repeated auth frame is harmless.
            }
            ClientEvent::Join(payload) => {
                self.handle_join(session, &payload.conversation_id).await;
            }
            ClientEvent::Leave(payload) => {
                self.handle_leave(session, &payload.conversation_id).await;
            }
            ClientEvent::Send(payload) => {
                self.handle_send(session, payload, frame.ack_id).await;
            }
            ClientEvent::Typing(payload) => {
                self.handle_typing(session, &payload.conversation_id, payload.is_typing);
            }
            ClientEvent::MarkRead(payload) => {
                self.handle_mark_read(session, payload).await;
            }
            ClientEvent::Resume(payload) => {
                self.handle_resume(session, payload, frame.ack_id).await;
            }
            ClientEvent::Unknown(name) => {
                debug!(event = %name, "ignoring unknown client event");
            }
        }
    }

    async fn is_active_member(&self, conversation: &ConversationId, user: &UserId) -> bool {
        matches!(
            self.store.member(conversation, user).await,
            Ok(Some(member)) if member.is_active
        )
    }

    async fn handle_join(&self, session: &Arc<Session>, conversation: &ConversationId) {
        if !self.is_active_member(conversation, &session.user_id).await {
            session.emit_error(
                "not a member of this conversation",
                Some("not_member"),
                Some("join_conversation"),
            );
            return;
        }
        self.registry.join_room(conversation, &session.socket_id);
        let now = rfc3339(OffsetDateTime::now_utc());
        session.emit(
            "conversation_joined",
            json!({
                "conversationId": conversation.as_str(),
                "userId": session.user_id.as_str(),
                "joinedAt": now,
            }),
        );
        self.registry.broadcast_to_room(
            conversation,
            Some(&session.socket_id),
            "user_joined",
            &json!({
                "conversationId": conversation.as_str(),
                "userId": session.user_id.as_str(),
                "socketId": session.socket_id.as_str(),
                "timestamp": now,
            }),
        );
    }

    async fn handle_leave(&self, session: &Arc<Session>, conversation: &ConversationId) {
        self.registry.leave_room(conversation, &session.socket_id);
        let now = rfc3339(OffsetDateTime::now_utc());
        session.emit(
            "conversation_left",
            json!({
                "conversationId": conversation.as_str(),
                "userId": session.user_id.as_str(),
                "timestamp": now,
            }),
        );
        self.registry.broadcast_to_room(
            conversation,
            Some(&session.socket_id),
            "user_left",
            &json!({
                "conversationId": conversation.as_str(),
                "userId": session.user_id.as_str(),
                "socketId": session.socket_id.as_str(),
                "timestamp": now,
            }),
        );
    }

    async fn handle_send(
        &self,
        session: &Arc<Session>,
        payload: SendMessagePayload,
        ack_id: Option<u64>,
    ) {
        let reply_to_id = match &payload.reply_to_id {
            Some(raw) => match MessageId::parse(raw) {
                Some(id) => Some(id),
                None => {
                    session.emit_error(
                        "malformed replyToId",
                        Some("invalid_schema"),
                        Some("send_message"),
                    );
                    return;
                }
            },
            None => None,
        };
        let request = SendRequest {
            conversation_id: payload.conversation_id.clone(),
            sender_id: session.user_id.clone(),
            content: payload.content.clone(),
            message_type: payload.message_type.unwrap_or(relay_core::MessageType::Text),
            attachments: payload.attachments.clone().unwrap_or_default(),
            media_url: payload.media_url.clone(),
            client_message_id: payload.client_message_id.clone(),
            client: Some(session.client.clone()),
            correlation_id: Some(session.correlation_id.clone()),
            reply_to_id,
            thread_id: payload.thread_id.clone(),
        };

        match self.producer.send(request).await {
            Ok(ack) => {
                let message = json!({
                    "id": ack.message_id.to_string(),
                    "conversationId": payload.conversation_id.as_str(),
                    "senderId": session.user_id.as_str(),
                    "content": payload.content,
                    "messageType": payload.message_type.unwrap_or(relay_core::MessageType::Text),
                    "createdAt": rfc3339(ack.accepted_at),
                    "correlationId": ack.correlation_id.as_str(),
                });
                session.emit_message("message_sent", message.clone());
                self.registry.emit_message_to_room(
                    &payload.conversation_id,
                    Some(&session.socket_id),
                    "new_message",
                    &message,
                );
                if let Some(ack_id) = ack_id {
                    session.emit_ack(
                        ack_id,
                        serde_json::to_value(&ack).unwrap_or_else(|_| json!({"ok": true})),
                    );
                }
            }
            Err(err) => {
                session.emit_error(&err.to_string(), Some(err.code()), Some("send_message"));
                if let Some(ack_id) = ack_id {
                    session.emit_ack(ack_id, json!({"ok": false, "reason": err.code()}));
                }
            }
        }
    }

    fn handle_typing(
        &self,
        session: &Arc<Session>,
        conversation: &ConversationId,
        is_typing: Option<bool>,
    ) {
        // Best effort: no membership probe, no persistence.
        self.registry.broadcast_to_room(
            conversation,
            Some(&session.socket_id),
            "user_typing",
            &json!({
                "conversationId": conversation.as_str(),
                "userId": session.user_id.as_str(),
                "isTyping": is_typing.unwrap_or(true),
                "timestamp": rfc3339(OffsetDateTime::now_utc()),
            }),
        );
    }

    async fn handle_mark_read(&self, session: &Arc<Session>, payload: MarkReadPayload) {
        let mut ids = Vec::with_capacity(payload.message_ids.len());
        for raw in &payload.message_ids {
            match MessageId::parse(raw) {
                Some(id) => ids.push(id),
                None => {
                    session.emit_error(
                        "malformed messageIds",
                        Some("invalid_schema"),
                        Some("mark_as_read"),
                    );
                    return;
                }
            }
        }
        match self
            .chat
            .mark_read(&payload.conversation_id, &session.user_id, &ids)
            .await
        {
            Ok(newly_read) if newly_read.is_empty() => {}
            Ok(newly_read) => {
                let ids: Vec<String> = newly_read.iter().map(|id| id.to_string()).collect();
                self.registry.broadcast_to_room(
                    &payload.conversation_id,
                    Some(&session.socket_id),
                    "messages_read",
                    &json!({
                        "conversationId": payload.conversation_id.as_str(),
                        "userId": session.user_id.as_str(),
                        "messageIds": ids,
                        "timestamp": rfc3339(OffsetDateTime::now_utc()),
                    }),
                );
            }
            Err(err) => {
                session.emit_error(&err.to_string(), Some(err.code()), Some("mark_as_read"));
            }
        }
    }

    async fn handle_resume(
        &self,
        session: &Arc<Session>,
        payload: ResumePayload,
        ack_id: Option<u64>,
    ) {
        if !self
            .is_active_member(&payload.conversation_id, &session.user_id)
            .await
        {
            if let Some(ack_id) = ack_id {
                session.emit_ack(ack_id, json!({"ok": false, "reason": "not_member"}));
            }
            session.emit_error(
                "not a member of this conversation",
                Some("not_member"),
                Some("resume_messages"),
            );
            return;
        }

        let cursor = payload
            .last_received_message_id
            .as_deref()
            .and_then(MessageId::parse)
            .or_else(|| {
                *session
                    .handshake_cursor
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
            });
        // A missing or unknown cursor yields an empty replay; the client
        // falls back to paginated history.
        let envelopes = self.replay.fetch_since(&payload.conversation_id, cursor);
        let messages: Vec<serde_json::Value> =
            envelopes.iter().map(message_payload).collect();
        let replayed =
            session.emit_replay(payload.conversation_id.as_str(), messages);
        if let Some(ack_id) = ack_id {
            session.emit_ack(ack_id, json!({"ok": true, "replayed": replayed}));
        }
    }

    /// Tears down a session: leaves the registry, releases presence, counts
    /// the disconnect.
    pub async fn disconnect(
        &self,
        socket: &relay_core::SocketId,
        reason: crate::protocol::DisconnectReason,
    ) {
        metrics::counter!("relay_disconnects_total", "reason" => reason.as_str()).increment(1);
        let Some(session) = self.registry.remove(socket) else {
            return;
        };
        if let Err(err) = self
            .presence
            .unregister(&session.user_id, &session.socket_id)
            .await
        {
            warn!(error = %err, user = %session.user_id, "presence unregister failed");
        }
        debug!(
            socket = %socket,
            user = %session.user_id,
            reason = reason.as_str(),
            "session closed"
        );
    }

    /// Builds and registers a session after successful authentication.
    pub async fn open_session(
        &self,
        user_id: UserId,
        correlation_id: Option<CorrelationId>,
        client: ClientMeta,
        handshake_cursor: Option<MessageId>,
        outbound: tokio::sync::mpsc::UnboundedSender<ServerFrame>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            relay_core::SocketId::generate(),
            user_id,
            correlation_id.unwrap_or_else(CorrelationId::generate),
            client,
            self.config.dedupe_capacity,
            outbound,
        ));
        *session
            .handshake_cursor
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = handshake_cursor;
        self.registry.insert(session.clone());

        let binding = relay_presence::SessionBinding::new(
            session.socket_id.clone(),
            self.config.instance_id.clone(),
            session.client.user_agent.clone(),
        );
        if let Err(err) = self
            .presence
            .register_connection(&session.user_id, binding)
            .await
        {
            // Presence degradation never blocks the session.
            warn!(error = %err, user = %session.user_id, "presence register failed");
        }
        metrics::counter!("relay_sessions_opened_total").increment(1);
        session
    }
}
