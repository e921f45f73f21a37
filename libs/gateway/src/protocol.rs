//! Wire frames and typed event payloads for the session protocol.

use relay_core::{ConversationId, MessageEnvelope, MessageId, UserId, rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Inbound frame: `{event, data, ackId?}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ack_id: Option<u64>,
}

/// Outbound frame; `ack_id` is set only on acknowledgement frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl ServerFrame {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack_id: None,
        }
    }

    pub fn ack(ack_id: u64, data: Value) -> Self {
        Self {
            event: "ack".into(),
            data,
            ack_id: Some(ack_id),
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>, event: Option<&str>) -> Self {
        let mut data = json!({ "message": message.into() });
        if let Some(code) = code {
            data["code"] = json!(code);
        }
        if let Some(event) = event {
            data["event"] = json!(event);
        }
        Self::event("error", data)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub last_received_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: Option<relay_core::MessageType>,
    #[serde(default)]
    pub attachments: Option<Vec<Value>>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub is_typing: Option<bool>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub last_received_message_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// Parsed inbound events, aliases folded in.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Auth(AuthPayload),
    Join(ConversationPayload),
    Leave(ConversationPayload),
    Send(SendMessagePayload),
    Typing(TypingPayload),
    MarkRead(MarkReadPayload),
    Resume(ResumePayload),
    Unknown(String),
}

impl ClientEvent {
    pub fn parse(frame: &ClientFrame) -> Result<Self, String> {
        fn payload<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, String> {
            serde_json::from_value(data.clone()).map_err(|err| err.to_string())
        }

        match frame.event.as_str() {
            "auth" => Ok(ClientEvent::Auth(payload(&frame.data)?)),
            "join_conversation" => Ok(ClientEvent::Join(payload(&frame.data)?)),
            "leave_conversation" => Ok(ClientEvent::Leave(payload(&frame.data)?)),
            "send_message" => Ok(ClientEvent::Send(payload(&frame.data)?)),
            "typing_indicator" => Ok(ClientEvent::Typing(payload(&frame.data)?)),
            "typing_start" => {
                let mut typing: TypingPayload = payload(&frame.data)?;
                typing.is_typing = Some(true);
                Ok(ClientEvent::Typing(typing))
            }
            "typing_stop" => {
                let mut typing: TypingPayload = payload(&frame.data)?;
                typing.is_typing = Some(false);
                Ok(ClientEvent::Typing(typing))
            }
            "mark_as_read" | "mark_message_read" => Ok(ClientEvent::MarkRead(payload(&frame.data)?)),
            "resume_messages" => Ok(ClientEvent::Resume(payload(&frame.data)?)),
            other => Ok(ClientEvent::Unknown(other.to_string())),
        }
    }

    /// The `userId` the client put in the payload, if any; compared against
    /// the authenticated identity before dispatch.
    pub fn claimed_user(&self) -> Option<&UserId> {
        match self {
            ClientEvent::Join(p) | ClientEvent::Leave(p) => p.user_id.as_ref(),
            ClientEvent::Send(p) => p.user_id.as_ref(),
            ClientEvent::Typing(p) => p.user_id.as_ref(),
            ClientEvent::MarkRead(p) => p.user_id.as_ref(),
            ClientEvent::Resume(p) => p.user_id.as_ref(),
            ClientEvent::Auth(_) | ClientEvent::Unknown(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClientEvent::Auth(_) => "auth",
            ClientEvent::Join(_) => "join_conversation",
            ClientEvent::Leave(_) => "leave_conversation",
            ClientEvent::Send(_) => "send_message",
            ClientEvent::Typing(_) => "typing_indicator",
            ClientEvent::MarkRead(_) => "mark_as_read",
            ClientEvent::Resume(_) => "resume_messages",
            ClientEvent::Unknown(name) => name,
        }
    }
}

/// Normalized disconnect classification for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthFailure,
    HeartbeatTimeout,
    TransportError,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::AuthFailure => "auth_failure",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }
}

/// The message shape shared by `message_sent`, `new_message`, and replay
/// batches.
pub fn message_payload(envelope: &MessageEnvelope) -> Value {
    let mut data = json!({
        "id": envelope.message_id.to_string(),
        "conversationId": envelope.conversation_id.as_str(),
        "senderId": envelope.sender_id.as_str(),
        "content": envelope.metadata.content,
        "messageType": envelope.metadata.content_type,
        "createdAt": rfc3339(envelope.created_at),
        "correlationId": envelope.correlation_id.as_str(),
    });
    if !envelope.metadata.attachments.is_empty() {
        data["attachments"] = json!(envelope.metadata.attachments);
    }
    if let Some(media_url) = &envelope.metadata.media_url {
        data["mediaUrl"] = json!(media_url);
    }
    if let Some(flags) = &envelope.metadata.flags {
        if let Some(reply_to) = &flags.reply_to_id {
            data["replyToId"] = json!(reply_to.to_string());
        }
        if let Some(thread) = &flags.thread_id {
            data["threadId"] = json!(thread);
        }
    }
    data
}

/// Extracts the message id a payload carries, used by the per-session
/// dedupe set.
pub fn payload_message_id(payload: &Value) -> Option<MessageId> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .and_then(MessageId::parse)
}
