use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use relay_core::{ClientMeta, CorrelationId, MessageId, SocketId, UserId};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::protocol::{ServerFrame, payload_message_id};

/// Bounded recency set over outbound message ids (LRU by insertion). Spans
/// `new_message`, `message_sent`, and replay batches so at-least-once
/// delivery never shows the same message twice on one session.
pub(crate) struct DedupeSet {
    capacity: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl DedupeSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True when the id is fresh (and now recorded); false for a duplicate.
    pub(crate) fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// One authenticated connection. Outbound writes go through a channel whose
/// single consumer owns the socket sink; message-bearing events pass the
/// dedupe set first.
pub struct Session {
    pub socket_id: SocketId,
    pub user_id: UserId,
    pub correlation_id: CorrelationId,
    pub client: ClientMeta,
    pub connected_at: OffsetDateTime,
    /// Resume cursor announced at handshake, if any.
    pub handshake_cursor: Mutex<Option<MessageId>>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    dedupe: Mutex<DedupeSet>,
}

impl Session {
    pub fn new(
        socket_id: SocketId,
        user_id: UserId,
        correlation_id: CorrelationId,
        client: ClientMeta,
        dedupe_capacity: usize,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            socket_id,
            user_id,
            correlation_id,
            client,
            connected_at: OffsetDateTime::now_utc(),
            handshake_cursor: Mutex::new(None),
            outbound,
            dedupe: Mutex::new(DedupeSet::new(dedupe_capacity)),
        }
    }

    /// Emits a non-message event as-is.
    pub fn emit(&self, event: &str, data: Value) {
        let _ = self.outbound.send(ServerFrame::event(event, data));
    }

    pub fn emit_frame(&self, frame: ServerFrame) {
        let _ = self.outbound.send(frame);
    }

    pub fn emit_error(&self, message: &str, code: Option<&str>, event: Option<&str>) {
        self.emit_frame(ServerFrame::error(message, code, event));
    }

    pub fn emit_ack(&self, ack_id: u64, data: Value) {
        self.emit_frame(ServerFrame::ack(ack_id, data));
    }

    /// Emits a message-bearing event unless its id was already delivered on
    /// this session. Returns whether the event went out.
    pub fn emit_message(&self, event: &str, payload: Value) -> bool {
        let Some(id) = payload_message_id(&payload) else {
            self.emit(event, payload);
            return true;
        };
        let fresh = self
            .dedupe
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(id);
        if !fresh {
            metrics::counter!("relay_session_dedupe_hits_total", "event" => event.to_string())
                .increment(1);
            return false;
        }
        self.emit(event, payload);
        true
    }

    /// Filters a replay batch in place through the dedupe set and emits the
    /// survivors as one `replayed_messages` event. Returns how many were
    /// delivered.
    pub fn emit_replay(&self, conversation_id: &str, mut messages: Vec<Value>) -> usize {
        let mut dedupe = self.dedupe.lock().unwrap_or_else(|err| err.into_inner());
        messages.retain(|payload| match payload_message_id(payload) {
            Some(id) => {
                let fresh = dedupe.insert(id);
                if !fresh {
                    metrics::counter!(
                        "relay_session_dedupe_hits_total",
                        "event" => "replayed_messages"
                    )
                    .increment(1);
                }
                fresh
            }
            None => true,
        });
        drop(dedupe);
        let replayed = messages.len();
        self.emit(
            "replayed_messages",
            serde_json::json!({
                "conversationId": conversation_id,
                "messages": messages,
                "cursor": messages_cursor(&messages),
                "replayedAt": relay_core::rfc3339(OffsetDateTime::now_utc()),
            }),
        );
        replayed
    }
}

fn messages_cursor(messages: &[Value]) -> Value {
    messages
        .last()
        .and_then(|payload| payload.get("id").cloned())
        .unwrap_or(Value::Null)
}
