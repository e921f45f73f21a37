use std::sync::Arc;

use relay_core::ReceiptState;
use relay_dal::SharedDatastore;
use relay_pipeline::{FanoutEvent, FanoutQueue};
use tracing::{debug, warn};

use crate::protocol::message_payload;
use crate::registry::SessionRegistry;

/// Drains the pipeline's fanout queue and emits `new_message` to each
/// recipient's local sessions. A recipient with at least one successful
/// session emit gets a `delivered` receipt. The queue is FIFO per
/// conversation (one consumer per partition feeds it), so emission order
/// matches ingest order.
pub fn spawn_fanout_host(
    registry: Arc<SessionRegistry>,
    store: SharedDatastore,
    mut queue: FanoutQueue,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            match event {
                FanoutEvent::NewMessage {
                    envelope,
                    recipients,
                } => {
                    let payload = message_payload(&envelope);
                    for recipient in &recipients {
                        let sessions = registry.sessions_of_user(recipient);
                        if sessions.is_empty() {
                            continue;
                        }
                        let mut delivered = false;
                        for session in sessions {
                            if session.emit_message("new_message", payload.clone()) {
                                delivered = true;
                            }
                        }
                        if !delivered {
                            continue;
                        }
                        match store
                            .record_receipt(
                                &envelope.message_id,
                                recipient,
                                ReceiptState::Delivered,
                            )
                            .await
                        {
                            Ok(newly) => {
                                if newly {
                                    metrics::counter!(
                                        "relay_receipts_recorded_total",
                                        "state" => "delivered"
                                    )
                                    .increment(1);
                                }
                            }
                            Err(err) => {
                                warn!(
                                    error = %err,
                                    message_id = %envelope.message_id,
                                    recipient = %recipient,
                                    "delivered receipt write failed"
                                );
                            }
                        }
                    }
                }
            }
        }
        debug!("fanout queue closed, host exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use relay_core::{
        ClientMeta, ConversationId, CorrelationId, EnvelopeMetadata, MessageEnvelope, MessageId,
        MessageType, Priority, SocketId, UserId,
    };
    use relay_dal::{MemoryDatastore, ReceiptStore};
    use relay_pipeline::fanout_channel;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    fn envelope(recipients: &[&str]) -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId::generate(),
            conversation_id: ConversationId::from("c-1"),
            sender_id: UserId::from("u-1"),
            created_at: OffsetDateTime::now_utc(),
            payload_key: None,
            idempotency_key: format!("idem_{}", MessageId::generate()),
            correlation_id: CorrelationId::generate(),
            metadata: EnvelopeMetadata {
                content: Some("hi".into()),
                content_type: MessageType::Text,
                priority: Priority::Normal,
                retry_count: 0,
                recipient_ids: recipients.iter().map(|r| UserId::from(*r)).collect(),
                client: None,
                flags: None,
                attachments: Vec::new(),
                media_url: None,
            },
        }
    }

    #[tokio::test]
    async fn recipients_with_sessions_get_the_event_and_a_receipt() {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryDatastore::new());
        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        registry.insert(Arc::new(Session::new(
            SocketId::from("s-2"),
            UserId::from("u-2"),
            CorrelationId::generate(),
            ClientMeta::default(),
            200,
            frame_tx,
        )));

        let (tx, rx) = fanout_channel(8);
        let host = spawn_fanout_host(registry, store.clone(), rx);

        let env = envelope(&["u-2", "u-3"]);
        tx.send(FanoutEvent::NewMessage {
            envelope: env.clone(),
            recipients: vec![UserId::from("u-2"), UserId::from("u-3")],
        })
        .await
        .unwrap();
        drop(tx);
        host.await.unwrap();

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.event, "new_message");
        assert_eq!(frame.data["id"], env.message_id.to_string());

        assert_eq!(
            store
                .receipt_state(&env.message_id, &UserId::from("u-2"))
                .await
                .unwrap(),
            Some(ReceiptState::Delivered)
        );
        // No session for u-3, so no delivered receipt.
        assert_eq!(
            store
                .receipt_state(&env.message_id, &UserId::from("u-3"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_fanout_does_not_reemit() {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryDatastore::new());
        let (frame_tx, mut frames) = mpsc::unbounded_channel();
        registry.insert(Arc::new(Session::new(
            SocketId::from("s-2"),
            UserId::from("u-2"),
            CorrelationId::generate(),
            ClientMeta::default(),
            200,
            frame_tx,
        )));

        let (tx, rx) = fanout_channel(8);
        let host = spawn_fanout_host(registry, store, rx);
        let env = envelope(&["u-2"]);
        for _ in 0..2 {
            tx.send(FanoutEvent::NewMessage {
                envelope: env.clone(),
                recipients: vec![UserId::from("u-2")],
            })
            .await
            .unwrap();
        }
        drop(tx);
        host.await.unwrap();

        assert!(frames.try_recv().is_ok());
        assert!(frames.try_recv().is_err());
    }
}
