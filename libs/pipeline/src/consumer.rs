use std::sync::Arc;
use std::time::Duration;

use relay_dal::MessageStore;
use relay_idempotency::record_hit;
use relay_replay::ReplayCache;
use relay_stream::{DeadLetterRecord, DeadLetterSource, PendingEntry, SharedLog};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::ConsumeError;
use crate::fanout::FanoutEvent;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub partition: u32,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub stream_name: String,
}

impl ConsumerConfig {
    pub fn for_partition(partition: u32) -> Self {
        Self {
            partition,
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            stream_name: "relay-messages".into(),
        }
    }
}

/// One worker per partition: block-read a batch, persist each envelope
/// idempotently, acknowledge successes in a single call, leave transient
/// failures unacknowledged for redelivery, and dead-letter entries that
/// exhaust their retries.
pub struct ConsumerWorker {
    log: SharedLog,
    store: Arc<dyn MessageStore>,
    replay: Arc<ReplayCache>,
    fanout: mpsc::Sender<FanoutEvent>,
    config: ConsumerConfig,
}

impl ConsumerWorker {
    pub fn new(
        log: SharedLog,
        store: Arc<dyn MessageStore>,
        replay: Arc<ReplayCache>,
        fanout: mpsc::Sender<FanoutEvent>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            log,
            store,
            replay,
            fanout,
            config,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let partition = self.config.partition;
        info!(partition, "consumer worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                read = self.log.read_batch(
                    partition,
                    self.config.batch_size,
                    self.config.poll_interval,
                ) => {
                    match read {
                        Ok(batch) if batch.is_empty() => {}
                        Ok(batch) => self.handle_batch(batch).await,
                        Err(err) => {
                            error!(partition, error = %err, "log read failed");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }
        info!(partition, "consumer worker stopped");
    }

    /// Processes one delivered batch. Public so the batch semantics are
    /// drivable without timers.
    pub async fn handle_batch(&self, batch: Vec<PendingEntry>) {
        let partition = self.config.partition;
        let mut acks = Vec::with_capacity(batch.len());
        for entry in batch {
            match self.process(&entry).await {
                Ok(()) => acks.push(entry.id),
                Err(ConsumeError::PersistenceTransient(reason)) => {
                    if entry.delivery_count >= self.config.max_retries {
                        self.dead_letter(&entry, "max_retries_exceeded", &reason).await;
                        acks.push(entry.id);
                    } else {
                        // Not acknowledged: the group redelivers after the
                        // idle timeout, keeping the entry at the head so
                        // conversation order holds.
                        warn!(
                            partition,
                            delivery = entry.delivery_count,
                            %reason,
                            "transient persistence failure, leaving for redelivery"
                        );
                        metrics::counter!("relay_consumer_retries_total").increment(1);
                    }
                }
                Err(ConsumeError::PersistencePermanent(reason)) => {
                    self.dead_letter(&entry, "permanent_failure", &reason).await;
                    acks.push(entry.id);
                }
            }
        }
        if !acks.is_empty() {
            if let Err(err) = self.log.ack(partition, &acks).await {
                // Redelivery of acked-but-lost entries is safe: persistence
                // is idempotent on the key.
                error!(partition, error = %err, "batch ack failed");
            }
        }
    }

    async fn process(&self, entry: &PendingEntry) -> Result<(), ConsumeError> {
        let outcome = self.store.persist_envelope(&entry.envelope).await?;
        if !outcome.inserted {
            record_hit("store");
            debug!(
                message_id = %entry.envelope.message_id,
                "duplicate envelope dropped by unique key"
            );
            return Ok(());
        }
        self.replay.record(entry.envelope.clone());
        let recipients = entry.envelope.recipients().cloned().collect();
        let event = FanoutEvent::NewMessage {
            envelope: entry.envelope.clone(),
            recipients,
        };
        if self.fanout.send(event).await.is_err() {
            // Session hosts are gone (shutdown): persistence already
            // happened, clients recover via replay or history.
            warn!("fanout queue closed, delivery deferred to replay");
        }
        metrics::counter!("relay_consumer_persisted_total").increment(1);
        Ok(())
    }

    async fn dead_letter(&self, entry: &PendingEntry, reason: &str, error_text: &str) {
        let record = DeadLetterRecord::new(
            reason,
            error_text,
            entry.delivery_count,
            DeadLetterSource {
                stream: self.config.stream_name.clone(),
                id: entry.id.0,
            },
            entry.envelope.clone(),
        );
        if let Err(err) = self.log.dead_letter(record).await {
            error!(error = %err, "dead-letter publish failed; entry stays pending");
        }
    }
}
