//! The at-least-once delivery pipeline.
//!
//! Ingress: [`Producer::send`] validates, authorizes, deduplicates, and
//! appends an envelope to the conversation's partition, returning a pending
//! ack. Egress: one [`ConsumerWorker`] per partition persists envelopes
//! idempotently, retries transient failures via redelivery, dead-letters
//! poison entries, and hands successful persists to the fanout queue the
//! session hosts consume.

mod consumer;
mod error;
mod fanout;
mod producer;
mod rate;

pub use consumer::{ConsumerConfig, ConsumerWorker};
pub use error::{ConsumeError, ProducerError};
pub use fanout::{FanoutEvent, FanoutQueue, fanout_channel};
pub use producer::{Producer, ProducerConfig, SendRequest};
pub use rate::{RateLimit, SenderRateLimiter};
