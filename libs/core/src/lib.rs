//! Core domain types shared across the Relay chat services.
//!
//! Everything that crosses a crate boundary lives here: identifiers, the
//! durable-log envelope, receipt states, conversation records, and the
//! partition routing helpers that keep a conversation pinned to one
//! partition.

mod conversation;
mod envelope;
mod ids;
mod partition;
mod receipt;
mod subjects;

pub use conversation::{Conversation, ConversationKind, ConversationMember, MemberRole, Message};
pub use envelope::{
    ClientMeta, EnvelopeMetadata, MessageEnvelope, MessageFlags, MessageType, Priority,
};
pub use ids::{ConversationId, CorrelationId, MessageId, SocketId, UserId};
pub use partition::partition_for;
pub use receipt::{Receipt, ReceiptState};
pub use subjects::{dlq_subject, partition_subject};

/// Formats an [`time::OffsetDateTime`] as RFC 3339, falling back to the unix
/// timestamp when formatting fails.
pub fn rfc3339(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}
