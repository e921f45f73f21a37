use std::hash::Hasher;

use twox_hash::XxHash32;

use crate::ConversationId;

/// Fixed seed so every instance of the deployment routes identically.
const PARTITION_SEED: u32 = 0;

/// Maps a conversation to its log partition. All messages of a conversation
/// land on the same partition, which is what gives per-conversation FIFO.
///
/// ```
/// use relay_core::{partition_for, ConversationId};
///
/// let conv = ConversationId::from("c-1");
/// let p = partition_for(&conv, 16);
/// assert!(p < 16);
/// assert_eq!(p, partition_for(&conv, 16));
/// ```
pub fn partition_for(conversation_id: &ConversationId, partitions: u32) -> u32 {
    let mut hasher = XxHash32::with_seed(PARTITION_SEED);
    hasher.write(conversation_id.as_str().as_bytes());
    (hasher.finish() as u32) % partitions.max(1)
}
