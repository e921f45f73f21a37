//! Data access layer for the chat core.
//!
//! Reads may be routed to a replica when one is configured; a three-state
//! circuit breaker driven by the replication lag monitor decides whether the
//! replica is trustworthy. All writes for one envelope execute inside a
//! single transaction on the primary.

mod breaker;
mod cache;
mod error;
mod lag;
mod memory;
mod pg;
mod pool;
mod store;

pub use breaker::{BreakerState, ReplicaBreaker};
pub use cache::{CacheHandle, MemoryResultCache, ResultCache};
#[cfg(feature = "redis-cache")]
pub use cache::RedisResultCache;
pub use error::DalError;
pub use lag::{LagStatus, ReplicaLagMonitor};
pub use memory::MemoryDatastore;
pub use pg::PgDatastore;
pub use pool::DbPools;
pub use store::{
    ConversationListRow, ConversationStore, Datastore, HistoryFilter, ListCursor, MessageStore,
    PersistOutcome, ReceiptStore, SharedDatastore,
};
