//! Request/reply chat operations behind the REST facade and parts of the
//! socket gateway: conversation lifecycle, paginated listing and history,
//! read receipts, membership administration, pins, archives, and search.

mod cursor;
mod error;
mod service;

pub use cursor::{HistoryCursor, ListingCursor};
pub use error::ChatError;
pub use service::{
    ChatService, ConversationDetails, ConversationPage, CreateConversationRequest, HistoryPage,
    HistoryRequest,
};
