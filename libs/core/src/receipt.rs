use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{MessageId, UserId};

/// Delivery receipt states. Transitions are monotone: `sent` → `delivered` →
/// `read`, never backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptState {
    Sent,
    Delivered,
    Read,
}

impl ReceiptState {
    fn rank(self) -> u8 {
        match self {
            ReceiptState::Sent => 0,
            ReceiptState::Delivered => 1,
            ReceiptState::Read => 2,
        }
    }

    /// Whether moving from `prev` (none = no receipt yet) to `self` is a
    /// legal forward transition. Re-recording the same state is allowed and
    /// treated as an idempotent hit by callers.
    pub fn follows(self, prev: Option<ReceiptState>) -> bool {
        match prev {
            None => true,
            Some(p) => self.rank() >= p.rank(),
        }
    }

    /// States implied by this one, weakest first. Recording `read` implies
    /// `sent` and `delivered` exist.
    pub fn implied(self) -> &'static [ReceiptState] {
        match self {
            ReceiptState::Sent => &[ReceiptState::Sent],
            ReceiptState::Delivered => &[ReceiptState::Sent, ReceiptState::Delivered],
            ReceiptState::Read => &[
                ReceiptState::Sent,
                ReceiptState::Delivered,
                ReceiptState::Read,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptState::Sent => "sent",
            ReceiptState::Delivered => "delivered",
            ReceiptState::Read => "read",
        }
    }
}

/// One recorded receipt row; unique per (message, recipient, state).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub state: ReceiptState,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl Receipt {
    pub fn new(message_id: MessageId, recipient_id: UserId, state: ReceiptState) -> Self {
        Self {
            message_id,
            recipient_id,
            state,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}
