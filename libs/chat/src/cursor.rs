//! Opaque pagination cursors. Shape is private to the server; clients echo
//! them back verbatim.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use relay_core::{ConversationId, MessageId};
use relay_dal::ListCursor;
use time::OffsetDateTime;

/// Cursor over the conversation listing's (last-message timestamp, id)
/// descending order.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCursor(pub ListCursor);

impl ListingCursor {
    pub fn encode(&self) -> String {
        let ts = match self.0.last_message_at {
            Some(at) => at.unix_timestamp_nanos().to_string(),
            None => "-".to_string(),
        };
        URL_SAFE_NO_PAD.encode(format!("{ts}|{}", self.0.id))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        let decoded = String::from_utf8(bytes).ok()?;
        let (ts, id) = decoded.split_once('|')?;
        if id.is_empty() {
            return None;
        }
        let last_message_at = match ts {
            "-" => None,
            _ => Some(OffsetDateTime::from_unix_timestamp_nanos(ts.parse().ok()?).ok()?),
        };
        Some(Self(ListCursor {
            last_message_at,
            id: ConversationId::from(id),
        }))
    }
}

/// Cursor over a conversation's ascending history: the last message id the
/// page delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryCursor(pub MessageId);

impl HistoryCursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_string())
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        let decoded = String::from_utf8(bytes).ok()?;
        MessageId::parse(&decoded).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_cursor_roundtrips() {
        let cursor = ListingCursor(ListCursor {
            last_message_at: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
            id: ConversationId::from("c-1"),
        });
        let decoded = ListingCursor::decode(&cursor.encode()).expect("decode");
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn listing_cursor_roundtrips_without_timestamp() {
        let cursor = ListingCursor(ListCursor {
            last_message_at: None,
            id: ConversationId::from("c-quiet"),
        });
        let decoded = ListingCursor::decode(&cursor.encode()).expect("decode");
        assert_eq!(decoded.0.last_message_at, None);
        assert_eq!(decoded.0.id.as_str(), "c-quiet");
    }

    #[test]
    fn tampered_cursors_are_rejected() {
        assert!(ListingCursor::decode("!!!not-base64!!!").is_none());
        assert!(ListingCursor::decode(&URL_SAFE_NO_PAD.encode("no-separator")).is_none());
        assert!(HistoryCursor::decode("???").is_none());
        assert!(HistoryCursor::decode(&URL_SAFE_NO_PAD.encode("not-a-message-id")).is_none());
    }

    #[test]
    fn history_cursor_roundtrips() {
        let id = MessageId::generate();
        let cursor = HistoryCursor(id);
        assert_eq!(HistoryCursor::decode(&cursor.encode()), Some(cursor));
    }
}
