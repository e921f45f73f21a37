use relay_core::{ConversationId, UserId};
use sha2::{Digest, Sha256};

fn first32(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(32);
    hexed
}

/// Key for a client-supplied message id.
pub fn client_key(client_message_id: &str) -> String {
    format!("client_{}", first32(client_message_id))
}

/// Key for a message without a client id: conversation, sender, and content
/// hashed inside a one-second window, so rapid identical retries collapse.
pub fn content_key(
    conversation: &ConversationId,
    sender: &UserId,
    content: &str,
    now_unix_ms: i64,
) -> String {
    let window = now_unix_ms.div_euclid(1000);
    format!(
        "idem_{}",
        first32(&format!("{conversation}:{sender}:{content}:{window}"))
    )
}

/// Derives the ingress idempotency key, preferring the client-supplied id.
pub fn derive_key(
    client_message_id: Option<&str>,
    conversation: &ConversationId,
    sender: &UserId,
    content: &str,
    now_unix_ms: i64,
) -> String {
    match client_message_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => client_key(id),
        None => content_key(conversation, sender, content, now_unix_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_matches_known_digest() {
        // sha256("cm-1") = eee2436fdd6d46535fcb3133d08c3f1b...
        assert_eq!(client_key("cm-1"), "client_eee2436fdd6d46535fcb3133d08c3f1b");
    }

    #[test]
    fn content_key_matches_known_digest() {
        // sha256("c-1:u-1:hi:1700000000") = 0d31ea5cdb31d64347ac87689091cf22...
        let key = content_key(
            &ConversationId::from("c-1"),
            &UserId::from("u-1"),
            "hi",
            1_700_000_000_000,
        );
        assert_eq!(key, "idem_0d31ea5cdb31d64347ac87689091cf22");
    }

    #[test]
    fn retries_inside_the_window_collapse() {
        let conv = ConversationId::from("c-1");
        let sender = UserId::from("u-1");
        let a = content_key(&conv, &sender, "hi", 1_700_000_000_100);
        let b = content_key(&conv, &sender, "hi", 1_700_000_000_900);
        assert_eq!(a, b);
    }

    #[test]
    fn windows_advance_per_second() {
        let conv = ConversationId::from("c-1");
        let sender = UserId::from("u-1");
        let a = content_key(&conv, &sender, "hi", 1_700_000_000_500);
        let b = content_key(&conv, &sender, "hi", 1_700_000_001_500);
        assert_ne!(a, b);
    }

    #[test]
    fn derive_prefers_client_id() {
        let conv = ConversationId::from("c-1");
        let sender = UserId::from("u-1");
        let key = derive_key(Some("cm-1"), &conv, &sender, "hi", 0);
        assert!(key.starts_with("client_"));
        let key = derive_key(Some("   "), &conv, &sender, "hi", 0);
        assert!(key.starts_with("idem_"));
        let key = derive_key(None, &conv, &sender, "hi", 0);
        assert!(key.starts_with("idem_"));
    }

    #[test]
    fn keys_have_fixed_length() {
        assert_eq!(client_key("x").len(), "client_".len() + 32);
    }
}
