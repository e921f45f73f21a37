//! NATS subject helpers for the partitioned message log.

use std::borrow::Cow;

/// Normalizes a subject segment (replace separators/wildcards, trim).
fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut t = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/'], "-");
    if t.is_empty() {
        t = "relay".into();
    }
    Cow::Owned(t)
}

/// Subject for one partition of the message log.
///
/// ```
/// use relay_core::partition_subject;
///
/// assert_eq!(partition_subject("relay", 3), "relay.messages.3");
/// ```
pub fn partition_subject(prefix: &str, partition: u32) -> String {
    format!("{}.messages.{partition}", norm(prefix))
}

/// Subject for the dead-letter stream.
///
/// ```
/// use relay_core::dlq_subject;
///
/// assert_eq!(dlq_subject("relay"), "relay.dlq");
/// ```
pub fn dlq_subject(prefix: &str) -> String {
    format!("{}.dlq", norm(prefix))
}
