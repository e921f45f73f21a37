use std::collections::BTreeMap;

use relay_core::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Claims we inspect; everything else rides along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Claims {
    /// The authenticated identity: `sub`, then `user_id`, then `uid` — first
    /// non-empty wins.
    pub fn identity(&self) -> Option<&str> {
        [&self.sub, &self.user_id, &self.uid]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.trim().is_empty())
    }
}

/// Result of a successful verification. `user_id` is never empty.
#[derive(Debug, Clone)]
pub struct Verified {
    pub user_id: UserId,
    pub claims: Claims,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_sub() {
        let claims = Claims {
            sub: Some("u-1".into()),
            user_id: Some("u-2".into()),
            ..Default::default()
        };
        assert_eq!(claims.identity(), Some("u-1"));
    }

    #[test]
    fn identity_skips_empty_values() {
        let claims = Claims {
            sub: Some("  ".into()),
            user_id: Some(String::new()),
            uid: Some("u-3".into()),
            ..Default::default()
        };
        assert_eq!(claims.identity(), Some("u-3"));
    }

    #[test]
    fn identity_absent_when_nothing_set() {
        assert_eq!(Claims::default().identity(), None);
    }

    #[test]
    fn unknown_claims_are_retained() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"u-1","scope":"chat","exp":1}"#).unwrap();
        assert_eq!(claims.extra["scope"], "chat");
    }
}
