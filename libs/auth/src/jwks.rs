use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of a key-set lookup, kept separate from [`crate::AuthError`] so
/// the verifier can decide which failures fall through to static keys.
#[derive(Debug)]
pub(crate) enum ResolveError {
    /// The key-set answered but holds no key for this `kid`; the token was
    /// not signed by the remote issuer.
    UnknownKey,
    /// The key-set could not be fetched or parsed.
    Unavailable(String),
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

impl Jwk {
    pub(crate) fn decoding_key(&self) -> Result<(DecodingKey, Algorithm), ResolveError> {
        if self.kty != "RSA" {
            return Err(ResolveError::UnknownKey);
        }
        let (n, e) = match (&self.n, &self.e) {
            (Some(n), Some(e)) => (n, e),
            _ => return Err(ResolveError::Unavailable("RSA jwk missing n/e".into())),
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|err| ResolveError::Unavailable(format!("bad RSA components: {err}")))?;
        let alg = match self.alg.as_deref() {
            Some("RS384") => Algorithm::RS384,
            Some("RS512") => Algorithm::RS512,
            _ => Algorithm::RS256,
        };
        Ok((key, alg))
    }
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    fetched_at: Instant,
    by_kid: HashMap<String, Jwk>,
}

/// Fetches and caches the remote key-set. Lookups hit the cache until the TTL
/// lapses; a lookup for an unknown `kid` on a fresh cache forces one refetch
/// before giving up, so key rotations are picked up promptly.
pub struct JwksResolver {
    url: String,
    http: reqwest::Client,
    ttl: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            ttl: Duration::from_secs(300),
            cache: RwLock::new(None),
        }
    }

    pub(crate) async fn resolve(
        &self,
        kid: &str,
    ) -> Result<(DecodingKey, Algorithm), ResolveError> {
        if let Some(jwk) = self.lookup_cached(kid).await {
            return jwk.decoding_key();
        }
        self.refresh().await?;
        match self.lookup_cached(kid).await {
            Some(jwk) => jwk.decoding_key(),
            None => Err(ResolveError::UnknownKey),
        }
    }

    async fn lookup_cached(&self, kid: &str) -> Option<Jwk> {
        let guard = self.cache.read().await;
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() > self.ttl {
            return None;
        }
        cached.by_kid.get(kid).cloned()
    }

    async fn refresh(&self) -> Result<(), ResolveError> {
        let body = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|err| ResolveError::Unavailable(format!("key-set fetch: {err}")))?
            .error_for_status()
            .map_err(|err| ResolveError::Unavailable(format!("key-set status: {err}")))?
            .text()
            .await
            .map_err(|err| ResolveError::Unavailable(format!("key-set body: {err}")))?;
        let by_kid = Self::parse(&body)?;
        *self.cache.write().await = Some(CachedKeys {
            fetched_at: Instant::now(),
            by_kid,
        });
        debug!(url = %self.url, "remote key-set refreshed");
        Ok(())
    }

    fn parse(body: &str) -> Result<HashMap<String, Jwk>, ResolveError> {
        let set: JwkSet = serde_json::from_str(body)
            .map_err(|err| ResolveError::Unavailable(format!("key-set parse: {err}")))?;
        Ok(set
            .keys
            .into_iter()
            .filter_map(|jwk| jwk.kid.clone().map(|kid| (kid, jwk)))
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "keys": [
            {"kty": "RSA", "kid": "k1", "alg": "RS256", "n": "qw5c7g", "e": "AQAB"},
            {"kty": "EC", "kid": "k2", "crv": "P-256"}
        ]
    }"#;

    #[test]
    fn parse_indexes_by_kid() {
        let keys = JwksResolver::parse(SAMPLE).unwrap();
        assert!(keys.contains_key("k1"));
        assert!(keys.contains_key("k2"));
    }

    #[test]
    fn rsa_jwk_builds_decoding_key() {
        let keys = JwksResolver::parse(SAMPLE).unwrap();
        let (_, alg) = keys["k1"].decoding_key().unwrap();
        assert_eq!(alg, Algorithm::RS256);
    }

    #[test]
    fn non_rsa_jwk_is_skipped() {
        let keys = JwksResolver::parse(SAMPLE).unwrap();
        assert!(matches!(
            keys["k2"].decoding_key(),
            Err(ResolveError::UnknownKey)
        ));
    }

    #[test]
    fn malformed_set_is_unavailable() {
        assert!(matches!(
            JwksResolver::parse("not json"),
            Err(ResolveError::Unavailable(_))
        ));
    }
}
