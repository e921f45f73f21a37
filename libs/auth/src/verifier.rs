use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use relay_config::AuthConfig;
use relay_core::UserId;
use tracing::{instrument, warn};

use crate::claims::{Claims, Verified};
use crate::error::{AuthError, map_jwt_error};
use crate::jwks::{JwksResolver, ResolveError};

const RSA_ALGS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
const EC_ALGS: &[Algorithm] = &[Algorithm::ES256, Algorithm::ES384];
const HMAC_ALGS: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

enum StaticKey {
    Pem { key: DecodingKey, algs: &'static [Algorithm] },
    Secret { key: DecodingKey },
}

impl StaticKey {
    fn from_material(material: &str) -> Result<Self, AuthError> {
        if material.contains("-----BEGIN") {
            let bytes = material.as_bytes();
            if let Ok(key) = DecodingKey::from_rsa_pem(bytes) {
                return Ok(StaticKey::Pem { key, algs: RSA_ALGS });
            }
            let key = DecodingKey::from_ec_pem(bytes)
                .map_err(|err| AuthError::Internal(format!("unusable PEM key: {err}")))?;
            Ok(StaticKey::Pem { key, algs: EC_ALGS })
        } else {
            Ok(StaticKey::Secret {
                key: DecodingKey::from_secret(material.as_bytes()),
            })
        }
    }

    fn supports(&self, alg: Algorithm) -> bool {
        match self {
            StaticKey::Pem { algs, .. } => algs.contains(&alg),
            StaticKey::Secret { .. } => HMAC_ALGS.contains(&alg),
        }
    }

    fn key(&self) -> &DecodingKey {
        match self {
            StaticKey::Pem { key, .. } | StaticKey::Secret { key } => key,
        }
    }
}

/// Verifies handshake tokens. See the crate docs for the resolver/static-key
/// fall-through rule.
pub struct TokenVerifier {
    issuer: String,
    audience: String,
    leeway_secs: u64,
    resolver: Option<JwksResolver>,
    static_keys: Vec<StaticKey>,
}

impl TokenVerifier {
    pub fn from_config(cfg: &AuthConfig) -> Result<Self, AuthError> {
        let static_keys = cfg
            .static_keys
            .iter()
            .map(|material| StaticKey::from_material(material))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            leeway_secs: cfg.leeway.as_secs(),
            resolver: cfg.jwks_url.as_deref().map(JwksResolver::new),
            static_keys,
        })
    }

    #[instrument(name = "auth.verify", skip_all)]
    pub async fn verify(&self, token: &str) -> Result<Verified, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;

        if let Some(resolver) = &self.resolver {
            match &header.kid {
                Some(kid) => match resolver.resolve(kid).await {
                    Ok((key, alg)) => match self.decode(token, &key, alg) {
                        Ok(claims) => return self.finish(claims),
                        // A signature mismatch from the remote key is the one
                        // case where static keys get a chance.
                        Err(AuthError::InvalidSignature) => {}
                        Err(err) => return Err(err),
                    },
                    Err(ResolveError::UnknownKey) => {
                        // Token was not signed by the remote issuer; treat
                        // like a signature mismatch and fall through.
                    }
                    Err(ResolveError::Unavailable(reason)) => {
                        warn!(%reason, "remote key-set unavailable");
                        return Err(AuthError::Internal(reason));
                    }
                },
                // No kid: the remote key-set cannot match this token.
                None => {}
            }
        }

        let mut verdict = AuthError::InvalidSignature;
        for static_key in &self.static_keys {
            if !static_key.supports(header.alg) {
                continue;
            }
            match self.decode(token, static_key.key(), header.alg) {
                Ok(claims) => return self.finish(claims),
                Err(err) => {
                    if err.specificity() > verdict.specificity() {
                        verdict = err;
                    }
                }
            }
        }
        Err(verdict)
    }

    fn decode(
        &self,
        token: &str,
        key: &DecodingKey,
        alg: Algorithm,
    ) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(alg);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    fn finish(&self, claims: Claims) -> Result<Verified, AuthError> {
        let user_id = claims
            .identity()
            .map(UserId::from)
            .ok_or(AuthError::Unauthorized)?;
        Ok(Verified { user_id, claims })
    }
}
