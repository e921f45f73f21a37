//! Token verification for the session gateway and the REST facade.
//!
//! Tokens are accepted from either a remote key-set endpoint (fetched and
//! cached) or a configured set of static keys (PEM public keys or shared
//! secrets). The remote resolver is always tried first when configured;
//! static keys only get a chance when the resolver's verdict was a signature
//! mismatch, so a misbehaving key-set endpoint cannot be used to probe the
//! static key material.

mod claims;
mod error;
mod jwks;
mod verifier;

pub use claims::{Claims, Verified};
pub use error::AuthError;
pub use jwks::JwksResolver;
pub use verifier::TokenVerifier;
