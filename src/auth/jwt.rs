//! Bearer-JWT verification for the session-control API.
//!
//! This crate only verifies tokens; minting them is the responsibility of
//! whatever issues player/worker credentials upstream (see `SPEC_FULL.md`
//! Non-goals). The shape here is grounded on
//! `Bitsage-Network-Rune-Relic/rune-relic-server/src/network/auth.rs`.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use turnkeep_model::session::PersistentId;

use crate::config::AuthConfig;

/// The claims carried by a session-control API bearer token.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Claims {
    /// The authenticated player's persistent id.
    pub sub: PersistentId,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    /// Roles granted by the identity provider, used to satisfy a session's
    /// `required_roles` gate.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Verifies bearer tokens against a fixed HMAC secret, issuer, and
/// audience.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> anyhow::Result<JwtVerifier> {
        let secret = config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no JWT signing secret configured"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.jwt_issuer]);
        validation.set_audience(&[&config.jwt_audience]);

        Ok(JwtVerifier {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

/// Signs a token, for use by tests and the local-dev token-minting CLI path
/// (real deployments mint tokens upstream of this crate).
pub fn sign(claims: &Claims, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Generates a random HMAC secret suitable for `TURNKEEP_AUTH_JWT_SECRET`,
/// for the `generate-key --jwt` CLI command.
pub fn generate_signing_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base16::encode_lower(&bytes)
}
