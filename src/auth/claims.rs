use crate::core::types::UserRole;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims embedded in the access token.
///
/// The token is opaque to the client in the cryptographic sense: the signature
/// is the server's business and is never verified here. Decoding only reads
/// the embedded claims so the client can route on subject/role and detect
/// expiry without a network round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// User role
    #[serde(default = "default_role")]
    pub role: UserRole,
    /// Expiration time (seconds since epoch)
    pub exp: i64,
    /// Issued at (seconds since epoch)
    #[serde(default)]
    pub iat: Option<i64>,
}

fn default_role() -> UserRole {
    UserRole::Unknown
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
    }
}

/// A token that could not be decoded. Common and non-exceptional: first
/// visit, corrupt storage, or a token minted by an older deployment.
#[derive(Debug, Error)]
#[error("credential is not decodable: {0}")]
pub struct UndecodableToken(String);

/// Decode the claims embedded in a bearer token without verifying its
/// signature. Never panics on malformed input.
pub fn decode_claims(token: &str) -> Result<Claims, UndecodableToken> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| UndecodableToken(e.to_string()))
}

/// Whether the token is expired at `now`.
///
/// Any decode failure counts as expired: a corrupt token must force
/// re-authentication rather than be silently trusted.
pub fn token_is_expired(token: &str, now: DateTime<Utc>) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.expires_at() <= now,
        Err(_) => true,
    }
}

/// Mint a decodable token for tests.
#[cfg(test)]
pub(crate) fn make_token(sub: &str, role: &str, exp: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = serde_json::json!({
        "sub": sub,
        "role": role,
        "exp": exp,
        "iat": exp - 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-signing-key"),
    )
    .unwrap()
}
