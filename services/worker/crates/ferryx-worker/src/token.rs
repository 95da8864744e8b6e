//! Hub token provisioning.
//!
//! The configured credential is either an already signed JWT (it contains a
//! `.`) or a raw shared key. Raw keys are base64-decoded before signing: the
//! coordinator verifies with the base64-decoded key bytes, so signing with the
//! UTF-8 bytes of the key string would produce tokens it rejects.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use ferryx_common::contract::hub::TOKEN_SUBJECT;

use crate::error::TokenError;

/// Lifetime of tokens minted from a raw key, in days (ten years).
pub const MINTED_TOKEN_LIFETIME_DAYS: i64 = 3652;

/// Claim set of a minted worker token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerClaims {
    pub sub: String,
    pub exp: i64,
}

/// Returns the token to present to the hub for `credential`.
///
/// # Errors
///
/// Returns an error if a raw key is not valid base64 or signing fails.
pub fn provision(credential: &str) -> Result<String, TokenError> {
    let credential = credential.trim();
    if credential.contains('.') {
        return Ok(credential.to_string());
    }
    mint_from_key(credential, Utc::now())
}

/// Signs an HS256 token with the fixed worker subject using the
/// base64-decoded `key`.
///
/// # Errors
///
/// Returns an error if `key` is not valid base64 or signing fails.
pub fn mint_from_key(key: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
    let key_bytes = signing_key_bytes(key)?;
    let claims = WorkerClaims {
        sub: TOKEN_SUBJECT.to_string(),
        exp: (now + TimeDelta::days(MINTED_TOKEN_LIFETIME_DAYS)).timestamp(),
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(&key_bytes),
    )?;
    Ok(token)
}

/// Key bytes the coordinator verifies with.
///
/// # Errors
///
/// Returns an error if `key` is not valid base64.
pub fn signing_key_bytes(key: &str) -> Result<Vec<u8>, TokenError> {
    Ok(STANDARD.decode(key.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    const RAW_KEY: &str = "c2VjcmV0LWtleS1mb3ItZmVycnl4LXdvcmtlci10ZXN0cw==";

    fn verify(token: &str, key_bytes: &[u8]) -> jsonwebtoken::errors::Result<WorkerClaims> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<WorkerClaims>(token, &DecodingKey::from_secret(key_bytes), &validation)
            .map(|data| data.claims)
    }

    #[test]
    fn signed_token_passes_through_trimmed() {
        let token = "  aaa.bbb.ccc\n";
        assert_eq!(provision(token).unwrap(), "aaa.bbb.ccc");
    }

    #[test]
    fn raw_key_mints_token_accepted_by_coordinator_verifier() {
        let token = provision(RAW_KEY).unwrap();
        assert_eq!(token.matches('.').count(), 2);

        let key_bytes = STANDARD.decode(RAW_KEY).unwrap();
        let claims = verify(&token, &key_bytes).unwrap();
        assert_eq!(claims.sub, "ferryx-worker");
    }

    #[test]
    fn verifier_using_utf8_key_bytes_rejects_token() {
        let token = provision(RAW_KEY).unwrap();
        assert!(verify(&token, RAW_KEY.as_bytes()).is_err());
    }

    #[test]
    fn expiry_is_far_in_the_future() {
        let now = Utc::now();
        let token = mint_from_key(RAW_KEY, now).unwrap();
        let key_bytes = STANDARD.decode(RAW_KEY).unwrap();
        let claims = verify(&token, &key_bytes).unwrap();
        assert_eq!(
            claims.exp,
            (now + TimeDelta::days(MINTED_TOKEN_LIFETIME_DAYS)).timestamp()
        );
        assert!(claims.exp - now.timestamp() > 9 * 365 * 24 * 3600);
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        assert!(matches!(
            provision("not base64!"),
            Err(TokenError::InvalidKey(_))
        ));
    }
}
