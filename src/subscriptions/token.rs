//! Callback bearer tokens (component I, minting half): short-lived
//! JWTs binding a consumer to the epoch it was woken at.
//!
//! Grounded on the session-token pattern used for user auth in the
//! teacher (HS256 via `jsonwebtoken`, `exp` claim, constant-time verify).

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackClaims {
    pub sub: String, // consumer_id
    pub epoch: u64,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed or has an invalid signature")]
    Invalid,
    #[error("token has expired")]
    Expired,
}

pub fn mint(secret: &str, consumer_id: &str, epoch: u64, ttl_secs: u64, now: i64) -> String {
    let claims = CallbackClaims {
        sub: consumer_id.to_string(),
        epoch,
        iat: now,
        exp: now + ttl_secs as i64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .expect("HS256 encoding never fails for well-formed claims")
}

pub fn verify(secret: &str, token: &str) -> Result<CallbackClaims, TokenError> {
    let mut validation = Validation::default();
    validation.validate_exp = false; // distinguish expired from malformed ourselves
    let data = decode::<CallbackClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|_| TokenError::Invalid)?;

    let now = chrono::Utc::now().timestamp();
    if data.claims.exp < now {
        return Err(TokenError::Expired);
    }
    Ok(data.claims)
}

/// A token is "near expiry" when less than a third of its TTL remains;
/// only then does the callback handler bother rotating it.
pub fn needs_rotation(claims: &CallbackClaims, ttl_secs: u64, now: i64) -> bool {
    let remaining = claims.exp - now;
    remaining < (ttl_secs as i64) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_verify_round_trip() {
        let now = 1_000_000;
        let token = mint("secret", "c1", 3, 300, now);
        let claims = verify("secret", &token).unwrap();
        assert_eq!(claims.sub, "c1");
        assert_eq!(claims.epoch, 3);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let token = mint("secret", "c1", 0, 300, 1_000_000);
        assert_eq!(verify("other-secret", &token), Err(TokenError::Invalid));
    }

    #[test]
    fn verify_rejects_malformed_token() {
        assert_eq!(verify("secret", "not-a-jwt"), Err(TokenError::Invalid));
    }

    #[test]
    fn needs_rotation_near_expiry() {
        let claims = CallbackClaims { sub: "c1".into(), epoch: 0, iat: 0, exp: 300 };
        assert!(needs_rotation(&claims, 300, 290));
        assert!(!needs_rotation(&claims, 300, 100));
    }
}
