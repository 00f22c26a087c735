//! Session and pre-auth JWT codec.
//!
//! Two token kinds share one signing secret but are verified by
//! kind-specific decoders: a full `session` token (7 days) and a restricted
//! `pre-auth` token (10 minutes) issued after a first factor succeeds on a
//! 2FA-enabled account. An endpoint declares which kind it accepts by
//! calling the matching verify function; a pre-auth token can never satisfy
//! a session check, or the other way around.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const KIND_SESSION: &str = "session";
const KIND_PRE_AUTH: &str = "pre-auth";
const SCOPE_2FA_PENDING: &str = "2fa_pending";

pub const SESSION_TTL: Duration = Duration::days(7);
pub const PRE_AUTH_TTL: Duration = Duration::minutes(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token kind not accepted here")]
    WrongKind,
}

/// Wire claims. `kind` tags the token; `role` is only present on session
/// tokens, `scope` only on pre-auth tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    iat: usize,
    exp: usize,
}

/// A verified full session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub role: String,
}

/// A verified pre-auth grant, valid only to complete second-factor
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreAuthGrant {
    pub user_id: String,
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue_session(&self, user_id: &str, role: &str) -> Result<String, TokenError> {
        self.issue_session_with_ttl(user_id, role, SESSION_TTL)
    }

    fn issue_session_with_ttl(
        &self,
        user_id: &str,
        role: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id.to_string(),
            kind: KIND_SESSION.to_string(),
            role: Some(role.to_string()),
            scope: None,
            iat: now.unix_timestamp() as usize,
            exp: (now + ttl).unix_timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| TokenError::InvalidSignature)
    }

    pub fn issue_pre_auth(&self, user_id: &str) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id.to_string(),
            kind: KIND_PRE_AUTH.to_string(),
            role: None,
            scope: Some(SCOPE_2FA_PENDING.to_string()),
            iat: now.unix_timestamp() as usize,
            exp: (now + PRE_AUTH_TTL).unix_timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| TokenError::InvalidSignature)
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::InvalidSignature,
            })
    }

    /// Verify a token against the `session` kind.
    pub fn verify_session(&self, token: &str) -> Result<Session, TokenError> {
        let claims = self.decode_claims(token)?;
        if claims.kind != KIND_SESSION {
            return Err(TokenError::WrongKind);
        }
        let role = claims.role.ok_or(TokenError::InvalidSignature)?;
        Ok(Session {
            user_id: claims.sub,
            role,
        })
    }

    /// Verify a token against the `pre-auth` kind with the 2FA scope.
    pub fn verify_pre_auth(&self, token: &str) -> Result<PreAuthGrant, TokenError> {
        let claims = self.decode_claims(token)?;
        if claims.kind != KIND_PRE_AUTH || claims.scope.as_deref() != Some(SCOPE_2FA_PENDING) {
            return Err(TokenError::WrongKind);
        }
        Ok(PreAuthGrant {
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("test-secret-which-is-long-enough!!")
    }

    #[test]
    fn session_round_trip() {
        let codec = codec();
        let token = codec.issue_session("user-1", "member").unwrap();
        let session = codec.verify_session(&token).unwrap();
        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.role, "member");
    }

    #[test]
    fn pre_auth_round_trip() {
        let codec = codec();
        let token = codec.issue_pre_auth("user-2").unwrap();
        let grant = codec.verify_pre_auth(&token).unwrap();
        assert_eq!(grant.user_id, "user-2");
    }

    #[test]
    fn pre_auth_never_satisfies_session_check() {
        let codec = codec();
        let token = codec.issue_pre_auth("user-1").unwrap();
        assert_eq!(
            codec.verify_session(&token).unwrap_err(),
            TokenError::WrongKind
        );
    }

    #[test]
    fn session_never_satisfies_pre_auth_check() {
        let codec = codec();
        let token = codec.issue_session("user-1", "member").unwrap();
        assert_eq!(
            codec.verify_pre_auth(&token).unwrap_err(),
            TokenError::WrongKind
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let codec = codec();
        let mut token = codec.issue_session("user-1", "member").unwrap();
        token.pop();
        token.push('A');
        assert_eq!(
            codec.verify_session(&token).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn other_secret_rejected() {
        let codec = codec();
        let other = TokenCodec::new("another-secret-also-long-enough!!!");
        let token = other.issue_session("user-1", "member").unwrap();
        assert_eq!(
            codec.verify_session(&token).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn expired_session_rejected() {
        let codec = codec();
        let token = codec
            .issue_session_with_ttl("user-1", "member", Duration::seconds(-120))
            .unwrap();
        assert_eq!(codec.verify_session(&token).unwrap_err(), TokenError::Expired);
    }
}
