//! Request extractors for the two token kinds.
//!
//! [`SessionAuth`] accepts only full session tokens; [`PreAuth`] accepts
//! only the restricted pre-auth grant issued between the first and second
//! factor. Each extractor runs the kind-specific verifier, so presenting
//! the wrong kind is rejected as `WRONG_TOKEN_KIND` rather than treated as
//! a weaker success.

use crate::AppResources;
use crate::auth::cookies::AUTH_COOKIE;
use crate::auth::tokens::{PreAuthGrant, Session, TokenError};
use crate::entity::user;
use crate::error::AuthError;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::CookieJar;
use sea_orm::EntityTrait;

/// The authenticated account behind a session token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: user::Model,
    pub session: Session,
}

pub struct SessionAuth(pub CurrentUser);

pub struct PreAuth(pub PreAuthGrant);

fn token_error(e: TokenError) -> AuthError {
    match e {
        TokenError::Expired => AuthError::token_expired(),
        TokenError::WrongKind => AuthError::wrong_token_kind(),
        TokenError::InvalidSignature => AuthError::invalid_token("Token is not valid"),
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

/// Session token from the auth cookie, falling back to a Bearer header.
pub fn session_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    jar.get(AUTH_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| bearer_token(parts))
}

fn resources(parts: &Parts) -> Result<AppResources, AuthError> {
    parts
        .extensions
        .get::<AppResources>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("AppResources not found in request extensions");
            AuthError::server_error()
        })
}

impl<S> FromRequestParts<S> for SessionAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = resources(parts)?;

        let token =
            session_token(parts).ok_or_else(|| AuthError::invalid_token("Missing session token"))?;
        let session = resources
            .tokens
            .verify_session(&token)
            .map_err(token_error)?;

        let user = user::Entity::find_by_id(&session.user_id)
            .one(resources.db.as_ref())
            .await
            .map_err(|e| crate::error::internal("session user lookup", e))?
            .ok_or_else(|| AuthError::invalid_token("Unknown user"))?;

        if !user.is_active() {
            return Err(AuthError::account_withdrawn());
        }

        Ok(SessionAuth(CurrentUser { user, session }))
    }
}

impl<S> FromRequestParts<S> for PreAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = resources(parts)?;

        let token =
            bearer_token(parts).ok_or_else(|| AuthError::invalid_token("Missing pre-auth token"))?;
        let grant = resources
            .tokens
            .verify_pre_auth(&token)
            .map_err(token_error)?;

        Ok(PreAuth(grant))
    }
}

/// Best-effort client address for lockout bookkeeping, taken from the
/// usual proxy headers.
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip(parts)))
    }
}

fn client_ip(parts: &Parts) -> String {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            parts
                .headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
        })
        .unwrap_or("unknown")
        .to_string()
}
