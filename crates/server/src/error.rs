//! API error type for the auth core.
//!
//! Every failure surfaces to clients in one of two shapes:
//! - JSON `{statusCode, message}` for API calls
//! - a query-encoded redirect to `/auth/error?code=&message=` for the OAuth
//!   browser leg, which must never answer JSON.
//!
//! Codes are stable internal identifiers; messages are generic enough to
//! avoid account-enumeration oracles. Internal crypto/DB failures are logged
//! server-side and mapped to `SERVER_ERROR`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthError {
    /// Stable internal error code (e.g. "ACCOUNT_BLOCKED").
    pub code: String,
    /// Human-readable message, safe to show to the client.
    pub message: String,
}

impl AuthError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("VALIDATION", message)
    }

    /// Generic credential failure. Deliberately does not distinguish
    /// unknown username from wrong password.
    pub fn invalid_credentials() -> Self {
        Self::new("INVALID_CREDENTIALS", "Invalid username or password")
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::new("INVALID_TOKEN", message)
    }

    pub fn token_expired() -> Self {
        Self::new("TOKEN_EXPIRED", "Token has expired")
    }

    pub fn wrong_token_kind() -> Self {
        Self::new(
            "WRONG_TOKEN_KIND",
            "This token is not valid for this endpoint",
        )
    }

    pub fn invalid_code() -> Self {
        Self::new("INVALID_CODE", "Invalid verification code")
    }

    pub fn code_expired() -> Self {
        Self::new("CODE_EXPIRED", "Verification code has expired")
    }

    pub fn account_withdrawn() -> Self {
        Self::new("ACCOUNT_WITHDRAWN", "This account has been withdrawn")
    }

    pub fn account_blocked(remaining_secs: i64) -> Self {
        Self::new(
            "ACCOUNT_BLOCKED",
            format!("Too many failed attempts. Try again in {remaining_secs} seconds"),
        )
    }

    pub fn identity_conflict() -> Self {
        Self::new(
            "IDENTITY_CONFLICT",
            "This identity is already bound to another account",
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn state_invalid() -> Self {
        Self::new("STATE_INVALID", "Authorization state is invalid or expired")
    }

    pub fn token_exchange_failed() -> Self {
        Self::new(
            "TOKEN_EXCHANGE_FAILED",
            "Could not exchange the authorization code",
        )
    }

    pub fn user_info_failed() -> Self {
        Self::new(
            "USER_INFO_FAILED",
            "Could not fetch the user profile from the provider",
        )
    }

    pub fn credential_replay() -> Self {
        Self::new(
            "CREDENTIAL_REPLAY",
            "Authenticator state is inconsistent; sign-in refused",
        )
    }

    pub fn server_error() -> Self {
        Self::new("SERVER_ERROR", "An internal error occurred")
    }

    pub fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "VALIDATION" | "STATE_INVALID" => StatusCode::BAD_REQUEST,
            "INVALID_CREDENTIALS" | "INVALID_TOKEN" | "TOKEN_EXPIRED" | "INVALID_CODE"
            | "CODE_EXPIRED" | "CREDENTIAL_REPLAY" => StatusCode::UNAUTHORIZED,
            "WRONG_TOKEN_KIND" | "ACCOUNT_WITHDRAWN" | "ACCOUNT_BLOCKED" | "IDENTITY_CONFLICT" => {
                StatusCode::FORBIDDEN
            }
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "TOKEN_EXCHANGE_FAILED" | "USER_INFO_FAILED" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Redirect form for the OAuth browser leg.
    pub fn into_redirect(self) -> Redirect {
        Redirect::to(&format!(
            "/auth/error?code={}&message={}",
            urlencoding::encode(&self.code),
            urlencoding::encode(&self.message),
        ))
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(json!({
                "statusCode": status.as_u16(),
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// Map an unexpected internal error to the generic response, logging the
/// details server-side only.
pub fn internal(context: &str, err: impl std::fmt::Display) -> AuthError {
    tracing::error!(error = %err, context = context, "internal error");
    AuthError::server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AuthError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AuthError::invalid_credentials().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::wrong_token_kind().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::account_blocked(30).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AuthError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AuthError::token_exchange_failed().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AuthError::server_error().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_replay_is_unauthorized() {
        assert_eq!(
            AuthError::credential_replay().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_upstream_codes_are_stable() {
        assert_eq!(
            AuthError::token_exchange_failed().code,
            "TOKEN_EXCHANGE_FAILED"
        );
        assert_eq!(AuthError::user_info_failed().code, "USER_INFO_FAILED");
    }
}
