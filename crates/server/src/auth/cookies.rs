//! Cookie builders for the auth flows.
//!
//! Three httpOnly cookies, all SameSite=Lax: the 7-day session cookie, the
//! short-lived CSRF nonce for the OAuth round trip, and the pending-bind
//! carrier. `secure` follows the configured public origin scheme so local
//! HTTP development still works.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

/// Session cookie holding the signed session JWT.
pub const AUTH_COOKIE: &str = "auth-token";
/// CSRF nonce set when the OAuth redirect leaves, deleted after one
/// callback parse attempt.
pub const CSRF_COOKIE: &str = "oauth_csrf";
/// Sealed binding token carried while an external identity waits for
/// local-credential confirmation.
pub const BINDING_COOKIE: &str = "binding-token";

const CSRF_TTL: Duration = Duration::minutes(10);
const BINDING_TTL: Duration = Duration::minutes(10);
const SESSION_TTL: Duration = Duration::days(7);

fn build(name: &str, value: String, max_age: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/".to_string())
        .max_age(max_age)
        .build()
}

pub fn session_cookie(token: &str, secure: bool) -> Cookie<'static> {
    build(AUTH_COOKIE, token.to_string(), SESSION_TTL, secure)
}

pub fn csrf_cookie(nonce: &str, secure: bool) -> Cookie<'static> {
    build(CSRF_COOKIE, nonce.to_string(), CSRF_TTL, secure)
}

pub fn binding_cookie(token: &str, secure: bool) -> Cookie<'static> {
    build(BINDING_COOKIE, token.to_string(), BINDING_TTL, secure)
}

/// Expired replacement that clears a cookie on the client.
pub fn clear_cookie(name: &str, secure: bool) -> Cookie<'static> {
    build(name, String::new(), Duration::ZERO, secure)
}
