//! Password login, logout, session introspection and the second-factor
//! endpoints.
//!
//! A password success on a 2FA-enabled account never yields a session:
//! it yields a short-lived pre-auth grant that only the `/auth/2fa/*`
//! endpoints accept. The lockout guard is consulted before any credential
//! check and fed on every failure.

use crate::api::AUTH_TAG;
use crate::api::auth::{ClientIp, PreAuth, SessionAuth};
use crate::auth::cookies::{self, AUTH_COOKIE};
use crate::auth::two_factor::TwoFactorError;
use crate::auth::{two_factor, verify_password};
use crate::entity::user;
use crate::error::{AuthError, internal};
use crate::AppResources;
use axum::{Extension, Json, response::IntoResponse};
use axum_extra::extract::cookie::CookieJar;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

pub(crate) fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(login))
        .routes(routes!(logout))
        .routes(routes!(me))
        .routes(routes!(send_email_code))
        .routes(routes!(verify_two_factor))
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct SendEmailCodeRequest {
    pub email: String,
}

#[derive(Deserialize, ToSchema)]
pub struct VerifyTwoFactorRequest {
    pub code: String,
}

pub(crate) async fn find_by_username(
    resources: &AppResources,
    username: &str,
) -> Result<Option<user::Model>, AuthError> {
    user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(resources.db.as_ref())
        .await
        .map_err(|e| internal("user lookup", e))
}

pub(crate) async fn touch_last_login(
    resources: &AppResources,
    user_id: &str,
) -> Result<(), AuthError> {
    user::Entity::update_many()
        .col_expr(
            user::Column::LastLoginAt,
            Expr::value(OffsetDateTime::now_utc()),
        )
        .filter(user::Column::Id.eq(user_id))
        .exec(resources.db.as_ref())
        .await
        .map_err(|e| internal("last login update", e))?;
    Ok(())
}

/// Issue a session for a fully authenticated user and attach the cookie.
pub(crate) fn establish_session(
    resources: &AppResources,
    jar: CookieJar,
    user: &user::Model,
) -> Result<(CookieJar, String), AuthError> {
    let token = resources
        .tokens
        .issue_session(&user.id, &user.role)
        .map_err(|e| internal("session token issue", e))?;
    let jar = jar.add(cookies::session_cookie(&token, resources.secure_cookies()));
    Ok((jar, token))
}

#[utoipa::path(
    post,
    path = "/login",
    tag = AUTH_TAG,
    operation_id = "Password login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session established, or a pre-auth grant when 2FA is enabled", content_type = "application/json"),
        (status = 401, description = "Invalid credentials", body = AuthError),
        (status = 403, description = "Account withdrawn or locked out", body = AuthError)
    ),
)]
async fn login(
    Extension(resources): Extension<AppResources>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    if payload.username.is_empty() || payload.password.is_empty() {
        return Err(AuthError::validation("username and password are required"));
    }

    if let Some(remaining) = resources.guard.lock_remaining(&payload.username, &ip) {
        return Err(AuthError::account_blocked(remaining.as_secs() as i64));
    }

    let Some(user) = find_by_username(&resources, &payload.username).await? else {
        resources.guard.record_failure(&payload.username, &ip);
        return Err(AuthError::invalid_credentials());
    };
    let password_ok = user
        .password_hash
        .as_deref()
        .is_some_and(|hash| verify_password(&payload.password, hash));
    if !password_ok {
        resources.guard.record_failure(&payload.username, &ip);
        return Err(AuthError::invalid_credentials());
    }

    if !user.is_active() {
        return Err(AuthError::account_withdrawn());
    }

    resources.guard.record_success(&payload.username, &ip);

    if user.two_factor_enabled() {
        let pre_auth = resources
            .tokens
            .issue_pre_auth(&user.id)
            .map_err(|e| internal("pre-auth token issue", e))?;
        return Ok((
            jar,
            Json(json!({
                "twoFactorRequired": true,
                "method": user.two_factor,
                "preAuthToken": pre_auth,
            })),
        ));
    }

    let (jar, _) = establish_session(&resources, jar, &user)?;
    touch_last_login(&resources, &user.id).await?;
    Ok((jar, Json(json!({ "user": user }))))
}

#[utoipa::path(
    post,
    path = "/logout",
    tag = AUTH_TAG,
    operation_id = "Logout",
    responses(
        (status = 200, description = "Session cookie cleared", content_type = "application/json")
    ),
)]
async fn logout(
    Extension(resources): Extension<AppResources>,
    jar: CookieJar,
) -> impl IntoResponse {
    let jar = jar.add(cookies::clear_cookie(
        AUTH_COOKIE,
        resources.secure_cookies(),
    ));
    (jar, Json(json!({ "success": true })))
}

#[utoipa::path(
    get,
    path = "/me",
    tag = AUTH_TAG,
    operation_id = "Current user",
    responses(
        (status = 200, description = "The authenticated account", content_type = "application/json"),
        (status = 401, description = "No valid session", body = AuthError)
    ),
)]
async fn me(SessionAuth(current): SessionAuth) -> impl IntoResponse {
    Json(json!({ "user": current.user }))
}

#[utoipa::path(
    post,
    path = "/2fa/send-email",
    tag = AUTH_TAG,
    operation_id = "Send email verification code",
    request_body = SendEmailCodeRequest,
    responses(
        (status = 200, description = "Code sent", content_type = "application/json"),
        (status = 400, description = "Email 2FA is not enabled, the address is unverified, or it does not match", body = AuthError),
        (status = 401, description = "Missing or invalid pre-auth grant", body = AuthError),
        (status = 403, description = "Account withdrawn", body = AuthError)
    ),
)]
async fn send_email_code(
    Extension(resources): Extension<AppResources>,
    PreAuth(grant): PreAuth,
    Json(payload): Json<SendEmailCodeRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user = user::Entity::find_by_id(&grant.user_id)
        .one(resources.db.as_ref())
        .await
        .map_err(|e| internal("pre-auth user lookup", e))?
        .ok_or_else(|| AuthError::invalid_token("Unknown user"))?;

    if !user.is_active() {
        return Err(AuthError::account_withdrawn());
    }
    if user.two_factor != user::TWO_FACTOR_EMAIL {
        return Err(AuthError::validation(
            "email verification is not enabled for this account",
        ));
    }
    let Some(email) = user.email.as_deref() else {
        return Err(AuthError::validation("no email address on file"));
    };
    if !user.email_verified {
        return Err(AuthError::validation("email address is not verified"));
    }
    if !payload.email.eq_ignore_ascii_case(email) {
        return Err(AuthError::validation(
            "email address does not match this account",
        ));
    }

    let code = resources.two_factor.issue(&user.id);
    if !resources
        .mailer
        .send_two_factor_code(email, &user.username, &code)
        .await
    {
        return Err(AuthError::server_error());
    }

    Ok(Json(json!({ "sent": true })))
}

#[utoipa::path(
    post,
    path = "/2fa/verify",
    tag = AUTH_TAG,
    operation_id = "Verify second factor",
    request_body = VerifyTwoFactorRequest,
    responses(
        (status = 200, description = "Session established", content_type = "application/json"),
        (status = 401, description = "Wrong or expired code", body = AuthError),
        (status = 403, description = "Account withdrawn or locked out", body = AuthError)
    ),
)]
async fn verify_two_factor(
    Extension(resources): Extension<AppResources>,
    ClientIp(ip): ClientIp,
    PreAuth(grant): PreAuth,
    jar: CookieJar,
    Json(payload): Json<VerifyTwoFactorRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user = user::Entity::find_by_id(&grant.user_id)
        .one(resources.db.as_ref())
        .await
        .map_err(|e| internal("pre-auth user lookup", e))?
        .ok_or_else(|| AuthError::invalid_token("Unknown user"))?;

    if !user.is_active() {
        return Err(AuthError::account_withdrawn());
    }
    if let Some(remaining) = resources.guard.lock_remaining(&user.username, &ip) {
        return Err(AuthError::account_blocked(remaining.as_secs() as i64));
    }

    match user.two_factor.as_str() {
        user::TWO_FACTOR_EMAIL => {
            if let Err(e) = resources.two_factor.verify(&user.id, &payload.code) {
                resources.guard.record_failure(&user.username, &ip);
                return Err(match e {
                    TwoFactorError::Expired => AuthError::code_expired(),
                    TwoFactorError::Mismatch => AuthError::invalid_code(),
                });
            }
        }
        user::TWO_FACTOR_TOTP => {
            let secret = user
                .totp_secret
                .as_deref()
                .ok_or_else(|| internal("totp secret missing", "no secret stored"))?;
            if !two_factor::verify_totp(secret, &payload.code) {
                resources.guard.record_failure(&user.username, &ip);
                return Err(AuthError::invalid_code());
            }
        }
        _ => {
            return Err(AuthError::validation(
                "two-factor verification is not enabled for this account",
            ));
        }
    }

    resources.guard.record_success(&user.username, &ip);
    let (jar, _) = establish_session(&resources, jar, &user)?;
    touch_last_login(&resources, &user.id).await?;
    Ok((jar, Json(json!({ "user": user }))))
}
