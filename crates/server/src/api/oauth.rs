//! OAuth authorize/callback flows and the credential-confirmation bind.
//!
//! The callback is a browser leg: every failure becomes a redirect to
//! `/auth/error`, never a JSON body, and the CSRF cookie is cleared after
//! exactly one parse attempt whatever the outcome. Flow outcomes land on
//! the frontend callback page as `?status=` values:
//!
//!   ALREADY_BOUND   identity already bound to the signed-in account
//!   CONFLICT        identity bound to a different account
//!   BOUND           identity bound during this callback
//!   LOGIN_SUCCESS   known identity, session established
//!   PENDING_BIND    unknown identity, binding token issued
//!
//! `/auth/bind` is the JSON leg completing PENDING_BIND: it checks the
//! local credentials and binds, treating a concurrent duplicate bind of
//! the same pair as success.

use crate::AppResources;
use crate::api::OAUTH_TAG;
use crate::api::auth::ClientIp;
use crate::api::login::{establish_session, find_by_username, touch_last_login};
use crate::auth::cookies::{self, AUTH_COOKIE, BINDING_COOKIE, CSRF_COOKIE};
use crate::auth::identity::CreateOutcome;
use crate::auth::providers::ProviderError;
use crate::auth::verify_password;
use crate::entity::user;
use crate::error::{AuthError, internal};
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Extension, Json, extract::Path, extract::Query};
use axum_extra::extract::cookie::CookieJar;
use sea_orm::EntityTrait;
use serde::Deserialize;
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

pub(crate) fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(callback))
        .routes(routes!(bind))
}

fn frontend_redirect(target: &str, provider: &str, status: &str) -> Redirect {
    Redirect::to(&format!(
        "{}/auth/callback?status={}&provider={}",
        target.trim_end_matches('/'),
        urlencoding::encode(status),
        urlencoding::encode(provider),
    ))
}

#[utoipa::path(
    get,
    path = "/{provider}/authorize",
    tag = OAUTH_TAG,
    operation_id = "Start provider authorization",
    params(("provider" = String, Path, description = "Provider name")),
    responses(
        (status = 303, description = "Redirect to the provider's consent page")
    ),
)]
async fn authorize(
    Extension(resources): Extension<AppResources>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Response {
    let Some(strategy) = resources.providers.get(&provider) else {
        return AuthError::not_found("Unknown provider")
            .into_redirect()
            .into_response();
    };

    let Some((state, csrf)) = resources
        .oauth_state
        .generate(&resources.config.frontend_url, &provider)
    else {
        return internal("oauth state generation", "sealing failed")
            .into_redirect()
            .into_response();
    };

    let redirect_uri = format!(
        "{}/auth/{}/callback",
        resources.config.public_origin, provider
    );
    let jar = jar.add(cookies::csrf_cookie(&csrf, resources.secure_cookies()));
    (
        jar,
        Redirect::to(&strategy.authorize_url(&redirect_uri, &state)),
    )
        .into_response()
}

#[derive(Deserialize, IntoParams)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by providers when the user denies consent.
    pub error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/{provider}/callback",
    tag = OAUTH_TAG,
    operation_id = "Provider callback",
    params(("provider" = String, Path, description = "Provider name"), CallbackParams),
    responses(
        (status = 303, description = "Redirect to the frontend callback page or /auth/error")
    ),
)]
async fn callback(
    Extension(resources): Extension<AppResources>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    let secure = resources.secure_cookies();

    // The CSRF cookie gets exactly one chance; clear it before anything
    // can fail.
    let csrf = jar
        .get(CSRF_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();
    let jar = jar.add(cookies::clear_cookie(CSRF_COOKIE, secure));

    match run_callback(&resources, &provider, &params, &csrf, &jar).await {
        Ok((jar, redirect)) => (jar, redirect).into_response(),
        Err(e) => (jar, e.into_redirect()).into_response(),
    }
}

async fn run_callback(
    resources: &AppResources,
    provider: &str,
    params: &CallbackParams,
    csrf: &str,
    jar: &CookieJar,
) -> Result<(CookieJar, Redirect), AuthError> {
    let secure = resources.secure_cookies();
    let jar = jar.clone();

    if params.error.is_some() {
        return Err(AuthError::state_invalid());
    }
    let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
        return Err(AuthError::state_invalid());
    };

    let strategy = resources
        .providers
        .get(provider)
        .ok_or_else(|| AuthError::not_found("Unknown provider"))?;

    let state = resources
        .oauth_state
        .parse(state, &resources.config.frontend_url, csrf)
        .ok_or_else(AuthError::state_invalid)?;
    if state.provider != provider {
        return Err(AuthError::state_invalid());
    }

    let redirect_uri = format!(
        "{}/auth/{}/callback",
        resources.config.public_origin, provider
    );
    let access_token = strategy
        .exchange_token(code, &redirect_uri)
        .await
        .map_err(|e| match e {
            ProviderError::TokenExchange => AuthError::token_exchange_failed(),
            ProviderError::UserInfo => AuthError::user_info_failed(),
        })?;
    let profile = strategy
        .get_user_info(&access_token)
        .await
        .map_err(|_| AuthError::user_info_failed())?;

    let identities = resources.identities();
    let existing = identities
        .find_by_subject(provider, &profile.id)
        .await
        .map_err(|e| internal("identity lookup", e))?;

    // A valid session cookie switches the callback into binding mode. The
    // cookie alone is not enough: the account behind it must still exist
    // and be active, otherwise the callback falls through to login mode.
    let session_user = match jar
        .get(AUTH_COOKIE)
        .and_then(|c| resources.tokens.verify_session(c.value()).ok())
    {
        Some(session) => user::Entity::find_by_id(&session.user_id)
            .one(resources.db.as_ref())
            .await
            .map_err(|e| internal("session user lookup", e))?
            .filter(user::Model::is_active),
        None => None,
    };

    if let Some(account) = session_user {
        let status = match existing {
            Some(row) if row.user_id == account.id => "ALREADY_BOUND",
            Some(_) => "CONFLICT",
            None => {
                identities
                    .create(&account.id, provider, &profile.id, &profile.username)
                    .await
                    .map_err(|e| internal("identity create", e))?;
                "BOUND"
            }
        };
        return Ok((jar, frontend_redirect(&state.target, provider, status)));
    }

    match existing {
        Some(row) => {
            let user = user::Entity::find_by_id(&row.user_id)
                .one(resources.db.as_ref())
                .await
                .map_err(|e| internal("identity user lookup", e))?
                .ok_or_else(|| internal("identity user lookup", "dangling identity row"))?;

            if !user.is_active() {
                return Err(AuthError::account_withdrawn());
            }
            if let Some(remaining) = resources.guard.is_user_blocked(&user.username) {
                return Err(AuthError::account_blocked(remaining.as_secs() as i64));
            }

            let (jar, _) = establish_session(resources, jar, &user)?;
            touch_last_login(resources, &user.id).await?;
            Ok((
                jar,
                frontend_redirect(&state.target, provider, "LOGIN_SUCCESS"),
            ))
        }
        None => {
            let token = resources
                .binding
                .seal(provider, &profile.id, &profile.username)
                .ok_or_else(|| internal("binding token seal", "sealing failed"))?;
            let jar = jar.add(cookies::binding_cookie(&token, secure));
            Ok((
                jar,
                frontend_redirect(&state.target, provider, "PENDING_BIND"),
            ))
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct BindRequest {
    pub username: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/bind",
    tag = OAUTH_TAG,
    operation_id = "Confirm identity binding",
    request_body = BindRequest,
    responses(
        (status = 200, description = "Identity bound, session established", content_type = "application/json"),
        (status = 401, description = "Invalid credentials or binding token", body = AuthError),
        (status = 403, description = "Identity bound elsewhere, account withdrawn or locked", body = AuthError)
    ),
)]
async fn bind(
    Extension(resources): Extension<AppResources>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    Json(payload): Json<BindRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let secure = resources.secure_cookies();

    let token = jar
        .get(BINDING_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AuthError::invalid_token("Missing binding token"))?;
    // One attempt per token, success or not.
    let jar = jar.add(cookies::clear_cookie(BINDING_COOKIE, secure));

    let binding = resources
        .binding
        .open(&token)
        .ok_or_else(|| AuthError::invalid_token("Binding token is invalid or expired"))?;

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

    let identities = resources.identities();
    match identities
        .find_by_subject(&binding.provider, &binding.provider_user_id)
        .await
        .map_err(|e| internal("identity lookup", e))?
    {
        Some(row) if row.user_id != user.id => return Err(AuthError::identity_conflict()),
        Some(_) => {} // already bound to this account; treat as success
        None => {
            let outcome = identities
                .create(
                    &user.id,
                    &binding.provider,
                    &binding.provider_user_id,
                    &binding.provider_username,
                )
                .await
                .map_err(|e| internal("identity create", e))?;
            if outcome == CreateOutcome::AlreadyExists {
                // Lost a race with another bind; check who won.
                let row = identities
                    .find_by_subject(&binding.provider, &binding.provider_user_id)
                    .await
                    .map_err(|e| internal("identity lookup", e))?;
                if row.is_some_and(|r| r.user_id != user.id) {
                    return Err(AuthError::identity_conflict());
                }
            }
        }
    }

    let (jar, _) = establish_session(&resources, jar, &user)?;
    touch_last_login(&resources, &user.id).await?;
    Ok((
        jar,
        Json(json!({
            "user": user,
            "bound": { "provider": binding.provider },
        })),
    ))
}
