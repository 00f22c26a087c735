//! Passkey registration and login endpoints.
//!
//! Registration requires a full session; login is username-first. The
//! clone defence sits at the end of login: a credential whose stored
//! signature counter is positive must present a strictly greater counter,
//! enforced through the conditional write in the identity store so
//! concurrent assertions cannot both pass.

use crate::AppResources;
use crate::api::WEBAUTHN_TAG;
use crate::api::auth::{ClientIp, SessionAuth};
use crate::api::login::{establish_session, find_by_username, touch_last_login};
use crate::auth::identity::CreateOutcome;
use crate::auth::webauthn::{StoredPasskey, WebAuthnError, credential_id_b64, filter_transports};
use crate::entity::user;
use crate::entity::user_identity::PROVIDER_WEBAUTHN;
use crate::error::{AuthError, internal};
use axum::{Extension, Json, response::IntoResponse};
use axum_extra::extract::cookie::CookieJar;
use sea_orm::EntityTrait;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

pub(crate) fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(register_options))
        .routes(routes!(register_verify))
        .routes(routes!(login_options))
        .routes(routes!(login_verify))
}

fn ceremony_error(e: WebAuthnError) -> AuthError {
    match e {
        WebAuthnError::ChallengeNotFound
        | WebAuthnError::ChallengeExpired
        | WebAuthnError::UserMismatch => AuthError::state_invalid(),
        WebAuthnError::Ceremony(e) => {
            tracing::debug!(error = %e, "webauthn ceremony rejected");
            AuthError::validation("passkey verification failed")
        }
        WebAuthnError::NoCredentials => AuthError::not_found("No passkeys registered"),
        e => internal("webauthn", e),
    }
}

async fn stored_passkeys(
    resources: &AppResources,
    user_id: &str,
) -> Result<Vec<StoredPasskey>, AuthError> {
    let rows = resources
        .identities()
        .list_for_user(user_id, Some(PROVIDER_WEBAUTHN))
        .await
        .map_err(|e| internal("passkey list", e))?;
    Ok(rows
        .iter()
        .filter_map(|row| StoredPasskey::decode(&row.provider_username))
        .collect())
}

#[utoipa::path(
    post,
    path = "/register/options",
    tag = WEBAUTHN_TAG,
    operation_id = "Passkey registration options",
    responses(
        (status = 200, description = "Creation options with existing credentials excluded", content_type = "application/json"),
        (status = 401, description = "No valid session", body = AuthError)
    ),
)]
async fn register_options(
    Extension(resources): Extension<AppResources>,
    SessionAuth(current): SessionAuth,
) -> Result<impl IntoResponse, AuthError> {
    let existing = stored_passkeys(&resources, &current.user.id).await?;
    let (challenge, challenge_id) = resources
        .webauthn
        .start_registration(&current.user.id, &current.user.username, &existing)
        .map_err(ceremony_error)?;

    Ok(Json(json!({
        "challengeId": challenge_id,
        "publicKey": challenge,
    })))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVerifyRequest {
    pub challenge_id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Transport hints from `getTransports()` on the client.
    #[serde(default)]
    pub transports: Vec<String>,
    #[schema(value_type = Object)]
    pub credential: RegisterPublicKeyCredential,
}

#[utoipa::path(
    post,
    path = "/register/verify",
    tag = WEBAUTHN_TAG,
    operation_id = "Finish passkey registration",
    request_body = RegisterVerifyRequest,
    responses(
        (status = 200, description = "Passkey stored", content_type = "application/json"),
        (status = 400, description = "Ceremony verification failed", body = AuthError),
        (status = 401, description = "No valid session", body = AuthError)
    ),
)]
async fn register_verify(
    Extension(resources): Extension<AppResources>,
    SessionAuth(current): SessionAuth,
    Json(payload): Json<RegisterVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let passkey = resources
        .webauthn
        .finish_registration(&payload.challenge_id, &current.user.id, &payload.credential)
        .map_err(ceremony_error)?;

    let label = payload.label.as_deref().unwrap_or("Passkey");
    let transports = filter_transports(&payload.transports);
    let stored = StoredPasskey::new(label, passkey, &transports);
    let credential_id = stored.credential_id_b64();
    let blob = stored
        .encode()
        .map_err(|e| internal("passkey encode", e))?;

    let identities = resources.identities();
    let outcome = identities
        .create(&current.user.id, PROVIDER_WEBAUTHN, &credential_id, &blob)
        .await
        .map_err(|e| internal("passkey create", e))?;
    if outcome == CreateOutcome::AlreadyExists {
        let row = identities
            .find_by_subject(PROVIDER_WEBAUTHN, &credential_id)
            .await
            .map_err(|e| internal("passkey lookup", e))?;
        if row.is_some_and(|r| r.user_id != current.user.id) {
            return Err(AuthError::identity_conflict());
        }
    }

    Ok(Json(json!({
        "credentialId": credential_id,
        "label": label,
    })))
}

#[derive(Deserialize, ToSchema)]
pub struct LoginOptionsRequest {
    pub username: String,
}

#[utoipa::path(
    post,
    path = "/login/options",
    tag = WEBAUTHN_TAG,
    operation_id = "Passkey login options",
    request_body = LoginOptionsRequest,
    responses(
        (status = 200, description = "Assertion options over the user's passkeys", content_type = "application/json"),
        (status = 401, description = "Unknown username", body = AuthError),
        (status = 404, description = "No passkeys registered", body = AuthError)
    ),
)]
async fn login_options(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<LoginOptionsRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user = find_by_username(&resources, &payload.username)
        .await?
        .ok_or_else(AuthError::invalid_credentials)?;
    if !user.is_active() {
        return Err(AuthError::account_withdrawn());
    }
    if let Some(remaining) = resources.guard.is_user_blocked(&user.username) {
        return Err(AuthError::account_blocked(remaining.as_secs() as i64));
    }

    let passkeys = stored_passkeys(&resources, &user.id).await?;
    let (challenge, challenge_id) = resources
        .webauthn
        .start_authentication(&passkeys)
        .map_err(ceremony_error)?;

    Ok(Json(json!({
        "challengeId": challenge_id,
        "publicKey": challenge,
    })))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginVerifyRequest {
    pub challenge_id: String,
    #[schema(value_type = Object)]
    pub credential: PublicKeyCredential,
}

#[utoipa::path(
    post,
    path = "/login/verify",
    tag = WEBAUTHN_TAG,
    operation_id = "Finish passkey login",
    request_body = LoginVerifyRequest,
    responses(
        (status = 200, description = "Session established", content_type = "application/json"),
        (status = 401, description = "Assertion rejected or counter replayed", body = AuthError),
        (status = 403, description = "Account withdrawn or locked out", body = AuthError)
    ),
)]
async fn login_verify(
    Extension(resources): Extension<AppResources>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    Json(payload): Json<LoginVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let result = resources
        .webauthn
        .finish_authentication(&payload.challenge_id, &payload.credential)
        .map_err(ceremony_error)?;
    let credential_id = credential_id_b64(&result);

    let identities = resources.identities();
    let row = identities
        .find_by_subject(PROVIDER_WEBAUTHN, &credential_id)
        .await
        .map_err(|e| internal("passkey lookup", e))?
        .ok_or_else(AuthError::invalid_credentials)?;

    let user = user::Entity::find_by_id(&row.user_id)
        .one(resources.db.as_ref())
        .await
        .map_err(|e| internal("passkey user lookup", e))?
        .ok_or_else(|| internal("passkey user lookup", "dangling identity row"))?;

    if !user.is_active() {
        return Err(AuthError::account_withdrawn());
    }
    if let Some(remaining) = resources.guard.lock_remaining(&user.username, &ip) {
        return Err(AuthError::account_blocked(remaining.as_secs() as i64));
    }

    // Counter-reporting authenticators must advance strictly; the
    // conditional write refuses equal or lower values atomically.
    let new_counter = i64::from(result.counter());
    if new_counter > 0 {
        let advanced = identities
            .bump_counter(PROVIDER_WEBAUTHN, &credential_id, new_counter)
            .await
            .map_err(|e| internal("counter update", e))?;
        if !advanced {
            resources.guard.record_failure(&user.username, &ip);
            tracing::warn!(username = %user.username, "passkey counter did not advance");
            return Err(AuthError::credential_replay());
        }
    } else if row.counter > 0 {
        resources.guard.record_failure(&user.username, &ip);
        tracing::warn!(username = %user.username, "passkey counter regressed to zero");
        return Err(AuthError::credential_replay());
    }

    resources.guard.record_success(&user.username, &ip);
    let (jar, _) = establish_session(&resources, jar, &user)?;
    touch_last_login(&resources, &user.id).await?;
    Ok((jar, Json(json!({ "user": user }))))
}
