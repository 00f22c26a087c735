//! HTTP surface: route assembly, OpenAPI document and the server entry
//! point.
//!
//! Everything auth-related hangs off `/auth`; WebAuthn ceremonies off
//! `/auth/webauthn`. Handlers receive shared resources through an axum
//! Extension rather than router state so extractors can reach them too.

use crate::AppResources;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_redoc::{Redoc, Servable};

pub mod auth;
pub mod health;
pub mod login;
pub mod oauth;
pub mod webauthn;

const AUTH_TAG: &str = "Authentication";
const OAUTH_TAG: &str = "External Identity";
const WEBAUTHN_TAG: &str = "Passkeys";
const MISC_TAG: &str = "Miscellaneous";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "OnAir Auth API",
        version = "1.0.0",
        description = "Authentication and identity-binding API for the OnAir campus radio platform."
    ),
    tags(
        (name = AUTH_TAG, description = "Password login, sessions and second factors"),
        (name = OAUTH_TAG, description = "OAuth providers and identity binding"),
        (name = WEBAUTHN_TAG, description = "Passkey registration and login"),
        (name = MISC_TAG, description = "Miscellaneous endpoints")
    )
)]
struct ApiDoc;

/// Full application router. Split out of `start_webserver` so tests can
/// drive it in-process.
pub fn build_router(resources: AppResources) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/auth", login::router().merge(oauth::router()))
        .nest("/auth/webauthn", webauthn::router())
        .merge(health::router())
        .layer(axum::Extension(resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

pub async fn start_webserver(resources: AppResources) -> color_eyre::Result<()> {
    let router = build_router(resources);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Server running on http://0.0.0.0:8080");
    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
