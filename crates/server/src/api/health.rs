use crate::AppResources;
use crate::api::MISC_TAG;
use axum::{Extension, Json, http::StatusCode, response::IntoResponse};
use sea_orm::ConnectionTrait;
use serde_json::json;
use utoipa_axum::{router::OpenApiRouter, routes};

pub(crate) fn router() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(healthz))
}

#[utoipa::path(
    get,
    path = "/healthz",
    tag = MISC_TAG,
    operation_id = "Health check",
    responses(
        (status = 200, description = "Server and database are reachable", content_type = "application/json"),
        (status = 503, description = "Database unreachable", content_type = "application/json")
    ),
)]
async fn healthz(Extension(resources): Extension<AppResources>) -> impl IntoResponse {
    match resources.db.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(error = %e, "database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            )
        }
    }
}
