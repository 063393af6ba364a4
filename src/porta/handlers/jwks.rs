use super::request_host;
use crate::porta::Gateway;
use axum::{
    extract::Extension,
    http::{header::CACHE_CONTROL, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses (
        (status = 200, description = "Public signing key of the requested host", body = String, content_type = "application/json"),
        (status = 400, description = "Unknown host"),
    ),
    tag = "jwks"
)]
pub async fn jwks(
    Extension(gateway): Extension<Arc<Gateway>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Some(tenant) = request_host(&headers, &uri).and_then(|host| gateway.hosts().resolve(host))
    else {
        return (StatusCode::BAD_REQUEST, "Unknown host").into_response();
    };

    (
        [(CACHE_CONTROL, "public, max-age=3600")],
        Json(tenant.jwks()),
    )
        .into_response()
}
