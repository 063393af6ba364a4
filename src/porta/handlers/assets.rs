use super::request_host;
use crate::porta::Gateway;
use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::debug;

/// Serve the tenant's login page from its `login_dir`.
///
/// Directory requests fall through to `index.html`; missing files are 404.
pub async fn assets(Extension(gateway): Extension<Arc<Gateway>>, request: Request) -> Response {
    let Some(tenant) = request_host(request.headers(), request.uri())
        .and_then(|host| gateway.hosts().resolve(host))
    else {
        return (StatusCode::BAD_REQUEST, "Unknown host").into_response();
    };

    debug!(host = tenant.host(), path = request.uri().path(), "serving login asset");
    match ServeDir::new(tenant.login_dir()).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}
