use crate::{porta::Gateway, GIT_COMMIT_HASH};
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::debug;

#[utoipa::path(
    get,
    path = "/healthz",
    responses (
        (status = 200, description = "Gateway is serving", body = String),
        (status = 503, description = "Gateway is shutting down", body = String),
    ),
    tag = "health",
)]
// axum handler for health
pub async fn health(Extension(gateway): Extension<Arc<Gateway>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    match app_header().parse::<HeaderValue>() {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => debug!("Failed to parse X-App header: {}", err),
    }

    if gateway.shutdown().is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, headers, "Shutting down")
    } else {
        (StatusCode::OK, headers, "OK")
    }
}

fn app_header() -> String {
    let short_hash = if GIT_COMMIT_HASH.len() > 7 {
        &GIT_COMMIT_HASH[0..7]
    } else {
        GIT_COMMIT_HASH
    };
    format!(
        "{}:{}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_hash
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_header_shape() {
        let header = app_header();
        let parts: Vec<&str> = header.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "porta");
        assert_eq!(parts[1], env!("CARGO_PKG_VERSION"));
        assert!(parts[2].len() <= 7);
    }
}
