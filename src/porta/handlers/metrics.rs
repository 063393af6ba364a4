use crate::porta::Gateway;
use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Prometheus text exposition of the gateway's counters.
pub async fn metrics(Extension(gateway): Extension<Arc<Gateway>>) -> Response {
    match gateway.prometheus() {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
