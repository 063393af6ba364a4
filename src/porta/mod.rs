#![allow(clippy::needless_for_each)]

pub mod handlers;
pub mod hosts;
pub mod metrics;
pub mod ratelimit;
pub mod shutdown;
pub mod state;
pub mod token;

use self::{
    hosts::HostRegistry,
    metrics::HttpMetrics,
    ratelimit::RateLimitGuard,
    shutdown::{Shutdown, ShutdownPhases},
    state::StateCodec,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware,
    routing::get,
    Extension, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;
use utoipa::OpenApi;

const REQUEST_ID: &str = "x-request-id";

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::jwks::jwks,
        handlers::login::login,
        handlers::callback::callback,
    ),
    tags(
        (name = "porta", description = "Multi-tenant OAuth login gateway"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Everything a request handler needs, shared behind an `Arc`.
pub struct Gateway {
    hosts: HostRegistry,
    codec: StateCodec,
    cookie_name: String,
    shutdown: Shutdown,
    prometheus: Option<PrometheusHandle>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("hosts", &self.hosts.len())
            .field("cookie_name", &self.cookie_name)
            .field("draining", &self.shutdown.is_draining())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    #[must_use]
    pub fn new(
        hosts: HostRegistry,
        codec: StateCodec,
        cookie_name: impl Into<String>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            hosts,
            codec,
            cookie_name: cookie_name.into(),
            shutdown,
            prometheus: None,
        }
    }

    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    #[must_use]
    pub const fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    #[must_use]
    pub const fn codec(&self) -> &StateCodec {
        &self.codec
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub const fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    #[must_use]
    pub const fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

/// Build the HTTP surface.
///
/// JWKS, login, callback and static assets sit behind the rate limiter; the
/// health check and the metrics endpoint (when `metrics_path` is set) do not.
pub fn router(gateway: Arc<Gateway>, guard: RateLimitGuard, metrics_path: Option<&str>) -> Router {
    let limited = Router::new()
        .route("/.well-known/jwks.json", get(handlers::jwks))
        .route("/oauth/login/:provider", get(handlers::login))
        .route("/oauth/callback/:provider", get(handlers::callback))
        .fallback(handlers::assets)
        .layer(middleware::from_fn_with_state(guard, ratelimit::enforce));

    let mut app = Router::new()
        .route("/healthz", get(handlers::health))
        .merge(limited);

    if let Some(path) = metrics_path {
        app = app
            .route(path, get(handlers::metrics))
            .layer(middleware::from_fn_with_state(
                HttpMetrics {
                    ignore_path: path.to_string(),
                },
                metrics::track,
            ));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static(REQUEST_ID),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                REQUEST_ID,
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(gateway)),
    )
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = route,
        request_id
    )
}

/// Serve `app` until `shutdown` is triggered, then run the drain and listener
/// phases. Cancelling ongoing work is left to the caller.
///
/// # Errors
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: &Shutdown,
    phases: ShutdownPhases,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    let closing = CancellationToken::new();
    let drain = {
        let root = shutdown.root().clone();
        let closing = closing.clone();
        async move {
            root.cancelled().await;
            info!(
                "Shutdown requested, draining for {:?}",
                phases.readiness_drain
            );
            tokio::time::sleep(phases.readiness_drain).await;
            info!("Closing listener");
            closing.cancel();
        }
    };

    let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(drain)
        .await
    });

    tokio::select! {
        result = &mut server => {
            return result.context("server task failed")?.context("server error");
        }
        () = closing.cancelled() => {}
    }

    match tokio::time::timeout(phases.listener_timeout, &mut server).await {
        Ok(result) => result.context("server task failed")?.context("server error")?,
        Err(_) => {
            warn!(
                "Connections still open after {:?}, closing them",
                phases.listener_timeout
            );
            server.abort();
        }
    }

    info!("Listener closed");
    Ok(())
}
