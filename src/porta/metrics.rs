//! Prometheus counters for HTTP traffic and login outcomes.
//!
//! Everything goes through the `metrics` facade; until [`install_exporter`]
//! runs, recording is a no-op.

use axum::{
    extract::{MatchedPath, Request, State},
    http::header::HOST,
    middleware::Next,
    response::Response,
};
use metrics::Label;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::{sync::OnceLock, time::Instant};

pub const HTTP_REQUESTS_TOTAL: &str = "porta_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "porta_http_request_duration_seconds";
pub const AUTHENTICATIONS_TOTAL: &str = "porta_authentications_total";

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0];

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be built or another recorder is
/// already installed.
pub fn install_exporter() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(HTTP_REQUEST_DURATION.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    describe();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

fn describe() {
    metrics::describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests");
    metrics::describe_histogram!(
        HTTP_REQUEST_DURATION,
        metrics::Unit::Seconds,
        "HTTP request latency in seconds"
    );
    metrics::describe_counter!(AUTHENTICATIONS_TOTAL, "Total number of authentication attempts");
}

/// Why a callback did not produce a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MissingStateCookie,
    InvalidState,
    StateMismatch,
    UserDenied,
    MissingCode,
    ProviderError,
    EmailMissing,
    TokenError,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingStateCookie => "missing_state_cookie",
            Self::InvalidState => "invalid_state",
            Self::StateMismatch => "state_mismatch",
            Self::UserDenied => "user_denied",
            Self::MissingCode => "missing_code",
            Self::ProviderError => "provider_error",
            Self::EmailMissing => "email_missing",
            Self::TokenError => "token_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure(FailureReason),
}

impl AuthOutcome {
    const fn status(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
        }
    }

    const fn reason(self) -> &'static str {
        match self {
            Self::Success => "",
            Self::Failure(reason) => reason.as_str(),
        }
    }
}

pub fn record_authentication(provider: &str, host: &str, outcome: AuthOutcome) {
    let labels = vec![
        Label::new("provider", provider.to_owned()),
        Label::new("host", host.to_owned()),
        Label::new("status", outcome.status()),
        Label::new("reason", outcome.reason()),
    ];
    metrics::counter!(AUTHENTICATIONS_TOTAL, labels).increment(1);
}

pub fn record_http_request(method: &str, path: &str, status: u16, host: &str, seconds: f64) {
    let counter_labels = vec![
        Label::new("method", method.to_owned()),
        Label::new("path", path.to_owned()),
        Label::new("status_code", status.to_string()),
        Label::new("host", host.to_owned()),
    ];
    metrics::counter!(HTTP_REQUESTS_TOTAL, counter_labels).increment(1);

    let duration_labels = vec![
        Label::new("method", method.to_owned()),
        Label::new("path", path.to_owned()),
        Label::new("host", host.to_owned()),
    ];
    metrics::histogram!(HTTP_REQUEST_DURATION, duration_labels).record(seconds);
}

/// Path excluded from HTTP metrics (the scrape endpoint itself).
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    pub ignore_path: String,
}

/// Middleware recording request count and latency per route.
pub async fn track(State(config): State<HttpMetrics>, request: Request, next: Next) -> Response {
    let raw_path = request.uri().path().to_string();
    if raw_path == config.ignore_path {
        return next.run(request).await;
    }

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(raw_path, |matched| matched.as_str().to_string());
    let method = request.method().to_string();
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        &host,
        start.elapsed().as_secs_f64(),
    );

    response
}


#[cfg(test)]
mod tests {
    use super::testing::{capture, counter};
    use super::*;

    #[test]
    fn authentication_outcomes_are_labelled() {
        let ((), snapshot) = capture(|| {
            record_authentication("google", "a.example.com", AuthOutcome::Success);
            record_authentication(
                "google",
                "a.example.com",
                AuthOutcome::Failure(FailureReason::StateMismatch),
            );
            record_authentication(
                "google",
                "a.example.com",
                AuthOutcome::Failure(FailureReason::StateMismatch),
            );
        });

        assert_eq!(
            counter(
                &snapshot,
                AUTHENTICATIONS_TOTAL,
                &[
                    ("provider", "google"),
                    ("host", "a.example.com"),
                    ("status", "success"),
                    ("reason", ""),
                ],
            ),
            1
        );
        assert_eq!(
            counter(
                &snapshot,
                AUTHENTICATIONS_TOTAL,
                &[
                    ("provider", "google"),
                    ("host", "a.example.com"),
                    ("status", "failure"),
                    ("reason", "state_mismatch"),
                ],
            ),
            2
        );
    }

    #[test]
    fn http_requests_are_counted() {
        let ((), snapshot) = capture(|| {
            record_http_request("GET", "/healthz", 200, "a.example.com", 0.01);
        });
        assert_eq!(
            counter(
                &snapshot,
                HTTP_REQUESTS_TOTAL,
                &[
                    ("method", "GET"),
                    ("path", "/healthz"),
                    ("status_code", "200"),
                    ("host", "a.example.com"),
                ],
            ),
            1
        );
    }

    #[test]
    fn reasons_are_snake_case() {
        let reasons = [
            FailureReason::MissingStateCookie,
            FailureReason::InvalidState,
            FailureReason::StateMismatch,
            FailureReason::UserDenied,
            FailureReason::MissingCode,
            FailureReason::ProviderError,
            FailureReason::EmailMissing,
            FailureReason::TokenError,
        ];
        for reason in reasons {
            let label = reason.as_str();
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
