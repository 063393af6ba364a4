use super::{callback_url, cleared_state_cookie, is_secure, request_host, request_scheme};
use crate::{
    oauth::{Identity, Provider, ProviderError, PROVIDER_HTTP_TIMEOUT},
    porta::{
        hosts::TenantConfig,
        metrics::{record_authentication, AuthOutcome, FailureReason},
        shutdown::Shutdown,
        state::{LoginState, StateError},
        token::TokenError,
        Gateway,
    },
};
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::{future::Future, sync::Arc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use url::Url;
use utoipa::IntoParams;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    /// CSRF token echoed back by the provider.
    pub state: Option<String>,
    /// Authorization code to exchange.
    pub code: Option<String>,
    /// Set by the provider when the user declined consent.
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Failure of an outbound provider call.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider call timed out")]
    Timeout,
    #[error("provider call cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("unknown host")]
    UnknownHost,
    #[error("unknown provider")]
    UnknownProvider,
    #[error("state cookie missing")]
    MissingStateCookie,
    #[error("state cookie rejected: {0}")]
    InvalidState(#[source] StateError),
    #[error("state cookie carries an empty field")]
    EmptyState,
    #[error("stored redirect is not a URL: {0}")]
    InvalidRedirect(#[source] url::ParseError),
    #[error("state parameter does not match the cookie")]
    StateMismatch,
    #[error("provider returned error {error}: {description}")]
    UserDenied { error: String, description: String },
    #[error("authorization code missing")]
    MissingCode,
    #[error("code exchange failed: {0}")]
    Exchange(#[source] UpstreamError),
    #[error("identity resolution failed: {0}")]
    Identity(#[source] UpstreamError),
    #[error("provider returned no email")]
    EmailMissing,
    #[error("failed to sign token: {0}")]
    Token(#[source] TokenError),
}

impl CallbackError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownProvider => StatusCode::NOT_FOUND,
            Self::Identity(_) | Self::EmailMissing => StatusCode::UNAUTHORIZED,
            Self::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownHost
            | Self::MissingStateCookie
            | Self::InvalidState(_)
            | Self::EmptyState
            | Self::InvalidRedirect(_)
            | Self::StateMismatch
            | Self::UserDenied { .. }
            | Self::MissingCode
            | Self::Exchange(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Metric reason, once the tenant and provider are known.
    #[must_use]
    pub const fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::UnknownHost | Self::UnknownProvider => None,
            Self::MissingStateCookie => Some(FailureReason::MissingStateCookie),
            Self::InvalidState(_) | Self::EmptyState | Self::InvalidRedirect(_) => {
                Some(FailureReason::InvalidState)
            }
            Self::StateMismatch => Some(FailureReason::StateMismatch),
            Self::UserDenied { .. } => Some(FailureReason::UserDenied),
            Self::MissingCode => Some(FailureReason::MissingCode),
            Self::Exchange(_) | Self::Identity(_) => Some(FailureReason::ProviderError),
            Self::EmailMissing => Some(FailureReason::EmailMissing),
            Self::Token(_) => Some(FailureReason::TokenError),
        }
    }

    const fn public_message(&self) -> &'static str {
        match self {
            Self::UnknownHost => "Unknown host",
            Self::UnknownProvider => "Unknown provider",
            Self::MissingStateCookie
            | Self::InvalidState(_)
            | Self::EmptyState
            | Self::InvalidRedirect(_)
            | Self::StateMismatch => "Invalid state",
            Self::UserDenied { .. } => "Authentication was denied",
            Self::MissingCode => "Missing authorization code",
            Self::Exchange(_) | Self::Identity(_) => "Authentication failed",
            Self::EmailMissing => "Email address unavailable",
            Self::Token(_) => "Internal server error",
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/oauth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. google"),
        CallbackParams,
    ),
    responses (
        (status = 303, description = "Redirect to the application with `?token=`"),
        (status = 400, description = "Invalid state, denied consent or failed exchange"),
        (status = 401, description = "Identity could not be established"),
        (status = 404, description = "Provider not enabled for this host"),
        (status = 500, description = "Token signing failed"),
    ),
    tag = "oauth"
)]
#[instrument(skip_all, fields(provider = %name))]
pub async fn callback(
    Extension(gateway): Extension<Arc<Gateway>>,
    Path(name): Path<String>,
    query: Option<Query<CallbackParams>>,
    headers: HeaderMap,
    uri: Uri,
    jar: CookieJar,
) -> Response {
    let Some(host) = request_host(&headers, &uri) else {
        return CallbackError::UnknownHost.into_response();
    };
    let Some(tenant) = gateway.hosts().resolve(host) else {
        return CallbackError::UnknownHost.into_response();
    };
    let Some(provider) = tenant.provider(&name).cloned() else {
        return CallbackError::UnknownProvider.into_response();
    };

    let Some(sealed) = jar
        .get(gateway.cookie_name())
        .map(|cookie| cookie.value().to_owned())
    else {
        return fail(&name, &tenant, CallbackError::MissingStateCookie).into_response();
    };

    let flow = CallbackFlow {
        gateway: &gateway,
        tenant: &tenant,
        provider: provider.as_ref(),
        scheme: request_scheme(&headers),
        host,
        name: &name,
    };
    let params = query.map(|Query(params)| params).unwrap_or_default();
    let outcome = flow.complete(&sealed, params).await;

    // Any attempt that reached decryption consumes the state.
    let jar = jar.add(cleared_state_cookie(
        gateway.cookie_name(),
        is_secure(&headers),
    ));

    match outcome {
        Ok(target) => {
            record_authentication(&name, tenant.host(), AuthOutcome::Success);
            info!(host = tenant.host(), "authentication succeeded");
            (jar, Redirect::to(target.as_str())).into_response()
        }
        Err(err) => (jar, fail(&name, &tenant, err)).into_response(),
    }
}

fn fail(provider: &str, tenant: &TenantConfig, err: CallbackError) -> CallbackError {
    if let Some(reason) = err.reason() {
        record_authentication(provider, tenant.host(), AuthOutcome::Failure(reason));
        if err.status().is_server_error() {
            error!(host = tenant.host(), reason = reason.as_str(), "{}", err);
        } else {
            warn!(host = tenant.host(), reason = reason.as_str(), "{}", err);
        }
    }
    err
}

struct CallbackFlow<'a> {
    gateway: &'a Gateway,
    tenant: &'a TenantConfig,
    provider: &'a dyn Provider,
    scheme: &'a str,
    host: &'a str,
    name: &'a str,
}

impl CallbackFlow<'_> {
    /// Validate the returning browser and mint a token; yields the final
    /// redirect target.
    async fn complete(&self, sealed: &str, params: CallbackParams) -> Result<Url, CallbackError> {
        let LoginState {
            csrf_token,
            redirect,
        } = self
            .gateway
            .codec()
            .decrypt(sealed)
            .map_err(CallbackError::InvalidState)?;
        if csrf_token.is_empty() || redirect.is_empty() {
            return Err(CallbackError::EmptyState);
        }
        let mut target = Url::parse(&redirect).map_err(CallbackError::InvalidRedirect)?;

        if params.state.as_deref() != Some(csrf_token.as_str()) {
            return Err(CallbackError::StateMismatch);
        }
        if let Some(error) = params.error {
            return Err(CallbackError::UserDenied {
                error,
                description: params.error_description.unwrap_or_default(),
            });
        }
        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or(CallbackError::MissingCode)?;

        let identity = self.authenticate(&code).await?;

        let issuer = format!("{}://{}", self.scheme, self.host);
        let token = self
            .tenant
            .issue_token(&issuer, &identity)
            .map_err(CallbackError::Token)?;

        target.query_pairs_mut().append_pair("token", &token);
        Ok(target)
    }

    async fn authenticate(&self, code: &str) -> Result<Identity, CallbackError> {
        let shutdown = self.gateway.shutdown();
        let callback = callback_url(self.scheme, self.host, self.name);

        let tokens = bounded(shutdown, self.provider.exchange_code(code, &callback))
            .await
            .map_err(CallbackError::Exchange)?;

        let identity = match bounded(shutdown, self.provider.resolve_identity(&tokens)).await {
            Ok(identity) => identity,
            Err(UpstreamError::Provider(ProviderError::MissingEmail)) => {
                return Err(CallbackError::EmailMissing)
            }
            Err(err) => return Err(CallbackError::Identity(err)),
        };
        if identity.email.is_empty() {
            return Err(CallbackError::EmailMissing);
        }
        Ok(identity)
    }
}

/// Run a provider call under the per-call timeout, giving up when ongoing
/// operations are cancelled.
async fn bounded<T, F>(shutdown: &Shutdown, call: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        () = shutdown.ongoing().cancelled() => Err(UpstreamError::Cancelled),
        result = tokio::time::timeout(PROVIDER_HTTP_TIMEOUT, call) => match result {
            Ok(result) => result.map_err(UpstreamError::from),
            Err(_) => Err(UpstreamError::Timeout),
        },
    }
}
