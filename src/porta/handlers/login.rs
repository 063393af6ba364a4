use super::{callback_url, csrf_token, is_secure, request_host, request_scheme, state_cookie};
use crate::porta::{state::StateError, Gateway};
use axum::{
    extract::{Extension, Path, Query},
    http::{header::LOCATION, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;
use utoipa::IntoParams;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LoginParams {
    /// Where the browser returns once a token has been issued.
    pub redirect: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("unknown host")]
    UnknownHost,
    #[error("unknown provider")]
    UnknownProvider,
    #[error("missing or malformed redirect")]
    InvalidRedirect,
    #[error("redirect not allowed")]
    RedirectNotAllowed,
    #[error("failed to seal login state: {0}")]
    State(#[from] StateError),
}

impl LoginError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownProvider => StatusCode::NOT_FOUND,
            Self::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownHost | Self::InvalidRedirect | Self::RedirectNotAllowed => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    const fn public_message(&self) -> &'static str {
        match self {
            Self::UnknownHost => "Unknown host",
            Self::UnknownProvider => "Unknown provider",
            Self::InvalidRedirect => "Invalid redirect",
            Self::RedirectNotAllowed => "Redirect not allowed",
            Self::State(_) => "Internal server error",
        }
    }
}

impl IntoResponse for LoginError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/oauth/login/{provider}",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. google"),
        LoginParams,
    ),
    responses (
        (status = 302, description = "Redirect to the provider's consent page"),
        (status = 400, description = "Unknown host or rejected redirect"),
        (status = 404, description = "Provider not enabled for this host"),
    ),
    tag = "oauth"
)]
#[instrument(skip_all, fields(provider = %name))]
pub async fn login(
    Extension(gateway): Extension<Arc<Gateway>>,
    Path(name): Path<String>,
    query: Option<Query<LoginParams>>,
    headers: HeaderMap,
    uri: Uri,
    jar: CookieJar,
) -> Result<(CookieJar, Response), LoginError> {
    let host = request_host(&headers, &uri).ok_or(LoginError::UnknownHost)?;
    let tenant = gateway
        .hosts()
        .resolve(host)
        .ok_or(LoginError::UnknownHost)?;
    let provider = tenant.provider(&name).ok_or(LoginError::UnknownProvider)?;

    let redirect = query
        .and_then(|Query(params)| params.redirect)
        .filter(|redirect| Url::parse(redirect).is_ok())
        .ok_or(LoginError::InvalidRedirect)?;
    if !tenant.allows_redirect(&redirect) {
        debug!(host = tenant.host(), "redirect rejected by allow-list");
        return Err(LoginError::RedirectNotAllowed);
    }

    let csrf = csrf_token();
    let sealed = gateway.codec().encrypt(&csrf, &redirect).map_err(|err| {
        error!("Failed to seal login state: {}", err);
        LoginError::from(err)
    })?;
    let jar = jar.add(state_cookie(gateway.cookie_name(), sealed, is_secure(&headers)));

    let callback = callback_url(request_scheme(&headers), host, &name);
    let location = provider.authorization_url(&csrf, &callback);
    debug!(host = tenant.host(), "redirecting to provider");

    Ok((
        jar,
        (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response(),
    ))
}
