pub mod health;
pub use self::health::health;

pub mod jwks;
pub use self::jwks::jwks;

pub mod login;
pub use self::login::login;

pub mod callback;
pub use self::callback::callback;

pub mod assets;
pub use self::assets::assets;

pub mod metrics;
pub use self::metrics::metrics;

use crate::porta::state::STATE_TTL;
use axum::http::{header::HOST, HeaderMap, Uri};
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

/// Bytes of entropy in a CSRF token.
const CSRF_TOKEN_BYTES: usize = 32;

/// Host the request was addressed to: the `Host` header, else the URI authority.
pub(crate) fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
        .filter(|host| !host.is_empty())
}

/// Scheme the browser used, as reported by the reverse proxy.
pub(crate) fn request_scheme(headers: &HeaderMap) -> &str {
    ["x-forwarded-proto", "x-scheme"]
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or("http")
}

pub(crate) fn is_secure(headers: &HeaderMap) -> bool {
    request_scheme(headers).eq_ignore_ascii_case("https")
}

pub(crate) fn callback_url(scheme: &str, host: &str, provider: &str) -> String {
    format!("{scheme}://{host}/oauth/callback/{provider}")
}

pub(crate) fn csrf_token() -> String {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Cookie carrying the sealed login state between login and callback.
pub(crate) fn state_cookie(name: &str, sealed: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_owned(), sealed))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds_f64(STATE_TTL.as_secs_f64()))
        .build()
}

/// Empty, already-expired replacement for the state cookie.
pub(crate) fn cleared_state_cookie(name: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_owned(), String::new()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO)
        .build()
}
