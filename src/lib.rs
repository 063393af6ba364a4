//! # Porta (OAuth login gateway)
//!
//! `porta` sits in front of one or more application hostnames ("tenants"),
//! delegates authentication to external identity providers (Google,
//! Facebook, ...) and hands the application a short-lived **RS256 JWT**
//! asserting the user's identity. Applications verify that token offline
//! against the tenant's key set published at `/.well-known/jwks.json`.
//!
//! ## Stateless login round-trip
//!
//! The only per-login state (CSRF token + post-login redirect) travels in an
//! AES-256-GCM sealed cookie. There is no server-side session store, so any
//! replica can finish a login another replica started, provided they share
//! the cookie secret.
//!
//! ## Layout
//!
//! - [`config`]: YAML configuration file, defaults and validation.
//! - [`oauth`]: the `Provider` capability and the Google/Facebook integrations.
//! - [`porta`]: rate limiting, state codec, tenant registry, JWT issuance and
//!   the HTTP handlers.
//! - [`cli`]: argument parsing, telemetry and the server action.

pub mod cli;
pub mod config;
pub mod oauth;
pub mod porta;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
