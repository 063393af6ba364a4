//! YAML configuration file.
//!
//! `${VAR}` placeholders are substituted from the environment before the
//! document is parsed, so secrets can stay out of the file itself.

use crate::oauth::{deserialize_secret, ProviderCredentials};
use crate::porta::ratelimit::RateLimitConfig;
use anyhow::{bail, ensure, Context, Result};
use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Routes the gateway always serves; `metrics.path` may not shadow them.
const RESERVED_PATHS: &[&str] = &["/healthz", "/.well-known/jwks.json"];
const RESERVED_PREFIXES: &[&str] = &["/oauth/"];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration: {0:?}")]
pub struct DurationError(pub String);

/// Parse durations such as `15m`, `1h30m`, `90s` or `250ms`.
///
/// # Errors
///
/// Returns [`DurationError`] when `input` is empty, has a unit other than
/// `h`, `m`, `s` or `ms`, or a number without a unit (except a bare `0`).
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError(input.to_string());
    let trimmed = input.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            (Duration::from_millis(1), 2)
        } else if rest.starts_with('h') {
            (Duration::from_secs(3600), 1)
        } else if rest.starts_with('m') {
            (Duration::from_secs(60), 1)
        } else if rest.starts_with('s') {
            (Duration::from_secs(1), 1)
        } else {
            return Err(invalid());
        };
        rest = &rest[len..];

        let part = u32::try_from(value)
            .ok()
            .and_then(|value| unit.checked_mul(value))
            .ok_or_else(invalid)?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Replace `${VAR}` placeholders using `lookup`.
///
/// # Errors
///
/// Returns an error naming the first variable `lookup` cannot resolve.
pub fn expand_vars<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let mut missing = None;
    let expanded = pattern.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });

    if let Some(name) = missing {
        bail!("environment variable {name} is not set");
    }
    Ok(expanded.into_owned())
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub server: ServerConfig,
    pub cookie: CookieConfig,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret: SecretString,
    #[serde(default = "default_cookie_name")]
    pub name: String,
}

impl fmt::Debug for CookieConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieConfig")
            .field("secret", &"[REDACTED]")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
    #[serde(default)]
    pub x_forwarded_for_index: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            cleanup_interval: default_cleanup_interval(),
            x_forwarded_for_index: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub login_dir: PathBuf,
    #[serde(default)]
    pub allowed_redirect_urls: Vec<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderCredentials>,
    pub jwt: JwtConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    pub private_key_file: PathBuf,
    pub kid: String,
    pub audience: String,
    pub expiry: String,
}

fn is_reserved_path(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    RESERVED_PATHS.contains(&path)
        || path == "/oauth"
        || RESERVED_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
}

const fn default_port() -> u16 {
    8080
}

fn default_cookie_name() -> String {
    "oauth_state".to_string()
}

const fn default_requests_per_minute() -> u32 {
    60
}

fn default_cleanup_interval() -> String {
    "5m".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Config {
    /// Read, expand and validate the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, references an unset
    /// environment variable, or fails parsing or validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse configuration from YAML text, expanding `${VAR}` from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing or validation fails.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_vars(raw, |name| std::env::var(name).ok())?;
        let config: Self = serde_yaml::from_str(&expanded).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cookie.secret.expose_secret().is_empty(),
            "cookie.secret is required"
        );
        ensure!(!self.cookie.name.is_empty(), "cookie.name must not be empty");
        ensure!(
            self.ratelimit.requests_per_minute > 0,
            "ratelimit.requests_per_minute must be greater than zero"
        );
        let cleanup = parse_duration(&self.ratelimit.cleanup_interval)
            .context("ratelimit.cleanup_interval")?;
        ensure!(
            !cleanup.is_zero(),
            "ratelimit.cleanup_interval must be greater than zero"
        );
        ensure!(
            self.metrics.path.starts_with('/'),
            "metrics.path must start with '/'"
        );
        ensure!(
            !is_reserved_path(&self.metrics.path),
            "metrics.path {} collides with a built-in route",
            self.metrics.path
        );
        ensure!(!self.hosts.is_empty(), "at least one host must be configured");

        for (name, host) in &self.hosts {
            ensure!(!name.is_empty(), "host name must not be empty");
            ensure!(
                !host.allowed_redirect_urls.is_empty(),
                "hosts.{name}.allowed_redirect_urls must list at least one pattern"
            );
            ensure!(
                !host.providers.is_empty(),
                "hosts.{name}.providers must configure at least one provider"
            );
            for (provider, credentials) in &host.providers {
                ensure!(
                    !credentials.client_id.is_empty(),
                    "hosts.{name}.providers.{provider}.client_id is required"
                );
            }
            ensure!(!host.jwt.kid.is_empty(), "hosts.{name}.jwt.kid is required");
            ensure!(
                !host.jwt.audience.is_empty(),
                "hosts.{name}.jwt.audience is required"
            );
            ensure!(
                !host.jwt.private_key_file.as_os_str().is_empty(),
                "hosts.{name}.jwt.private_key_file is required"
            );
        }

        Ok(())
    }

    /// Rate limiter settings with the cleanup interval parsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup interval is not a valid duration.
    pub fn rate_limit(&self) -> Result<RateLimitConfig> {
        Ok(RateLimitConfig {
            requests_per_minute: self.ratelimit.requests_per_minute,
            cleanup_interval: parse_duration(&self.ratelimit.cleanup_interval)
                .context("ratelimit.cleanup_interval")?,
            forwarded_for_index: self.ratelimit.x_forwarded_for_index,
        })
    }
}
