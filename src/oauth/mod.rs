//! Identity provider capability and the built-in integrations.
//!
//! The login flow only ever talks to `dyn Provider`: it asks for an
//! authorization URL, exchanges the returned code for tokens and resolves the
//! user behind them. Concrete providers are created once at startup through a
//! [`ProviderRegistry`], keyed by the name used in the configuration file.

pub mod facebook;
pub mod google;

use crate::porta::token::TokenError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

/// Per-request timeout applied to every outbound provider call.
pub const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider type: {0}")]
    UnknownType(String),
    #[error("invalid provider configuration: {0}")]
    Config(String),
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("id_token not found in token response")]
    MissingIdToken,
    #[error("failed to verify id_token")]
    IdToken(#[from] TokenError),
    #[error("invalid id_token claims: {0}")]
    Claims(&'static str),
    #[error("email not verified")]
    EmailNotVerified,
    #[error("user email not available")]
    MissingEmail,
    #[error("user id not available")]
    MissingSubject,
}

/// Client credentials of one provider for one tenant.
#[derive(Clone, Deserialize)]
pub struct ProviderCredentials {
    pub client_id: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,
}

impl ProviderCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
        }
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

pub(crate) fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Token endpoint response, trimmed to the fields the gateway uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// The authenticated user as reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub name: String,
    pub subject: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used in routes, metrics and the configuration file.
    fn name(&self) -> &str;

    /// URL the browser is sent to, carrying `state` and `callback_url`.
    fn authorization_url(&self, state: &str, callback_url: &str) -> Url;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        callback_url: &str,
    ) -> Result<TokenBundle, ProviderError>;

    /// Resolve the user behind `tokens`.
    async fn resolve_identity(&self, tokens: &TokenBundle) -> Result<Identity, ProviderError>;
}

pub type ProviderFactory =
    Box<dyn Fn(&ProviderCredentials) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Name-keyed provider constructors, filled once during startup.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `google` and `facebook` integrations.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(google::NAME, |credentials| {
            Ok(Arc::new(google::GoogleProvider::new(credentials)?) as Arc<dyn Provider>)
        });
        registry.register(facebook::NAME, |credentials| {
            Ok(Arc::new(facebook::FacebookProvider::new(credentials)?) as Arc<dyn Provider>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderCredentials) -> Result<Arc<dyn Provider>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        debug!(provider = %name, "registered provider");
        self.factories.insert(name, Box::new(factory));
    }

    /// Build a provider instance of type `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownType`] when nothing is registered under
    /// `name`, or the factory's own error.
    pub fn create(
        &self,
        name: &str,
        credentials: &ProviderCredentials,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let Some(factory) = self.factories.get(name) else {
            error!(provider = name, "unknown provider type");
            return Err(ProviderError::UnknownType(name.to_string()));
        };

        let provider = factory(credentials)?;
        debug!(provider = name, "created provider instance");
        Ok(provider)
    }
}

pub(crate) fn http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(PROVIDER_HTTP_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn parse_endpoint(value: &str) -> Result<Url, ProviderError> {
    Url::parse(value).map_err(|e| ProviderError::Config(format!("invalid endpoint {value}: {e}")))
}

/// Append the standard authorization-code query parameters to `endpoint`.
pub(crate) fn authorization_url(
    endpoint: &Url,
    client_id: &str,
    callback_url: &str,
    scopes: &str,
    state: &str,
    extra: &[(&str, &str)],
) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("response_type", "code")
            .append_pair("scope", scopes)
            .append_pair("state", state);
        for (key, value) in extra {
            query.append_pair(key, value);
        }
    }
    url
}

/// Authorization-code grant against `token_url` (form POST, client secret in the body).
pub(crate) async fn exchange_authorization_code(
    client: &Client,
    token_url: &Url,
    credentials: &ProviderCredentials,
    code: &str,
    callback_url: &str,
) -> Result<TokenBundle, ProviderError> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", callback_url),
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.expose_secret()),
    ];

    fetch_json(client.post(token_url.clone()).form(&form), token_url).await
}

pub(crate) async fn fetch_json<T: DeserializeOwned>(
    request: RequestBuilder,
    url: &Url,
) -> Result<T, ProviderError> {
    let endpoint = endpoint_label(url);
    let response = request.send().await.map_err(|source| ProviderError::Http {
        url: endpoint.clone(),
        source,
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::Status {
            url: endpoint,
            status: status.as_u16(),
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|source| ProviderError::Http {
            url: endpoint,
            source,
        })
}

// Query strings may carry tokens, keep them out of errors and logs.
fn endpoint_label(url: &Url) -> String {
    let mut label = url.clone();
    label.set_query(None);
    label.to_string()
}
