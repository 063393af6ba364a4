//! Google sign-in over OpenID Connect.
//!
//! Identity comes from the `id_token` returned by the token endpoint, which is
//! verified against Google's published signing keys before any claim is
//! trusted. The key set is cached and refetched when a token names a `kid`
//! we have not seen yet (Google rotates keys regularly).

use super::{
    authorization_url, exchange_authorization_code, fetch_json, http_client, parse_endpoint,
    Identity, Provider, ProviderCredentials, ProviderError, TokenBundle,
};
use crate::porta::token::{CompactJws, Jwks};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, error};
use url::Url;

pub const NAME: &str = "google";

const SCOPES: &str = "email profile";

/// Google endpoints and accepted issuers; overridable for tests.
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub jwks_url: String,
    pub issuers: Vec<String>,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v3/userinfo".to_string(),
            jwks_url: "https://www.googleapis.com/oauth2/v3/certs".to_string(),
            issuers: vec![
                "https://accounts.google.com".to_string(),
                "accounts.google.com".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    iss: String,
    aud: String,
    exp: i64,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug)]
pub struct GoogleProvider {
    credentials: ProviderCredentials,
    client: Client,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
    jwks_url: Url,
    issuers: Vec<String>,
    keys: RwLock<Option<Jwks>>,
}

impl GoogleProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(credentials: &ProviderCredentials) -> Result<Self, ProviderError> {
        Self::with_endpoints(credentials, &GoogleEndpoints::default())
    }

    /// # Errors
    /// Returns an error if an endpoint is not a valid URL or the HTTP client cannot be built.
    pub fn with_endpoints(
        credentials: &ProviderCredentials,
        endpoints: &GoogleEndpoints,
    ) -> Result<Self, ProviderError> {
        if credentials.client_id.is_empty() {
            return Err(ProviderError::Config("client_id is empty".to_string()));
        }

        Ok(Self {
            credentials: credentials.clone(),
            client: http_client()?,
            auth_url: parse_endpoint(&endpoints.auth_url)?,
            token_url: parse_endpoint(&endpoints.token_url)?,
            userinfo_url: parse_endpoint(&endpoints.userinfo_url)?,
            jwks_url: parse_endpoint(&endpoints.jwks_url)?,
            issuers: endpoints.issuers.clone(),
            keys: RwLock::new(None),
        })
    }

    async fn signing_keys(&self, kid: &str) -> Result<Jwks, ProviderError> {
        if let Some(jwks) = self.keys.read().await.as_ref() {
            if jwks.key(kid).is_some() {
                return Ok(jwks.clone());
            }
        }

        debug!(provider = NAME, kid, "fetching signing keys");
        let jwks: Jwks = fetch_json(self.client.get(self.jwks_url.clone()), &self.jwks_url).await?;
        *self.keys.write().await = Some(jwks.clone());
        Ok(jwks)
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<IdTokenClaims, ProviderError> {
        let jws = CompactJws::parse(id_token)?;
        let jwks = self.signing_keys(jws.key_id()).await?;
        jws.verify(&jwks)?;
        let claims: IdTokenClaims = jws.claims()?;

        if !self.issuers.iter().any(|issuer| issuer == &claims.iss) {
            return Err(ProviderError::Claims("issuer"));
        }
        if claims.aud != self.credentials.client_id {
            return Err(ProviderError::Claims("audience"));
        }
        if claims.exp <= unix_now() {
            return Err(ProviderError::Claims("expired"));
        }

        Ok(claims)
    }

    async fn fetch_user_info(&self, access_token: &str) -> Result<UserInfo, ProviderError> {
        debug!(provider = NAME, "fetching user info");
        fetch_json(
            self.client
                .get(self.userinfo_url.clone())
                .bearer_auth(access_token),
            &self.userinfo_url,
        )
        .await
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn authorization_url(&self, state: &str, callback_url: &str) -> Url {
        debug!(provider = NAME, redirect_uri = callback_url, "generating authorization url");
        authorization_url(
            &self.auth_url,
            &self.credentials.client_id,
            callback_url,
            SCOPES,
            state,
            &[("access_type", "offline"), ("prompt", "consent")],
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        callback_url: &str,
    ) -> Result<TokenBundle, ProviderError> {
        debug!(provider = NAME, "exchanging authorization code for token");
        exchange_authorization_code(
            &self.client,
            &self.token_url,
            &self.credentials,
            code,
            callback_url,
        )
        .await
        .inspect_err(|e| error!(provider = NAME, "failed to exchange auth code: {e}"))
    }

    async fn resolve_identity(&self, tokens: &TokenBundle) -> Result<Identity, ProviderError> {
        let Some(id_token) = tokens.id_token.as_deref().filter(|t| !t.is_empty()) else {
            error!(provider = NAME, "id_token not found in token response");
            return Err(ProviderError::MissingIdToken);
        };

        let claims = self
            .verify_id_token(id_token)
            .await
            .inspect_err(|e| error!(provider = NAME, "failed to verify id token: {e}"))?;

        if !claims.email_verified {
            debug!(provider = NAME, "user email is not verified");
            return Err(ProviderError::EmailNotVerified);
        }

        let mut identity = Identity {
            email: claims.email,
            name: claims.name,
            subject: claims.sub,
        };

        if (identity.email.is_empty() || identity.name.is_empty())
            && !tokens.access_token.is_empty()
        {
            let info = self
                .fetch_user_info(&tokens.access_token)
                .await
                .inspect_err(|e| error!(provider = NAME, "failed to fetch user info: {e}"))?;
            if identity.email.is_empty() {
                identity.email = info.email;
            }
            if identity.name.is_empty() {
                identity.name = info.name;
            }
        }

        Ok(identity)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
