//! Facebook Login: authorization-code flow plus the Graph `me` endpoint.

use super::{
    authorization_url, exchange_authorization_code, fetch_json, http_client, parse_endpoint,
    Identity, Provider, ProviderCredentials, ProviderError, TokenBundle,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

pub const NAME: &str = "facebook";

const SCOPES: &str = "email public_profile";

/// Facebook endpoints; overridable for tests.
#[derive(Debug, Clone)]
pub struct FacebookEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub me_url: String,
}

impl Default for FacebookEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://www.facebook.com/v3.2/dialog/oauth".to_string(),
            token_url: "https://graph.facebook.com/v3.2/oauth/access_token".to_string(),
            me_url: "https://graph.facebook.com/me".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
}

#[derive(Debug)]
pub struct FacebookProvider {
    credentials: ProviderCredentials,
    client: Client,
    auth_url: Url,
    token_url: Url,
    me_url: Url,
}

impl FacebookProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(credentials: &ProviderCredentials) -> Result<Self, ProviderError> {
        Self::with_endpoints(credentials, &FacebookEndpoints::default())
    }

    /// # Errors
    /// Returns an error if an endpoint is not a valid URL or the HTTP client cannot be built.
    pub fn with_endpoints(
        credentials: &ProviderCredentials,
        endpoints: &FacebookEndpoints,
    ) -> Result<Self, ProviderError> {
        if credentials.client_id.is_empty() {
            return Err(ProviderError::Config("client_id is empty".to_string()));
        }

        Ok(Self {
            credentials: credentials.clone(),
            client: http_client()?,
            auth_url: parse_endpoint(&endpoints.auth_url)?,
            token_url: parse_endpoint(&endpoints.token_url)?,
            me_url: parse_endpoint(&endpoints.me_url)?,
        })
    }
}

#[async_trait]
impl Provider for FacebookProvider {
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
            &[("access_type", "offline")],
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
        let mut url = self.me_url.clone();
        url.query_pairs_mut().append_pair("fields", "id,name,email");

        let user: GraphUser = fetch_json(
            self.client.get(url.clone()).bearer_auth(&tokens.access_token),
            &url,
        )
        .await
        .inspect_err(|e| error!(provider = NAME, "failed to fetch user info: {e}"))?;

        if user.email.is_empty() {
            error!(provider = NAME, user_id = %user.id, "facebook user missing email");
            return Err(ProviderError::MissingEmail);
        }
        if user.id.is_empty() {
            error!(provider = NAME, "facebook user missing id");
            return Err(ProviderError::MissingSubject);
        }

        debug!(provider = NAME, user_id = %user.id, "retrieved user info");
        Ok(Identity {
            email: user.email,
            name: user.name,
            subject: user.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn authorization_url_requests_email_scope() -> Result<(), ProviderError> {
        let provider = FacebookProvider::new(&ProviderCredentials::new("fb-client", "secret"))?;
        let url = provider.authorization_url("csrf", "https://a.example.com/oauth/callback/facebook");

        assert_eq!(url.host_str(), Some("www.facebook.com"));
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "fb-client");
        assert_eq!(pairs["scope"], "email public_profile");
        assert_eq!(pairs["state"], "csrf");
        assert_eq!(
            pairs["redirect_uri"],
            "https://a.example.com/oauth/callback/facebook"
        );
        Ok(())
    }

    #[test]
    fn rejects_empty_client_id() {
        assert!(matches!(
            FacebookProvider::new(&ProviderCredentials::new("", "secret")),
            Err(ProviderError::Config(_))
        ));
    }
}
