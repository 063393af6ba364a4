use anyhow::Result;
use porta::{
    oauth::{Identity, Provider, ProviderError, TokenBundle},
    porta::{
        hosts::{HostRegistry, TenantConfig, TenantSettings},
        ratelimit::{ClientIpResolver, NoopRateLimiter, RateLimitGuard},
        router, serve,
        shutdown::{Shutdown, ShutdownPhases},
        state::StateCodec,
        token::TenantSigner,
        Gateway,
    },
};
use reqwest::StatusCode;
use secrecy::SecretString;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use url::Url;

const TENANT_A_PEM: &str = include_str!("fixtures/tenant_a.pem");

struct Unused;

#[async_trait::async_trait]
impl Provider for Unused {
    fn name(&self) -> &str {
        "unused"
    }

    #[allow(clippy::unwrap_used)]
    fn authorization_url(&self, _: &str, _: &str) -> Url {
        Url::parse("https://idp.test/auth").unwrap()
    }

    async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenBundle, ProviderError> {
        Err(ProviderError::MissingIdToken)
    }

    async fn resolve_identity(&self, _: &TokenBundle) -> Result<Identity, ProviderError> {
        Err(ProviderError::MissingEmail)
    }
}

fn gateway(shutdown: &Shutdown) -> Result<Gateway> {
    let mut providers: BTreeMap<String, Arc<dyn Provider>> = BTreeMap::new();
    providers.insert("unused".to_string(), Arc::new(Unused));
    let tenant = TenantConfig::new(
        "a.example.com",
        TenantSettings {
            allowed_redirect_urls: vec!["https://a.example.com/*".to_string()],
            login_dir: PathBuf::from("./login"),
            audience: "app".to_string(),
            token_expiry: Duration::from_secs(60),
        },
        TenantSigner::from_pem_or_der(TENANT_A_PEM.as_bytes(), "a-1")?,
        providers,
    )?;

    Ok(Gateway::new(
        HostRegistry::from_tenants([tenant]),
        StateCodec::new(&SecretString::from("secret")),
        "oauth_state",
        shutdown.clone(),
    ))
}

#[tokio::test]
async fn health_fails_during_drain_then_listener_closes() -> Result<()> {
    let shutdown = Shutdown::new();
    let app = router(
        Arc::new(gateway(&shutdown)?),
        RateLimitGuard::new(Arc::new(NoopRateLimiter), ClientIpResolver::new(0)),
        None,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let phases = ShutdownPhases {
        readiness_drain: Duration::from_millis(500),
        listener_timeout: Duration::from_secs(1),
        hard_grace: Duration::ZERO,
    };

    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { serve(listener, app, &shutdown, phases).await })
    };

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()?;
    let url = format!("http://{addr}/healthz");

    let response = client.get(&url).send().await?;
    assert_eq!(response.status(), StatusCode::OK);

    shutdown.trigger();
    let response = client.get(&url).send().await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(!shutdown.ongoing().is_cancelled());

    tokio::time::timeout(Duration::from_secs(5), server).await???;

    assert!(client.get(&url).send().await.is_err());
    Ok(())
}
