use anyhow::Result;
use porta::{
    oauth::{
        facebook::{FacebookEndpoints, FacebookProvider},
        google::{GoogleEndpoints, GoogleProvider},
        Provider, ProviderCredentials, ProviderError, TokenBundle,
    },
    porta::token::TenantSigner,
};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use wiremock::{
    matchers::{body_string_contains, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const SIGNING_PEM: &str = include_str!("fixtures/tenant_a.pem");
const CLIENT_ID: &str = "g-client";
const CALLBACK: &str = "https://a.example.com/oauth/callback/google";

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

fn google(server: &MockServer) -> Result<GoogleProvider> {
    let endpoints = GoogleEndpoints {
        auth_url: format!("{}/auth", server.uri()),
        token_url: format!("{}/token", server.uri()),
        userinfo_url: format!("{}/userinfo", server.uri()),
        jwks_url: format!("{}/certs", server.uri()),
        issuers: vec![server.uri()],
    };
    Ok(GoogleProvider::with_endpoints(
        &ProviderCredentials::new(CLIENT_ID, "g-secret"),
        &endpoints,
    )?)
}

fn facebook(server: &MockServer) -> Result<FacebookProvider> {
    let endpoints = FacebookEndpoints {
        auth_url: format!("{}/dialog/oauth", server.uri()),
        token_url: format!("{}/oauth/access_token", server.uri()),
        me_url: format!("{}/me", server.uri()),
    };
    Ok(FacebookProvider::with_endpoints(
        &ProviderCredentials::new("fb-client", "fb-secret"),
        &endpoints,
    )?)
}

/// Sign `claims` as Google would and publish the key at `/certs`.
async fn id_token(server: &MockServer, claims: &Value) -> Result<String> {
    let signer = TenantSigner::from_pem_or_der(SIGNING_PEM.as_bytes(), "google-1")?;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(signer.jwks()))
        .mount(server)
        .await;
    Ok(signer.sign(claims)?)
}

fn claims(server: &MockServer) -> Value {
    json!({
        "iss": server.uri(),
        "aud": CLIENT_ID,
        "sub": "10769150350006150715113082367",
        "email": "u@x.com",
        "email_verified": true,
        "name": "User",
        "iat": now(),
        "exp": now() + 3600,
    })
}

fn bundle(id_token: String) -> TokenBundle {
    TokenBundle {
        access_token: "google-access".to_string(),
        id_token: Some(id_token),
        ..TokenBundle::default()
    }
}

#[tokio::test]
async fn google_exchanges_code_and_verifies_id_token() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;
    let token = id_token(&server, &claims(&server)).await?;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=the-code"))
        .and(body_string_contains("client_secret=g-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "google-access",
            "token_type": "Bearer",
            "expires_in": 3599,
            "id_token": token,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = provider.exchange_code("the-code", CALLBACK).await?;
    assert_eq!(tokens.access_token, "google-access");
    assert_eq!(tokens.expires_in, Some(3599));

    let identity = provider.resolve_identity(&tokens).await?;
    assert_eq!(identity.email, "u@x.com");
    assert_eq!(identity.name, "User");
    assert_eq!(identity.subject, "10769150350006150715113082367");
    Ok(())
}

#[tokio::test]
async fn google_caches_signing_keys() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;
    let signer = TenantSigner::from_pem_or_der(SIGNING_PEM.as_bytes(), "google-1")?;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(signer.jwks()))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = bundle(signer.sign(&claims(&server))?);
    provider.resolve_identity(&tokens).await?;
    provider.resolve_identity(&tokens).await?;
    Ok(())
}

#[tokio::test]
async fn google_falls_back_to_userinfo_for_missing_name() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;
    let mut claims = claims(&server);
    claims["name"] = Value::String(String::new());
    let token = id_token(&server, &claims).await?;

    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer google-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": "other@x.com",
            "name": "From Userinfo",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity = provider.resolve_identity(&bundle(token)).await?;
    assert_eq!(identity.email, "u@x.com");
    assert_eq!(identity.name, "From Userinfo");
    Ok(())
}

#[tokio::test]
async fn google_rejects_unverified_email() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;
    let mut claims = claims(&server);
    claims["email_verified"] = Value::Bool(false);
    let token = id_token(&server, &claims).await?;

    let result = provider.resolve_identity(&bundle(token)).await;
    assert!(matches!(result, Err(ProviderError::EmailNotVerified)));
    Ok(())
}

#[tokio::test]
async fn google_rejects_foreign_audience_and_expired_tokens() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;

    let mut foreign = claims(&server);
    foreign["aud"] = Value::String("someone-else".to_string());
    let token = id_token(&server, &foreign).await?;
    let result = provider.resolve_identity(&bundle(token)).await;
    assert!(matches!(result, Err(ProviderError::Claims("audience"))));

    let mut expired = claims(&server);
    expired["exp"] = json!(now() - 60);
    let token = id_token(&server, &expired).await?;
    let result = provider.resolve_identity(&bundle(token)).await;
    assert!(matches!(result, Err(ProviderError::Claims("expired"))));

    let mut issuer = claims(&server);
    issuer["iss"] = Value::String("https://evil.example.com".to_string());
    let token = id_token(&server, &issuer).await?;
    let result = provider.resolve_identity(&bundle(token)).await;
    assert!(matches!(result, Err(ProviderError::Claims("issuer"))));
    Ok(())
}

#[tokio::test]
async fn token_endpoint_errors_surface_status() -> Result<()> {
    let server = MockServer::start().await;
    let provider = google(&server)?;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
        })))
        .mount(&server)
        .await;

    let result = provider.exchange_code("stale-code", CALLBACK).await;
    assert!(matches!(
        result,
        Err(ProviderError::Status { status: 400, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn facebook_resolves_identity_from_graph() -> Result<()> {
    let server = MockServer::start().await;
    let provider = facebook(&server)?;

    Mock::given(method("POST"))
        .and(path("/oauth/access_token"))
        .and(body_string_contains("client_id=fb-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fb-access",
            "token_type": "bearer",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(query_param("fields", "id,name,email"))
        .and(header("authorization", "Bearer fb-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "4242",
            "name": "Face Book",
            "email": "fb@x.com",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = provider
        .exchange_code("fb-code", "https://a.example.com/oauth/callback/facebook")
        .await?;
    let identity = provider.resolve_identity(&tokens).await?;
    assert_eq!(identity.email, "fb@x.com");
    assert_eq!(identity.name, "Face Book");
    assert_eq!(identity.subject, "4242");
    Ok(())
}

#[tokio::test]
async fn facebook_without_email_is_rejected() -> Result<()> {
    let server = MockServer::start().await;
    let provider = facebook(&server)?;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "4242",
            "name": "No Mail",
        })))
        .mount(&server)
        .await;

    let tokens = TokenBundle {
        access_token: "fb-access".to_string(),
        ..TokenBundle::default()
    };
    let result = provider.resolve_identity(&tokens).await;
    assert!(matches!(result, Err(ProviderError::MissingEmail)));
    Ok(())
}
