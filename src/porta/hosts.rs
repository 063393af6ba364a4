//! Tenants keyed by hostname.
//!
//! Built once at startup from the `hosts` section of the configuration and
//! only read afterwards, so lookups need no locking. Any tenant that cannot be
//! fully constructed (unreadable key, no usable provider, bad expiry) aborts
//! startup.

use crate::config::{parse_duration, HostConfig};
use crate::oauth::{Identity, Provider, ProviderRegistry};
use crate::porta::token::{IdentityClaims, Jwks, TenantSigner, TokenError};
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no hosts configured")]
    NoHosts,
    #[error("host {host}: failed to read signing key {}", .path.display())]
    KeyRead {
        host: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("host {host}: invalid signing key")]
    Key {
        host: String,
        #[source]
        source: TokenError,
    },
    #[error("host {host}: no provider could be initialized")]
    NoProviders { host: String },
    #[error("host {host}: invalid jwt expiry {value:?}")]
    InvalidExpiry { host: String, value: String },
    #[error("host {host}: at least one allowed redirect pattern is required")]
    NoRedirects { host: String },
    #[error("host {host}: invalid redirect pattern {pattern:?}")]
    RedirectPattern {
        host: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Glob patterns a post-login redirect must fully match.
///
/// Up to the end of the authority `*` stops at any of `/?#@\`; in the path
/// it matches any run of characters.
#[derive(Debug, Clone)]
pub struct RedirectAllowList {
    patterns: Vec<Regex>,
}

impl RedirectAllowList {
    /// # Errors
    ///
    /// Returns the pattern that failed to compile along with the regex error.
    pub fn new<I, S>(patterns: I) -> Result<Self, (String, regex::Error)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                glob_to_regex(pattern).map_err(|e| (pattern.to_string(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn allows(&self, candidate: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(candidate))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

const AUTHORITY_WILDCARD: &str = r"[^/?#@\\]*";
const PATH_WILDCARD: &str = ".*";

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let authority_end = pattern.find("://").map_or(0, |scheme_end| {
        let start = scheme_end + 3;
        pattern[start..]
            .find('/')
            .map_or(pattern.len(), |slash| start + slash)
    });
    let (authority, path) = pattern.split_at(authority_end);

    Regex::new(&format!(
        "^{}{}$",
        translate_glob(authority, AUTHORITY_WILDCARD),
        translate_glob(path, PATH_WILDCARD)
    ))
}

fn translate_glob(glob: &str, wildcard: &str) -> String {
    glob.split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(wildcard)
}

/// Everything the gateway knows about one hostname.
pub struct TenantConfig {
    host: String,
    redirects: RedirectAllowList,
    login_dir: PathBuf,
    providers: BTreeMap<String, Arc<dyn Provider>>,
    signer: TenantSigner,
    audience: String,
    token_expiry: Duration,
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("host", &self.host)
            .field("login_dir", &self.login_dir)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("signer", &self.signer)
            .field("audience", &self.audience)
            .field("token_expiry", &self.token_expiry)
            .finish_non_exhaustive()
    }
}

/// Inputs for a [`TenantConfig`] whose key and providers are already loaded.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub allowed_redirect_urls: Vec<String>,
    pub login_dir: PathBuf,
    pub audience: String,
    pub token_expiry: Duration,
}

impl TenantConfig {
    /// # Errors
    ///
    /// Returns an error if no redirect pattern or provider is given, or a
    /// redirect pattern does not compile.
    pub fn new(
        host: impl Into<String>,
        settings: TenantSettings,
        signer: TenantSigner,
        providers: BTreeMap<String, Arc<dyn Provider>>,
    ) -> Result<Self, HostError> {
        let host = host.into();

        let redirects = RedirectAllowList::new(&settings.allowed_redirect_urls).map_err(
            |(pattern, source)| HostError::RedirectPattern {
                host: host.clone(),
                pattern,
                source,
            },
        )?;
        if redirects.is_empty() {
            return Err(HostError::NoRedirects { host });
        }
        if providers.is_empty() {
            return Err(HostError::NoProviders { host });
        }

        Ok(Self {
            host,
            redirects,
            login_dir: settings.login_dir,
            providers,
            signer,
            audience: settings.audience,
            token_expiry: settings.token_expiry,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn login_dir(&self) -> &Path {
        &self.login_dir
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub const fn token_expiry(&self) -> Duration {
        self.token_expiry
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    #[must_use]
    pub fn allows_redirect(&self, redirect: &str) -> bool {
        self.redirects.allows(redirect)
    }

    /// The tenant's public key set.
    #[must_use]
    pub const fn jwks(&self) -> &Jwks {
        self.signer.jwks()
    }

    /// Mint a token for `identity`, issued by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be encoded or signed.
    pub fn issue_token(&self, issuer: &str, identity: &Identity) -> Result<String, TokenError> {
        self.signer.sign(&self.claims_for(issuer, identity, unix_now()))
    }

    fn claims_for(&self, issuer: &str, identity: &Identity, now: i64) -> IdentityClaims {
        let expiry = i64::try_from(self.token_expiry.as_secs()).unwrap_or(i64::MAX);
        IdentityClaims {
            iss: issuer.to_string(),
            aud: self.audience.clone(),
            sub: identity.email.clone(),
            email: identity.email.clone(),
            name: Some(identity.name.clone()).filter(|name| !name.is_empty()),
            iat: now,
            exp: now.saturating_add(expiry),
        }
    }
}

/// Read-only hostname to tenant mapping.
#[derive(Debug, Default)]
pub struct HostRegistry {
    tenants: HashMap<String, Arc<TenantConfig>>,
}

impl HostRegistry {
    /// Build every configured tenant: load its signing key, parse its token
    /// expiry and create its providers through `providers`.
    ///
    /// A provider that fails to initialize is logged and skipped; a tenant
    /// left without providers is an error.
    ///
    /// # Errors
    ///
    /// Returns the first [`HostError`] encountered.
    pub fn build(
        hosts: &BTreeMap<String, HostConfig>,
        providers: &ProviderRegistry,
    ) -> Result<Self, HostError> {
        if hosts.is_empty() {
            return Err(HostError::NoHosts);
        }

        let mut tenants = Vec::with_capacity(hosts.len());
        for (host, config) in hosts {
            tenants.push(build_tenant(host, config, providers)?);
        }
        Ok(Self::from_tenants(tenants))
    }

    pub fn from_tenants(tenants: impl IntoIterator<Item = TenantConfig>) -> Self {
        let tenants = tenants
            .into_iter()
            .map(|tenant| (tenant.host.to_ascii_lowercase(), Arc::new(tenant)))
            .collect();
        Self { tenants }
    }

    /// Look up the tenant for a `Host` header value. Matching is
    /// case-insensitive; a port suffix is part of the host.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<Arc<TenantConfig>> {
        self.tenants.get(&host.to_ascii_lowercase()).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

fn build_tenant(
    host: &str,
    config: &HostConfig,
    registry: &ProviderRegistry,
) -> Result<TenantConfig, HostError> {
    let key = std::fs::read(&config.jwt.private_key_file).map_err(|source| HostError::KeyRead {
        host: host.to_string(),
        path: config.jwt.private_key_file.clone(),
        source,
    })?;
    let signer =
        TenantSigner::from_pem_or_der(&key, config.jwt.kid.clone()).map_err(|source| {
            HostError::Key {
                host: host.to_string(),
                source,
            }
        })?;

    let token_expiry = parse_duration(&config.jwt.expiry)
        .ok()
        .filter(|expiry| !expiry.is_zero())
        .ok_or_else(|| HostError::InvalidExpiry {
            host: host.to_string(),
            value: config.jwt.expiry.clone(),
        })?;

    let mut providers = BTreeMap::new();
    for (name, credentials) in &config.providers {
        match registry.create(name, credentials) {
            Ok(provider) => {
                providers.insert(name.clone(), provider);
            }
            Err(e) => error!(host, provider = %name, "failed to initialize provider: {e}"),
        }
    }

    let tenant = TenantConfig::new(
        host,
        TenantSettings {
            allowed_redirect_urls: config.allowed_redirect_urls.clone(),
            login_dir: config.login_dir.clone(),
            audience: config.jwt.audience.clone(),
            token_expiry,
        },
        signer,
        providers,
    )?;

    info!(
        host,
        kid = %config.jwt.kid,
        providers = ?tenant.providers.keys().collect::<Vec<_>>(),
        "tenant configured"
    );
    Ok(tenant)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::oauth::{ProviderCredentials, ProviderError, TokenBundle};
    use crate::porta::token::verify_rs256;
    use async_trait::async_trait;
    use url::Url;

    const TENANT_A_PEM: &str = include_str!("../../tests/fixtures/tenant_a.pem");

    struct Fake;

    #[async_trait]
    impl Provider for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        fn authorization_url(&self, _: &str, _: &str) -> Url {
            Url::parse("https://idp.test/auth").unwrap()
        }

        async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenBundle, ProviderError> {
            Ok(TokenBundle::default())
        }

        async fn resolve_identity(&self, _: &TokenBundle) -> Result<Identity, ProviderError> {
            Ok(Identity::default())
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("fake", |_| Ok(Arc::new(Fake) as Arc<dyn Provider>));
        registry.register("broken", |_| {
            Err(ProviderError::Config("unreachable discovery".to_string()))
        });
        registry
    }

    fn host_config(key_file: PathBuf, providers: &[&str], expiry: &str) -> HostConfig {
        HostConfig {
            login_dir: PathBuf::from("./login"),
            allowed_redirect_urls: vec!["https://app.example.com/*".to_string()],
            providers: providers
                .iter()
                .map(|name| ((*name).to_string(), ProviderCredentials::new("id", "secret")))
                .collect(),
            jwt: JwtConfig {
                private_key_file: key_file,
                kid: "a-1".to_string(),
                audience: "https://app.example.com".to_string(),
                expiry: expiry.to_string(),
            },
        }
    }

    fn key_file() -> Result<tempfile::NamedTempFile, std::io::Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, TENANT_A_PEM.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn redirect_glob_matching() -> Result<(), Box<dyn std::error::Error>> {
        let list = RedirectAllowList::new(["https://app.example.com/*"]).map_err(|(_, e)| e)?;

        assert!(list.allows("https://app.example.com/dashboard"));
        assert!(list.allows("https://app.example.com/"));
        assert!(list.allows("https://app.example.com/a/b?c=d"));
        assert!(!list.allows("https://evil.example.com/"));
        assert!(!list.allows("http://app.example.com/"));
        assert!(!list.allows("https://app.example.com"));
        assert!(!list.allows("https://app.example.com.evil.net/"));
        Ok(())
    }

    #[test]
    fn redirect_glob_escapes_metacharacters() -> Result<(), Box<dyn std::error::Error>> {
        let list = RedirectAllowList::new(["https://app.example.com/cb?x=1", "https://*.example.org/*"])
            .map_err(|(_, e)| e)?;

        assert!(list.allows("https://app.example.com/cb?x=1"));
        // `.` and `?` are literal, not regex operators.
        assert!(!list.allows("https://appXexample.com/cb?x=1"));
        assert!(!list.allows("https://app.example.com/cx=1"));
        assert!(list.allows("https://tenant.example.org/home"));
        Ok(())
    }

    #[test]
    fn redirect_glob_host_wildcard_stays_in_host() -> Result<(), Box<dyn std::error::Error>> {
        let list = RedirectAllowList::new(["https://*.example.org/*"]).map_err(|(_, e)| e)?;

        assert!(list.allows("https://tenant.example.org/home"));
        assert!(list.allows("https://a.b.example.org/deep/path?x=/y"));
        assert!(!list.allows("https://evil.com/.example.org/phish"));
        assert!(!list.allows("https://evil.com?.example.org/phish"));
        assert!(!list.allows("https://evil.com#.example.org/phish"));
        assert!(!list.allows("https://user@evil.com\\.example.org/phish"));
        assert!(!list.allows("https://x.example.org@evil.com/phish"));
        Ok(())
    }

    #[test]
    fn builds_and_resolves_case_insensitively() -> Result<(), Box<dyn std::error::Error>> {
        let key = key_file()?;
        let hosts = BTreeMap::from([(
            "A.example.com".to_string(),
            host_config(key.path().to_path_buf(), &["fake"], "15m"),
        )]);
        let registry = HostRegistry::build(&hosts, &registry())?;

        assert_eq!(registry.len(), 1);
        let tenant = registry.resolve("a.EXAMPLE.com").ok_or("tenant not found")?;
        assert_eq!(tenant.audience(), "https://app.example.com");
        assert_eq!(tenant.token_expiry(), Duration::from_secs(900));
        assert!(tenant.provider("fake").is_some());
        assert!(tenant.provider("google").is_none());
        assert!(registry.resolve("b.example.com").is_none());
        assert!(registry.resolve("a.example.com:8080").is_none());
        Ok(())
    }

    #[test]
    fn failed_provider_is_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let key = key_file()?;
        let hosts = BTreeMap::from([(
            "a.example.com".to_string(),
            host_config(key.path().to_path_buf(), &["fake", "broken", "unknown"], "15m"),
        )]);
        let registry = HostRegistry::build(&hosts, &registry())?;
        let tenant = registry.resolve("a.example.com").ok_or("tenant not found")?;

        assert!(tenant.provider("fake").is_some());
        assert!(tenant.provider("broken").is_none());
        assert!(tenant.provider("unknown").is_none());
        Ok(())
    }

    #[test]
    fn fatal_construction_errors() -> Result<(), Box<dyn std::error::Error>> {
        let key = key_file()?;
        let path = key.path().to_path_buf();
        let build = |config: HostConfig| {
            HostRegistry::build(&BTreeMap::from([("a.example.com".to_string(), config)]), &registry())
        };

        assert!(matches!(
            HostRegistry::build(&BTreeMap::new(), &registry()),
            Err(HostError::NoHosts)
        ));
        assert!(matches!(
            build(host_config(path.clone(), &["broken"], "15m")),
            Err(HostError::NoProviders { .. })
        ));
        assert!(matches!(
            build(host_config(path.clone(), &["fake"], "soon")),
            Err(HostError::InvalidExpiry { .. })
        ));
        assert!(matches!(
            build(host_config(path.clone(), &["fake"], "0")),
            Err(HostError::InvalidExpiry { .. })
        ));
        assert!(matches!(
            build(host_config(PathBuf::from("/nonexistent/key.pem"), &["fake"], "15m")),
            Err(HostError::KeyRead { .. })
        ));

        let garbage = tempfile::NamedTempFile::new()?;
        std::fs::write(garbage.path(), b"not a key")?;
        assert!(matches!(
            build(host_config(garbage.path().to_path_buf(), &["fake"], "15m")),
            Err(HostError::Key { .. })
        ));

        let mut no_redirects = host_config(path, &["fake"], "15m");
        no_redirects.allowed_redirect_urls.clear();
        assert!(matches!(build(no_redirects), Err(HostError::NoRedirects { .. })));
        Ok(())
    }

    #[test]
    fn issued_claims_follow_tenant_settings() -> Result<(), Box<dyn std::error::Error>> {
        let signer = TenantSigner::from_pem_or_der(TENANT_A_PEM.as_bytes(), "a-1")?;
        let tenant = TenantConfig::new(
            "a.example.com",
            TenantSettings {
                allowed_redirect_urls: vec!["https://a.example.com/*".to_string()],
                login_dir: PathBuf::from("./login"),
                audience: "aud-a".to_string(),
                token_expiry: Duration::from_secs(900),
            },
            signer,
            BTreeMap::from([("fake".to_string(), Arc::new(Fake) as Arc<dyn Provider>)]),
        )?;
        let identity = Identity {
            email: "u@x.com".to_string(),
            name: String::new(),
            subject: "123".to_string(),
        };

        let claims = tenant.claims_for("https://a.example.com", &identity, 1_700_000_000);
        assert_eq!(claims.sub, "u@x.com");
        assert_eq!(claims.email, "u@x.com");
        assert_eq!(claims.aud, "aud-a");
        assert_eq!(claims.iss, "https://a.example.com");
        assert_eq!(claims.exp - claims.iat, 900);
        assert_eq!(claims.name, None);

        let token = tenant.issue_token("https://a.example.com", &identity)?;
        let verified: IdentityClaims = verify_rs256(&token, tenant.jwks())?;
        assert_eq!(verified.email, "u@x.com");
        Ok(())
    }
}
