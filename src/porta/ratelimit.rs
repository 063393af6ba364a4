//! Rate limiting primitives for the login flow entry points.
//!
//! Every `(client ip, host, path)` triple owns an independent token bucket
//! holding up to `requests_per_minute` tokens, refilled continuously at the
//! same rate per minute. Buckets are created lazily and evicted by a
//! background sweep once they have refilled completely.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::HOST, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const REFILL_WINDOW: Duration = Duration::from_secs(60);

// Float refills can land a hair under capacity.
const FULL_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, client_ip: &str, host: &str, path: &str) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _client_ip: &str, _host: &str, _path: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub cleanup_interval: Duration,
    pub forwarded_for_index: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            forwarded_for_index: 0,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / REFILL_WINDOW.as_secs_f64(),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed
            .mul_add(self.refill_per_sec, self.tokens)
            .min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.capacity - self.tokens < FULL_EPSILON
    }
}

fn lock(bucket: &Mutex<TokenBucket>) -> MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed token-bucket limiter.
///
/// The map only guards bucket creation and eviction; each bucket carries its
/// own lock so admissions for different keys never contend.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    capacity: u32,
    cleanup_interval: Duration,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: config.requests_per_minute.max(1),
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// Try to consume one token for the triple. Never blocks or queues.
    #[must_use]
    pub fn admit(&self, client_ip: &str, host: &str, path: &str) -> bool {
        self.admit_at(&bucket_key(client_ip, host, path), Instant::now())
    }

    fn admit_at(&self, key: &str, now: Instant) -> bool {
        let bucket = if let Some(existing) = self.buckets.get(key) {
            Arc::clone(existing.value())
        } else {
            let entry = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(self.capacity, now))));
            Arc::clone(entry.value())
        };

        let allowed = lock(&bucket).try_take(now);
        allowed
    }

    /// Evict every bucket that has refilled to capacity. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !lock(bucket).is_full(now));
        let removed = before.saturating_sub(self.buckets.len());

        debug!(total_before = before, removed, "cleaning up rate limiters");

        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Run [`Self::sweep`] every cleanup interval until `token` is cancelled.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> Sweeper {
        let limiter = Arc::clone(self);
        let period = self.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("rate limiter cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
        });

        Sweeper { handle }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, client_ip: &str, host: &str, path: &str) -> RateLimitDecision {
        if self.admit(client_ip, host, path) {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }
}

fn bucket_key(client_ip: &str, host: &str, path: &str) -> String {
    format!("{client_ip}|{host}|{path}")
}

/// Handle on the background sweep task.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Wait until the sweep loop has exited.
    pub async fn wait(self) {
        if let Err(err) = self.handle.await {
            debug!("rate limiter sweep task ended abnormally: {err}");
        }
    }
}

/// Resolves the client address a request should be accounted against.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientIpResolver {
    forwarded_for_index: i64,
}

impl ClientIpResolver {
    #[must_use]
    pub const fn new(forwarded_for_index: i64) -> Self {
        Self {
            forwarded_for_index,
        }
    }

    /// First match wins: `CF-Connecting-IP`, `X-Real-IP`, `X-Forwarded-For`
    /// at the configured index, then the transport peer.
    #[must_use]
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if let Some(ip) = header_value(headers, "cf-connecting-ip") {
            return ip.to_string();
        }

        if let Some(ip) = header_value(headers, "x-real-ip") {
            return ip.to_string();
        }

        if let Some(chain) = header_value(headers, "x-forwarded-for") {
            let hops: Vec<&str> = chain.split(',').map(str::trim).collect();
            if let Some(hop) = self.pick(&hops) {
                return hop.to_string();
            }
        }

        peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
    }

    fn pick<'a>(&self, hops: &[&'a str]) -> Option<&'a str> {
        let len = i64::try_from(hops.len()).ok()?;
        let index = if self.forwarded_for_index < 0 {
            len + self.forwarded_for_index
        } else {
            self.forwarded_for_index
        };

        usize::try_from(index)
            .ok()
            .and_then(|i| hops.get(i))
            .or_else(|| hops.first())
            .copied()
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// State shared by the rate-limit middleware.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<dyn RateLimiter>,
    resolver: ClientIpResolver,
}

impl RateLimitGuard {
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>, resolver: ClientIpResolver) -> Self {
        Self { limiter, resolver }
    }
}

/// axum middleware answering `429` when the caller's bucket is empty.
pub async fn enforce(State(guard): State<RateLimitGuard>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = guard.resolver.resolve(request.headers(), peer);
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let path = request.uri().path();

    if guard.limiter.check(&client_ip, host, path) == RateLimitDecision::Limited {
        debug!(ip = %client_ip, path, "request rate-limited");
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    next.run(request).await
}
