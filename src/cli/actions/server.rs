use crate::{
    cli::telemetry,
    config::Config,
    oauth::ProviderRegistry,
    porta::{
        self,
        hosts::HostRegistry,
        metrics::install_exporter,
        ratelimit::{ClientIpResolver, RateLimitGuard, TokenBucketLimiter},
        shutdown::{Shutdown, ShutdownPhases},
        state::StateCodec,
        Gateway,
    },
};
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub config_path: PathBuf,
    pub port: u16,
    pub config: Config,
}

/// Execute the server action.
/// # Errors
/// Returns an error if a tenant cannot be built, the listener cannot bind or
/// the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);
    let Args { port, config, .. } = args;

    let hosts = HostRegistry::build(&config.hosts, &ProviderRegistry::with_defaults())
        .context("failed to build hosts")?;
    info!("Loaded {} host(s)", hosts.len());

    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals();

    let limiter = Arc::new(TokenBucketLimiter::new(&config.rate_limit()?));
    let sweeper = limiter.spawn_sweeper(shutdown.ongoing().clone());
    let guard = RateLimitGuard::new(
        limiter,
        ClientIpResolver::new(config.ratelimit.x_forwarded_for_index),
    );

    let mut gateway = Gateway::new(
        hosts,
        StateCodec::new(&config.cookie.secret),
        config.cookie.name.clone(),
        shutdown.clone(),
    );
    let metrics_path = if config.metrics.enable {
        let handle = install_exporter().context("failed to install metrics exporter")?;
        gateway = gateway.with_prometheus(handle);
        Some(config.metrics.path.as_str())
    } else {
        None
    };

    let app = porta::router(Arc::new(gateway), guard, metrics_path);
    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    let phases = ShutdownPhases::default();
    let served = porta::serve(listener, app, &shutdown, phases).await;

    // Phase 3: stop ongoing work, then give it a moment before exiting.
    shutdown.trigger();
    shutdown.cancel_ongoing();
    sweeper.wait().await;
    signals.abort();
    tokio::time::sleep(phases.hard_grace).await;

    info!("Shutdown complete");
    telemetry::shutdown_tracer();

    served
}

fn log_startup_args(args: &Args) {
    let hosts = args
        .config
        .hosts
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    info!(
        config = %args.config_path.display(),
        port = args.port,
        env = ?args.config.env,
        hosts = %hosts,
        metrics = args.config.metrics.enable,
        "{} {} - {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
