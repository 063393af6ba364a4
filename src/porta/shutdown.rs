//! Process shutdown sequencing.
//!
//! Two independent cancellation tokens drive shutdown. `root` fires on
//! SIGINT/SIGTERM: the health check starts failing immediately while the
//! listener keeps serving for a readiness drain, then the listener closes
//! within a bounded grace. Only afterwards is `ongoing` cancelled, which stops
//! in-flight provider calls and background loops such as the rate-limit sweep.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPhases {
    /// Listener stays open while the health check reports unhealthy.
    pub readiness_drain: Duration,
    /// Upper bound for in-flight requests once the listener stops accepting.
    pub listener_timeout: Duration,
    /// Pause after cancelling ongoing work, before the process exits.
    pub hard_grace: Duration,
}

impl Default for ShutdownPhases {
    fn default() -> Self {
        Self {
            readiness_drain: Duration::from_secs(5),
            listener_timeout: Duration::from_secs(15),
            hard_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    root: CancellationToken,
    ongoing: CancellationToken,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled as soon as shutdown is requested.
    #[must_use]
    pub const fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Cancelled once the listener has closed.
    #[must_use]
    pub const fn ongoing(&self) -> &CancellationToken {
        &self.ongoing
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn trigger(&self) {
        self.root.cancel();
    }

    /// Cancel ongoing operations.
    pub fn cancel_ongoing(&self) {
        self.ongoing.cancel();
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_for_signal() => {
                    info!("shutdown signal received");
                    shutdown.trigger();
                }
                () = shutdown.root.cancelled() => {}
            }
        })
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phases() {
        let phases = ShutdownPhases::default();
        assert_eq!(phases.readiness_drain, Duration::from_secs(5));
        assert_eq!(phases.listener_timeout, Duration::from_secs(15));
        assert_eq!(phases.hard_grace, Duration::from_secs(3));
    }

    #[test]
    fn tokens_are_independent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_draining());

        shutdown.trigger();
        assert!(shutdown.is_draining());
        assert!(!shutdown.ongoing().is_cancelled());

        shutdown.cancel_ongoing();
        assert!(shutdown.ongoing().is_cancelled());
    }

    #[tokio::test]
    async fn signal_listener_exits_when_triggered_elsewhere() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listen_for_signals();
        shutdown.trigger();
        let joined = tokio::time::timeout(Duration::from_secs(1), listener).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
