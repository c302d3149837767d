use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable handle for coordinating a graceful process shutdown.
///
/// The handle carries the lifecycle stop signal for all long-running tasks.
/// It is deliberately separate from any per-request cancellation: RPC and
/// database calls are bounded by their own timeouts, while the subscriber,
/// polling workers and monitors only stop when this signal fires.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
    delay: Duration,
}

impl Shutdown {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
            delay,
        }
    }

    /// Create a shutdown handle and start watching for SIGINT/SIGTERM.
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let shutdown = Self::new(timeout, delay);

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = signal_shutdown().await {
                    error!("Error handling termination signal: {}", err);
                }
                shutdown.shutdown();
            }
        });

        shutdown
    }

    /// Send the signal to shutdown the program.
    pub fn shutdown(&self) {
        // Does not fail because the channel never closes.
        let _ = self.sender.send(true);
    }

    /// Are we currently shutting down?
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for the shutdown signal.
    ///
    /// Resolves immediately if the program is already shutting down.
    /// The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        eprintln!("DEBUG: entering await_shutdown_begin");
        let mut watch = self.sender.subscribe();
        eprintln!("DEBUG: subscribed, value={}", *watch.borrow());
        if *watch.borrow_and_update() {
            eprintln!("DEBUG: returning immediately");
            return;
        }
        // Does not fail because the sender is owned by self.
        let _ = watch.changed().await;
    }

    /// The duration tasks are given to finish after the signal fires.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The minimum amount of time to wait after a shutdown is initiated
    /// before the process exits, so cancelled tasks reach an await point.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();

        assert!(elapsed > Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_shutdown_resolves_immediately_when_already_down() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::from_secs(1));
        shutdown.shutdown();
        shutdown.await_shutdown_begin().await;
    }
}
