use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Middleware, Provider, Ws};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::utils::secret::SecretUrl;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
/// No message for this long means the connection is considered stalled even
/// when pings still go through.
const STALL_THRESHOLD: Duration = Duration::from_secs(120);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Invoked once per head notification, on a task of its own.
pub type HeadCallback = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// A single long-lived `newHeads` WebSocket subscription.
///
/// A supervisor task owns the connection: it dials, subscribes, runs the
/// read loop and decides on reconnection, so there is no self-recursive
/// restart path. The subscriber never reaches a terminal failed state while
/// running; after a full reconnect cycle it keeps trying in the background.
///
/// The stop signal is private to the subscriber. Cancellation of a caller's
/// scope never tears the session down; only [`HeadSubscriber::stop`] does.
pub struct HeadSubscriber {
    ws_url: SecretUrl,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    running: Arc<AtomicBool>,
    instance: RwLock<Option<RunningInstance>>,
}

struct RunningInstance {
    supervisor: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl RunningInstance {
    fn shutdown(self) {
        info!("Sending a shutdown signal to the head subscriber.");
        let _ = self.stop.send(true);
        self.supervisor.abort();
    }
}

enum SessionEnd {
    Stopped,
    ConnectionLost,
}

impl HeadSubscriber {
    pub fn new(ws_url: SecretUrl, reconnect_attempts: u32, reconnect_delay: Duration) -> Self {
        Self {
            ws_url,
            reconnect_attempts,
            reconnect_delay,
            running: Arc::new(AtomicBool::new(false)),
            instance: RwLock::new(None),
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn start(&self, callback: HeadCallback) {
        let mut instance = self.instance.write().await;
        if instance.is_some() {
            info!("Head subscriber already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let (stop, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(Self::supervise(
            self.ws_url.clone(),
            self.reconnect_attempts,
            self.reconnect_delay,
            self.running.clone(),
            callback,
            stop_rx,
        ));

        *instance = Some(RunningInstance { supervisor, stop });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut instance = self.instance.write().await;
        match instance.take() {
            Some(instance) => instance.shutdown(),
            None => info!("Head subscriber not running."),
        }
    }

    async fn supervise(
        ws_url: SecretUrl,
        reconnect_attempts: u32,
        reconnect_delay: Duration,
        running: Arc<AtomicBool>,
        callback: HeadCallback,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut cycle_failures: u32 = 0;

        while running.load(Ordering::SeqCst) && !*stop_rx.borrow() {
            let session = std::panic::AssertUnwindSafe(Self::run_session(
                &ws_url,
                callback.clone(),
                stop_rx.clone(),
            ))
            .catch_unwind()
            .await;

            match session {
                Ok(Ok(SessionEnd::Stopped)) => break,
                Ok(Ok(SessionEnd::ConnectionLost)) => {
                    warn!("head subscription connection lost");
                }
                Ok(Err(error)) => {
                    warn!(%error, "head subscription session failed");
                }
                Err(panic) => {
                    warn!(?panic, "head subscription reader panicked, restarting");
                }
            }

            if !running.load(Ordering::SeqCst) {
                break;
            }

            cycle_failures += 1;
            if cycle_failures > reconnect_attempts {
                // Not a terminal state: start a fresh reconnect cycle.
                warn!(
                    attempts = reconnect_attempts,
                    "reconnect attempts exhausted, continuing in the background"
                );
                cycle_failures = 1;
            }

            let backoff = reconnect_backoff(reconnect_delay, cycle_failures);
            debug!(?backoff, attempt = cycle_failures, "waiting before reconnect");
            tokio::select! {
                () = sleep(backoff) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("head subscriber supervisor exited");
    }

    async fn run_session(
        ws_url: &SecretUrl,
        callback: HeadCallback,
        mut stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        let ws = timeout(HANDSHAKE_TIMEOUT, Ws::connect(ws_url.to_url()))
            .await
            .map_err(|_| anyhow::anyhow!("websocket handshake timed out"))??;
        let provider = Provider::new(ws);

        let mut stream = provider.subscribe_blocks().await?;
        info!(subscription_id = %stream.id, "subscribed to new heads");

        let last_message = Arc::new(RwLock::new(Instant::now()));
        let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<&'static str>(1);
        let monitor = tokio::spawn(Self::monitor_connection(
            provider.clone(),
            last_message.clone(),
            reconnect_tx,
        ));

        let end = loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break SessionEnd::Stopped;
                    }
                }
                reason = reconnect_rx.recv() => {
                    warn!(
                        reason = reason.unwrap_or("monitor exited"),
                        "connection monitor requested a reconnect"
                    );
                    break SessionEnd::ConnectionLost;
                }
                next = timeout(READ_TIMEOUT, stream.next()) => match next {
                    // Read deadline passed without traffic. Stall detection
                    // is the monitor's job; keep reading.
                    Err(_) => {}
                    Ok(None) => break SessionEnd::ConnectionLost,
                    Ok(Some(head)) => {
                        *last_message.write().await = Instant::now();
                        match head.number {
                            Some(number) => {
                                debug!(number = number.as_u64(), "new head notification");
                                // Fan out on a fresh task so a slow consumer
                                // cannot stall the reader.
                                tokio::spawn(callback(number.as_u64()));
                            }
                            None => warn!("head notification without a number, skipping"),
                        }
                    }
                }
            }
        };

        monitor.abort();
        Ok(end)
    }

    /// Pings the endpoint every 30 s and watches the time since the last
    /// message. Either a failed ping or a stalled read path asks the
    /// supervisor for a reconnect.
    async fn monitor_connection(
        provider: Provider<Ws>,
        last_message: Arc<RwLock<Instant>>,
        reconnect: mpsc::Sender<&'static str>,
    ) {
        let mut ping_ticker = interval(PING_INTERVAL);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ping_ticker.tick().await;

        loop {
            ping_ticker.tick().await;

            let ping = timeout(PING_TIMEOUT, provider.get_chainid()).await;
            if ping.map_or(true, |result| result.is_err()) {
                let _ = reconnect.send("ping failed").await;
                return;
            }

            if last_message.read().await.elapsed() > STALL_THRESHOLD {
                let _ = reconnect.send("no message within the stall threshold").await;
                return;
            }
        }
    }
}

fn reconnect_backoff(delay: Duration, attempt: u32) -> Duration {
    (delay * attempt).min(MAX_RECONNECT_BACKOFF)
}
