use std::cmp::min;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use mongodb::bson::DateTime;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{CrawlerConfig, SchedulerConfig, SchedulerMode};
use crate::crawler::Crawler;
use crate::database::methods::DbMethods;
use crate::database::types::CrawlerMetric;
use crate::ethereum::subscriber::{HeadCallback, HeadSubscriber};
use crate::ethereum::ChainGateway;
use crate::shutdown::Shutdown;
use crate::utils::spawn_with_backoff_cancel_on_shutdown;

const FALLBACK_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const TASK_RESTART_BACKOFF: Duration = Duration::from_secs(5);

static LAST_PROCESSED_BLOCK: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "last_processed_block",
        "Highest block number marked processed."
    )
    .unwrap()
});
static PROCESSED_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("processed_blocks", "Blocks processed successfully.").unwrap()
});
static FAILED_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("failed_blocks", "Block processing failures.").unwrap()
});
static SKIPPED_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "skipped_blocks",
        "Blocks placed in the skip window after exhausting retries."
    )
    .unwrap()
});

/// Mutable scheduler bookkeeping, owned by one lock.
#[derive(Debug)]
struct SchedulerState {
    current_block: u64,
    failed_blocks: HashMap<String, u32>,
    skipped_blocks: HashMap<String, Instant>,
    last_block_time: Instant,
}

/// Decides which block numbers are fed to the crawler.
///
/// Three modes: realtime (head-driven), polling (tip-driven catch-up) and
/// hybrid (realtime with polling fallback on stall). Failed blocks are
/// retried up to a cap and then ignored for a cooldown window.
pub struct Scheduler {
    config: SchedulerConfig,
    crawler_config: CrawlerConfig,
    crawler: Arc<Crawler>,
    gateway: Arc<dyn ChainGateway>,
    database: Arc<dyn DbMethods>,
    subscriber: Option<Arc<HeadSubscriber>>,
    state: RwLock<SchedulerState>,
    network: String,
    polling_stop: Mutex<Option<watch::Sender<bool>>>,
    shutdown: Shutdown,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        crawler_config: CrawlerConfig,
        crawler: Arc<Crawler>,
        gateway: Arc<dyn ChainGateway>,
        database: Arc<dyn DbMethods>,
        subscriber: Option<Arc<HeadSubscriber>>,
        start_block: u64,
        network: String,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        if crawler_config.batch_size == 0 {
            bail!("crawler.batch_size must be at least 1");
        }
        if matches!(config.mode, SchedulerMode::Realtime | SchedulerMode::Hybrid)
            && subscriber.is_none()
        {
            bail!("{} mode requires ethereum.ws_url", config.mode);
        }

        Ok(Self {
            config,
            crawler_config,
            crawler,
            gateway,
            database,
            subscriber,
            state: RwLock::new(SchedulerState {
                current_block: start_block,
                failed_blocks: HashMap::new(),
                skipped_blocks: HashMap::new(),
                last_block_time: Instant::now(),
            }),
            network,
            polling_stop: Mutex::new(None),
            shutdown,
        })
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        match self.config.mode {
            SchedulerMode::Polling => self.start_polling().await,
            SchedulerMode::Realtime => self.start_realtime().await?,
            SchedulerMode::Hybrid => {
                if let Err(error) = self.start_realtime().await {
                    warn!(
                        ?error,
                        "realtime subscription failed to start, degrading to polling"
                    );
                    self.start_polling().await;
                }
                self.spawn_fallback_monitor();
            }
        }

        info!(mode = %self.config.mode, cursor = self.current_block().await, "scheduler started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(subscriber) = &self.subscriber {
            subscriber.stop().await;
        }
        self.stop_polling().await;
        info!("scheduler stopped");
    }

    pub async fn current_block(&self) -> u64 {
        self.state.read().await.current_block
    }

    pub async fn failure_count(&self, number: u64) -> u32 {
        self.state
            .read()
            .await
            .failed_blocks
            .get(&number.to_string())
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_skipped(&self, number: u64) -> bool {
        self.state
            .read()
            .await
            .skipped_blocks
            .contains_key(&number.to_string())
    }

    pub async fn polling_active(&self) -> bool {
        self.polling_stop.lock().await.is_some()
    }

    /// Entry point for head notifications.
    pub async fn handle_new_block(self: &Arc<Self>, number: u64) {
        if self.should_skip(number).await {
            return;
        }

        match self.crawler.process_block(number).await {
            Ok(()) => self.record_success(number).await,
            Err(error) => self.record_failure(number, &error).await,
        }
    }

    /// Clear failure bookkeeping, advance the cursor past `number` and stamp
    /// the progress clock.
    pub async fn record_success(&self, number: u64) {
        {
            let mut state = self.state.write().await;
            let key = number.to_string();
            state.failed_blocks.remove(&key);
            state.skipped_blocks.remove(&key);
            state.last_block_time = Instant::now();
            if number + 1 > state.current_block {
                state.current_block = number + 1;
            }
        }

        LAST_PROCESSED_BLOCK.set(number as i64);
        PROCESSED_BLOCKS.inc();

        let metric = CrawlerMetric {
            id: None,
            network: self.network.clone(),
            last_processed_block: number.to_string(),
            recorded_at: DateTime::now(),
        };
        if let Err(error) = self.database.record_crawler_metric(&metric).await {
            debug!(?error, "failed to record crawler metric");
        }
    }

    /// Count a processing failure; after `max_retries` the block enters the
    /// skip window. Duplicate-key and immutable-field shaped errors mean the
    /// block is almost certainly present already and are not counted.
    pub async fn record_failure(&self, number: u64, error: &anyhow::Error) {
        if looks_already_processed(error) {
            warn!(
                number,
                %error,
                "write conflict while processing block, it is likely already present"
            );
            return;
        }

        FAILED_BLOCKS.inc();

        let mut state = self.state.write().await;
        let key = number.to_string();
        let failures = {
            let entry = state.failed_blocks.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if failures >= self.config.max_retries {
            state.skipped_blocks.insert(key, Instant::now());
            SKIPPED_BLOCKS.inc();
            warn!(
                number,
                failures,
                skip_duration = ?self.config.skip_duration,
                "retry budget exhausted, skipping block"
            );
        } else {
            warn!(number, failures, %error, "block processing failed");
        }
    }

    async fn should_skip(&self, number: u64) -> bool {
        let key = number.to_string();
        let mut state = self.state.write().await;

        if let Some(skipped_at) = state.skipped_blocks.get(&key) {
            if skipped_at.elapsed() < self.config.skip_duration {
                debug!(number, "block inside its skip window, ignoring notification");
                return true;
            }
            // Window over: forget the history and try again from scratch.
            state.skipped_blocks.remove(&key);
            state.failed_blocks.remove(&key);
            info!(number, "skip window expired, retrying block");
        }

        false
    }

    async fn start_realtime(self: &Arc<Self>) -> anyhow::Result<()> {
        let subscriber = self
            .subscriber
            .clone()
            .context("realtime mode requires a websocket endpoint")?;

        let scheduler = self.clone();
        let callback: HeadCallback = Arc::new(move |number| {
            let scheduler = scheduler.clone();
            Box::pin(async move { scheduler.handle_new_block(number).await })
        });

        subscriber.start(callback).await;
        Ok(())
    }

    async fn start_polling(self: &Arc<Self>) {
        let mut polling_stop = self.polling_stop.lock().await;
        if polling_stop.is_some() {
            debug!("polling worker already active");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        *polling_stop = Some(stop);

        let scheduler = self.clone();
        spawn_with_backoff_cancel_on_shutdown(
            move || scheduler.clone().polling_loop(stop_rx.clone()),
            TASK_RESTART_BACKOFF,
            self.shutdown.clone(),
        );
        info!(interval = ?self.config.polling_interval, "polling worker started");
    }

    /// Stop the polling worker. Taking the sender out makes a second stop a
    /// no-op, so concurrent stop paths cannot trip over each other.
    async fn stop_polling(&self) {
        if let Some(stop) = self.polling_stop.lock().await.take() {
            let _ = stop.send(true);
            info!("polling worker stopped");
        }
    }

    async fn polling_loop(
        self: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
                _ = self.shutdown.await_shutdown_begin() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(error) = self.poll_once(&stop_rx).await {
                        warn!(?error, "polling pass failed, will retry on the next tick");
                    }
                }
            }
        }
    }

    /// One catch-up pass: walk from the cursor to the current tip in batches,
    /// advancing the cursor only after a batch fully succeeds.
    async fn poll_once(&self, stop_rx: &watch::Receiver<bool>) -> anyhow::Result<()> {
        let tip = self.gateway.latest_block_number().await?;

        loop {
            if *stop_rx.borrow() || self.shutdown.is_shutting_down() {
                return Ok(());
            }

            let current = self.state.read().await.current_block;
            if current > tip {
                return Ok(());
            }

            let end = min(current + self.crawler_config.batch_size, tip);
            debug!(current, end, tip, "processing batch");
            self.crawler.process_range(current, end).await?;
            self.record_success(end).await;

            if end >= tip {
                return Ok(());
            }
            sleep(self.crawler_config.batch_delay).await;
        }
    }

    fn spawn_fallback_monitor(self: &Arc<Self>) {
        let scheduler = self.clone();
        spawn_with_backoff_cancel_on_shutdown(
            move || scheduler.clone().fallback_monitor_loop(),
            TASK_RESTART_BACKOFF,
            self.shutdown.clone(),
        );
    }

    async fn fallback_monitor_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = interval(FALLBACK_MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.await_shutdown_begin() => return Ok(()),
                _ = ticker.tick() => self.fallback_tick().await,
            }
        }
    }

    async fn fallback_tick(self: &Arc<Self>) {
        let heads_stalled =
            self.state.read().await.last_block_time.elapsed() > self.config.fallback_timeout;
        let subscriber_running = self
            .subscriber
            .as_ref()
            .is_some_and(|subscriber| subscriber.is_running());

        self.apply_fallback(heads_stalled, subscriber_running).await;
    }

    /// Hybrid fallback decision: start polling when heads stall, stop it
    /// once head events resume while the subscriber is up.
    pub async fn apply_fallback(self: &Arc<Self>, heads_stalled: bool, subscriber_running: bool) {
        let polling = self.polling_active().await;

        if heads_stalled && !polling {
            warn!(
                fallback_timeout = ?self.config.fallback_timeout,
                "no head events within the fallback window, starting polling"
            );
            self.start_polling().await;
        } else if !heads_stalled && polling && subscriber_running {
            info!("head events resumed, stopping fallback polling");
            self.stop_polling().await;
        }
    }
}

/// Duplicate-key and immutable-field rejections are strong hints the block
/// was already committed by an earlier attempt or a concurrent writer.
fn looks_already_processed(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_ascii_lowercase();
    message.contains("e11000")
        || message.contains("duplicate key")
        || message.contains("immutable")
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn duplicate_and_immutable_errors_read_as_already_processed() {
        assert!(looks_already_processed(&anyhow!(
            "E11000 duplicate key error collection: ethereum_raw_data.blocks"
        )));
        assert!(looks_already_processed(&anyhow!(
            "Performing an update on the path '_id' would modify the immutable field '_id'"
        )));
        assert!(!looks_already_processed(&anyhow!("connection reset by peer")));
    }
}
