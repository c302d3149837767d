use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::CrawlerConfig;
use crate::database::methods::DbMethods;
use crate::ethereum::ChainGateway;
use crate::publisher::{EventSink, TransactionEvent};

/// Ceiling for one block, covering its RPC fetches, event publishes and
/// store writes together.
const BLOCK_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The block-processing pipeline.
///
/// Given a block number it fetches the block, enumerates its transactions
/// and commits everything with full idempotence: every step tolerates having
/// already happened, so a block can be re-processed any number of times.
pub struct Crawler {
    gateway: Arc<dyn ChainGateway>,
    database: Arc<dyn DbMethods>,
    events: Option<Arc<dyn EventSink>>,
    pool: Arc<Semaphore>,
    config: CrawlerConfig,
    network: String,
}

impl Crawler {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        database: Arc<dyn DbMethods>,
        events: Option<Arc<dyn EventSink>>,
        config: CrawlerConfig,
        network: String,
    ) -> Self {
        let workers = config.concurrent_workers.max(1);
        Self {
            gateway,
            database,
            events,
            pool: Arc::new(Semaphore::new(workers)),
            config,
            network,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn process_block(&self, number: u64) -> anyhow::Result<()> {
        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;

        timeout(BLOCK_DEADLINE, self.process_block_inner(number))
            .await
            .map_err(|_| {
                anyhow!("processing block {number} exceeded the {BLOCK_DEADLINE:?} deadline")
            })?
    }

    async fn process_block_inner(&self, number: u64) -> anyhow::Result<()> {
        let block = self.gateway.block_by_number(number).await?;

        let existing = self
            .database
            .block_by_number(&block.number, &self.network)
            .await?;
        if existing.is_some() {
            // The transaction set may be partial from an earlier attempt, so
            // only the block write is skipped.
            debug!(number, "block already stored, refreshing its transactions");
        } else {
            self.database.insert_block(&block).await?;
        }

        let transactions = self.gateway.transactions_by_block(number).await?;

        // Publish before committing so a consumer can never observe an event
        // whose data will not be persisted.
        if let Some(events) = &self.events {
            for transaction in &transactions {
                let event = TransactionEvent::from_record(transaction, &block);
                if let Err(error) = events.publish_transaction(&event).await {
                    warn!(
                        hash = %transaction.hash,
                        ?error,
                        "failed to publish transaction event"
                    );
                }
            }
        }

        self.database.write_transactions(&transactions).await?;
        self.database
            .mark_block_processed(&block.hash, &self.network)
            .await?;

        info!(number, transactions = transactions.len(), "block processed");
        Ok(())
    }

    /// Batch range protocol: dispatch every block in `[start, end]` through
    /// the worker pool and aggregate failures. The caller must not advance
    /// its cursor unless the whole batch succeeded.
    #[instrument(level = "debug", skip(self))]
    pub async fn process_range(self: &Arc<Self>, start: u64, end: u64) -> anyhow::Result<()> {
        let mut workers = JoinSet::new();

        for number in start..=end {
            if number > start && !self.config.block_delay.is_zero() {
                // Pace dispatches to stay under upstream rate limits.
                sleep(self.config.block_delay).await;
            }

            let crawler = self.clone();
            workers.spawn(async move {
                crawler
                    .process_block(number)
                    .await
                    .map_err(|error| (number, error))
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(join_error) => return Err(anyhow!("block worker panicked: {join_error}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let summary = failures
                .iter()
                .map(|(number, error)| format!("{number}: {error:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(anyhow!(
                "{} of {} blocks failed: {summary}",
                failures.len(),
                end - start + 1
            ))
        }
    }
}
