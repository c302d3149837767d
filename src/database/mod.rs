use std::future::Future;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CrawlerConfig, DatabaseConfig};
use crate::database::types::{Block, CrawlerMetric, SystemHealth, Transaction};

pub mod methods;
pub mod types;

/// Connection-class failures are retried this many times, with linear
/// backoff of 1 s, 2 s, 3 s between attempts.
const MAX_CONNECTION_RETRIES: u64 = 3;

pub const BLOCKS_COLLECTION: &str = "blocks";
pub const TRANSACTIONS_COLLECTION: &str = "transactions";
pub const CRAWLER_METRICS_COLLECTION: &str = "crawler_metrics";
pub const SYSTEM_HEALTH_COLLECTION: &str = "system_health";

#[derive(Debug, Error)]
pub enum Error {
    #[error("database driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] mongodb::bson::de::Error),
}

/// How transaction batches are committed.
///
/// The strategy is fixed at startup; the ingestion pipeline is agnostic to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStrategy {
    pub use_upsert: bool,
    pub upsert_fallback: bool,
}

impl From<&CrawlerConfig> for WriteStrategy {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            use_upsert: config.use_upsert,
            upsert_fallback: config.upsert_fallback,
        }
    }
}

pub struct Database {
    client: Client,
    database: mongodb::Database,
    write_strategy: WriteStrategy,
}

impl Database {
    pub async fn new(
        config: &DatabaseConfig,
        write_strategy: WriteStrategy,
    ) -> Result<Self, Error> {
        let options = ClientOptions::parse(config.uri.expose()).await?;
        let client = Client::with_options(options)?;
        let database = client.database(&config.database);

        // Fail fast on an unreachable server instead of at the first write.
        database.run_command(doc! { "ping": 1 }).await?;
        info!(database = %config.database, "Connected to document store");

        Ok(Self {
            client,
            database,
            write_strategy,
        })
    }

    pub(crate) fn blocks(&self) -> Collection<Block> {
        self.database.collection(BLOCKS_COLLECTION)
    }

    pub(crate) fn transactions(&self) -> Collection<Transaction> {
        self.database.collection(TRANSACTIONS_COLLECTION)
    }

    pub(crate) fn crawler_metrics(&self) -> Collection<CrawlerMetric> {
        self.database.collection(CRAWLER_METRICS_COLLECTION)
    }

    pub(crate) fn system_health(&self) -> Collection<SystemHealth> {
        self.database.collection(SYSTEM_HEALTH_COLLECTION)
    }

    pub(crate) const fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) const fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    /// Create the unique and supporting indexes. Index creation is
    /// idempotent, so this is safe to run on every startup.
    pub async fn init_indexes(&self) -> Result<(), Error> {
        let blocks = self.blocks();
        blocks.create_index(unique_index(doc! { "number": 1 })).await?;
        blocks.create_index(unique_index(doc! { "hash": 1 })).await?;
        blocks
            .create_index(index(doc! { "network": 1, "number": 1 }))
            .await?;
        blocks.create_index(index(doc! { "timestamp": 1 })).await?;
        blocks.create_index(index(doc! { "status": 1 })).await?;

        let transactions = self.transactions();
        transactions
            .create_index(unique_index(doc! { "hash": 1 }))
            .await?;
        transactions
            .create_index(index(doc! { "block_hash": 1 }))
            .await?;
        transactions
            .create_index(index(doc! { "block_number": 1 }))
            .await?;
        transactions.create_index(index(doc! { "from": 1 })).await?;
        transactions.create_index(index(doc! { "to": 1 })).await?;
        transactions
            .create_index(index(doc! { "network": 1, "block_number": 1 }))
            .await?;
        transactions
            .create_index(index(doc! { "tx_status": 1 }))
            .await?;

        info!("Database indexes are in place");
        Ok(())
    }
}

fn index(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

fn unique_index(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            mongodb::options::IndexOptions::builder()
                .unique(true)
                .build(),
        )
        .build()
}

/// Primary-key violations are absorbed as success at the caller boundary:
/// the target state is already present and the ingest is idempotent.
pub fn is_duplicate_key_error(error: &mongodb::error::Error) -> bool {
    match &*error.kind {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_error)) => {
            write_error.code == 11000
        }
        ErrorKind::InsertMany(insert_error) => insert_error
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == 11000)),
        ErrorKind::BulkWrite(bulk_error) => bulk_error
            .write_errors
            .values()
            .any(|e| e.code == 11000),
        _ => error.to_string().contains("E11000"),
    }
}

pub(crate) fn is_connection_error(error: &mongodb::error::Error) -> bool {
    matches!(
        &*error.kind,
        ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::ServerSelection { .. }
    )
}

/// Retry `operation` on connection-class errors with linear backoff.
/// Every other error surfaces immediately.
pub(crate) async fn with_retry<T, F, Fut>(
    operation: &str,
    f: F,
) -> Result<T, mongodb::error::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, mongodb::error::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Err(error) if is_connection_error(&error) && attempt <= MAX_CONNECTION_RETRIES => {
                warn!(
                    operation,
                    attempt,
                    error = %error,
                    "database connection error, retrying"
                );
                tokio::time::sleep(Duration::from_secs(attempt)).await;
            }
            other => return other,
        }
    }
}
