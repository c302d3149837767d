use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::stream::{RetentionPolicy, StorageType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EventsConfig;
use crate::database::types::{Block, Transaction};

/// Consumers de-duplicate on message id within this window.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(5 * 60);
const MAX_MESSAGES: i64 = 1_000_000;
const MAX_BYTES: i64 = 1024 * 1024 * 1024;
const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Best-effort per-transaction event emission.
///
/// The stream is not a hard dependency of the ingestion contract: publish
/// failures are logged by the caller and never abort a block.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_transaction(&self, event: &TransactionEvent) -> anyhow::Result<()>;
}

/// JSON payload published for every committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    pub timestamp: String,
    pub gas_used: String,
    pub gas_price: String,
    pub network: String,
}

impl TransactionEvent {
    pub fn from_record(transaction: &Transaction, block: &Block) -> Self {
        Self {
            hash: transaction.hash.clone(),
            from: transaction.from_address.clone(),
            to: transaction.to_address.clone(),
            value: transaction.value.clone(),
            data: transaction.data.clone(),
            block_number: transaction.block_number.clone(),
            block_hash: transaction.block_hash.clone(),
            timestamp: block.timestamp.clone(),
            gas_used: transaction.gas_used.clone(),
            gas_price: transaction.gas_price.clone(),
            network: transaction.network.clone(),
        }
    }
}

/// Work-queue style JetStream publisher with file-backed storage.
pub struct JetStreamPublisher {
    context: jetstream::Context,
    subject: String,
}

impl JetStreamPublisher {
    pub async fn connect(config: &EventsConfig) -> anyhow::Result<Self> {
        let client = async_nats::connect(config.url.expose()).await?;
        let context = jetstream::new(client);

        let subject = format!("{}.events", config.subject_prefix);

        // Idempotent: an existing stream with the same configuration is
        // returned as-is.
        context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![subject.clone().into()],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                duplicate_window: DUPLICATE_WINDOW,
                max_messages: MAX_MESSAGES,
                max_bytes: MAX_BYTES,
                max_age: MAX_AGE,
                ..Default::default()
            })
            .await?;

        info!(stream = %config.stream, subject = %subject, "Connected to event stream");

        Ok(Self { context, subject })
    }
}

#[async_trait]
impl EventSink for JetStreamPublisher {
    async fn publish_transaction(&self, event: &TransactionEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.context
            .publish(self.subject.clone(), payload.into())
            .await?
            .await?;
        debug!(hash = %event.hash, "transaction event published");
        Ok(())
    }
}
