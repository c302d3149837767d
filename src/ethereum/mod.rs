use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Middleware, Provider, ProviderError};
use ethers::types::{
    Address, Block as EthersBlock, BlockId, Transaction as EthersTransaction,
    TransactionReceipt, TxHash, H256,
};
use mongodb::bson::DateTime;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use self::rpc_logger::RpcLogger;
use self::transport::Transport;
use crate::config::EthereumConfig;
use crate::database::types::{Block, BlockStatus, Transaction, TxStatus};

pub mod rpc_logger;
pub mod subscriber;
pub mod transport;

type InnerProvider = Provider<RpcLogger<Transport>>;

/// Retries after a transient failure, per call.
const BLOCK_RETRY_LIMIT: u32 = 3;
const RECEIPT_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not connected to the rpc endpoint")]
    NotConnected,

    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("block is pending and has no canonical number or hash")]
    PendingBlock,

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("transaction {0} is not yet included in a block")]
    TransactionPending(String),

    #[error("rate limited by the rpc endpoint: {0}")]
    RateLimited(String),

    #[error("rpc request timed out: {0}")]
    Timeout(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The slice of the gateway the ingestion pipeline depends on.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, Error>;

    async fn block_by_number(&self, number: u64) -> Result<Block, Error>;

    /// One record per transaction in block order. Depending on configuration
    /// the receipts are fetched individually or skipped entirely; a failed
    /// receipt fetch never drops its transaction.
    async fn transactions_by_block(&self, number: u64) -> Result<Vec<Transaction>, Error>;
}

/// Typed façade over the JSON-RPC transport.
///
/// Every outbound call is paced by a minimum inter-request interval and
/// retried with backoff on transient failures. Connection-class errors
/// trigger one transparent reconnect before they surface.
pub struct EthereumGateway {
    config: EthereumConfig,
    network: String,
    provider: RwLock<Option<InnerProvider>>,
    last_request: Mutex<Option<Instant>>,
}

impl EthereumGateway {
    pub fn new(config: EthereumConfig, network: String) -> Self {
        Self {
            config,
            network,
            provider: RwLock::new(None),
            last_request: Mutex::new(None),
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn connect(&self) -> Result<(), Error> {
        let transport = Transport::new(self.config.rpc_url.to_url())
            .await
            .map_err(|error| Error::Connection(error.to_string()))?;
        let provider = Provider::new(RpcLogger::new(transport));

        let chain_id = provider.get_chainid().await?;
        info!(%chain_id, network = %self.network, "Connected to Ethereum provider");

        *self.provider.write().await = Some(provider);
        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.provider.write().await = None;
        info!("Disconnected from Ethereum provider");
    }

    pub async fn is_connected(&self) -> bool {
        self.provider.read().await.is_some()
    }

    pub async fn latest_block_number(&self) -> Result<u64, Error> {
        let number = self
            .call_with_retry("eth_blockNumber", BLOCK_RETRY_LIMIT, |provider| async move {
                provider.get_block_number().await
            })
            .await?;
        Ok(number.as_u64())
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Block, Error> {
        let block = self
            .call_with_retry(
                "eth_getBlockByNumber",
                BLOCK_RETRY_LIMIT,
                move |provider| async move {
                    provider.get_block(BlockId::Number(number.into())).await
                },
            )
            .await?
            .ok_or_else(|| Error::BlockNotFound(number.to_string()))?;

        block_record(&block, &self.network)
    }

    pub async fn block_by_hash(&self, hash: H256) -> Result<Block, Error> {
        let block = self
            .call_with_retry(
                "eth_getBlockByHash",
                BLOCK_RETRY_LIMIT,
                move |provider| async move { provider.get_block(BlockId::Hash(hash)).await },
            )
            .await?
            .ok_or_else(|| Error::BlockNotFound(format!("{hash:#x}")))?;

        block_record(&block, &self.network)
    }

    pub async fn transaction_by_hash(&self, hash: H256) -> Result<Transaction, Error> {
        let transaction = self
            .call_with_retry(
                "eth_getTransactionByHash",
                BLOCK_RETRY_LIMIT,
                move |provider| async move { provider.get_transaction(hash).await },
            )
            .await?
            .ok_or_else(|| Error::TransactionNotFound(format!("{hash:#x}")))?;

        if transaction.block_hash.is_none() {
            return Err(Error::TransactionPending(format!("{hash:#x}")));
        }

        let receipt = if self.config.skip_receipts {
            None
        } else {
            self.receipt_by_hash(hash).await?
        };

        Ok(transaction_record(
            &transaction,
            receipt.as_ref(),
            self.config.skip_receipts,
            &self.network,
        ))
    }

    pub async fn receipt_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, Error> {
        self.call_with_retry(
            "eth_getTransactionReceipt",
            RECEIPT_RETRY_LIMIT,
            move |provider| async move { provider.get_transaction_receipt(hash).await },
        )
        .await
    }

    pub async fn transactions_by_block(&self, number: u64) -> Result<Vec<Transaction>, Error> {
        let block = self
            .call_with_retry(
                "eth_getBlockByNumber",
                BLOCK_RETRY_LIMIT,
                move |provider| async move {
                    provider
                        .get_block_with_txs(BlockId::Number(number.into()))
                        .await
                },
            )
            .await?
            .ok_or_else(|| Error::BlockNotFound(number.to_string()))?;

        let mut records = Vec::with_capacity(block.transactions.len());
        for transaction in &block.transactions {
            let receipt = if self.config.skip_receipts {
                None
            } else {
                match self.receipt_by_hash(transaction.hash).await {
                    Ok(receipt) => receipt,
                    Err(error) => {
                        warn!(
                            hash = %transaction.hash,
                            %error,
                            "receipt fetch failed, keeping the transaction without it"
                        );
                        None
                    }
                }
            };
            records.push(transaction_record(
                transaction,
                receipt.as_ref(),
                self.config.skip_receipts,
                &self.network,
            ));
        }

        Ok(records)
    }

    pub async fn network_id(&self) -> Result<String, Error> {
        self.call_with_retry("net_version", BLOCK_RETRY_LIMIT, |provider| async move {
            provider.get_net_version().await
        })
        .await
    }

    pub async fn gas_price(&self) -> Result<String, Error> {
        let price = self
            .call_with_retry("eth_gasPrice", BLOCK_RETRY_LIMIT, |provider| async move {
                provider.get_gas_price().await
            })
            .await?;
        Ok(price.to_string())
    }

    pub async fn health_check(&self) -> Result<u64, Error> {
        self.latest_block_number().await
    }

    async fn provider(&self) -> Result<InnerProvider, Error> {
        self.provider
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    async fn reconnect(&self) -> Result<(), Error> {
        let transport = Transport::new(self.config.rpc_url.to_url())
            .await
            .map_err(|error| Error::Connection(error.to_string()))?;
        *self.provider.write().await = Some(Provider::new(RpcLogger::new(transport)));
        info!("Reconnected to Ethereum provider");
        Ok(())
    }

    /// Gate on the minimum inter-request interval.
    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(instant) = *last_request {
            let elapsed = instant.elapsed();
            if elapsed < self.config.rate_limit {
                sleep(self.config.rate_limit - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        retry_limit: u32,
        f: F,
    ) -> Result<T, Error>
    where
        F: Fn(InnerProvider) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut failures: u32 = 0;
        let mut reconnected = false;

        loop {
            self.throttle().await;
            let provider = self.provider().await?;

            let result = tokio::time::timeout(self.config.request_timeout, f(provider)).await;
            let error = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => ProviderError::CustomError(format!(
                    "{operation} timed out after {:?}",
                    self.config.request_timeout
                )),
            };

            failures += 1;
            match classify_failure(&error.to_string()) {
                FailureKind::RateLimit if failures <= retry_limit => {
                    let backoff = rate_limit_backoff(failures);
                    warn!(operation, failures, ?backoff, "rate limited, backing off");
                    sleep(backoff).await;
                }
                FailureKind::Timeout if failures <= retry_limit => {
                    let backoff = timeout_backoff(failures);
                    warn!(operation, failures, ?backoff, "request timed out, backing off");
                    sleep(backoff).await;
                }
                FailureKind::Connection if !reconnected => {
                    warn!(operation, error = %error, "connection failure, reconnecting");
                    self.reconnect().await?;
                    reconnected = true;
                }
                FailureKind::Connection => return Err(Error::Connection(error.to_string())),
                FailureKind::RateLimit => return Err(Error::RateLimited(error.to_string())),
                FailureKind::Timeout => return Err(Error::Timeout(error.to_string())),
                FailureKind::Other => return Err(Error::Provider(error)),
            }
        }
    }
}

#[async_trait]
impl ChainGateway for EthereumGateway {
    async fn latest_block_number(&self) -> Result<u64, Error> {
        Self::latest_block_number(self).await
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, Error> {
        Self::block_by_number(self, number).await
    }

    async fn transactions_by_block(&self, number: u64) -> Result<Vec<Transaction>, Error> {
        Self::transactions_by_block(self, number).await
    }
}

/// Quadratic backoff after a rate-limit response.
pub(crate) fn rate_limit_backoff(failures: u32) -> Duration {
    Duration::from_secs(u64::from(failures * failures))
}

/// Linear backoff after a timed-out request.
pub(crate) fn timeout_backoff(failures: u32) -> Duration {
    Duration::from_secs(u64::from(failures * 2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    RateLimit,
    Timeout,
    Connection,
    Other,
}

pub(crate) fn classify_failure(message: &str) -> FailureKind {
    let message = message.to_ascii_lowercase();

    if message.contains("429") || message.contains("too many requests") {
        return FailureKind::RateLimit;
    }
    if message.contains("timed out")
        || message.contains("timeout")
        || message.contains("deadline exceeded")
    {
        return FailureKind::Timeout;
    }

    const CONNECTION_MARKERS: [&str; 7] = [
        "connection refused",
        "connection reset",
        "connection closed",
        "broken pipe",
        "eof",
        "unreachable",
        "no such host",
    ];
    if CONNECTION_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
    {
        return FailureKind::Connection;
    }

    FailureKind::Other
}

/// Convert a chain block into its storage record. Byte payloads are encoded
/// as `0x`-prefixed lowercase hex and all numerics as decimal strings; the
/// downstream store is text-oriented and must never receive raw bytes.
pub(crate) fn block_record(
    block: &EthersBlock<TxHash>,
    network: &str,
) -> Result<Block, Error> {
    let number = block.number.ok_or(Error::PendingBlock)?;
    let hash = block.hash.ok_or(Error::PendingBlock)?;

    Ok(Block {
        id: None,
        number: number.as_u64().to_string(),
        hash: hash_hex(hash),
        parent_hash: hash_hex(block.parent_hash),
        miner: block.author.map(address_hex).unwrap_or_default(),
        state_root: hash_hex(block.state_root),
        tx_root: hash_hex(block.transactions_root),
        receipts_root: hash_hex(block.receipts_root),
        logs_bloom: block
            .logs_bloom
            .map(|bloom| format!("{bloom:#x}"))
            .unwrap_or_default(),
        extra_data: bytes_hex(block.extra_data.as_ref()),
        nonce: block
            .nonce
            .map(|nonce| format!("{nonce:#x}"))
            .unwrap_or_default(),
        size: block.size.map(|size| size.to_string()).unwrap_or_default(),
        gas_limit: block.gas_limit.to_string(),
        gas_used: block.gas_used.to_string(),
        difficulty: block.difficulty.to_string(),
        total_difficulty: block
            .total_difficulty
            .map(|difficulty| difficulty.to_string())
            .unwrap_or_default(),
        timestamp: block.timestamp.to_string(),
        uncles: block.uncles.iter().copied().map(hash_hex).collect(),
        transaction_hashes: block.transactions.iter().copied().map(hash_hex).collect(),
        crawled_at: DateTime::now(),
        processed_at: None,
        network: network.to_string(),
        status: BlockStatus::Pending,
    })
}

pub(crate) fn transaction_record(
    transaction: &EthersTransaction,
    receipt: Option<&TransactionReceipt>,
    skip_receipts: bool,
    network: &str,
) -> Transaction {
    // Without receipts, inclusion in a canonical block is the only signal we
    // have, which is enough to call the transaction processed.
    let tx_status = if skip_receipts {
        TxStatus::Processed
    } else {
        match receipt {
            Some(receipt) => match receipt.status.map(|status| status.as_u64()) {
                Some(0) => TxStatus::Failed,
                _ => TxStatus::Processed,
            },
            None => TxStatus::Pending,
        }
    };

    Transaction {
        id: None,
        hash: hash_hex(transaction.hash),
        block_hash: transaction.block_hash.map(hash_hex).unwrap_or_default(),
        block_number: transaction
            .block_number
            .map(|number| number.as_u64().to_string())
            .unwrap_or_default(),
        transaction_index: transaction
            .transaction_index
            .map(|index| index.as_u64() as i64)
            .unwrap_or_default(),
        from_address: recover_sender(transaction),
        to_address: transaction.to.map(address_hex),
        value: transaction.value.to_string(),
        gas: transaction.gas.to_string(),
        gas_price: transaction
            .gas_price
            .or_else(|| receipt.and_then(|receipt| receipt.effective_gas_price))
            .map(|price| price.to_string())
            .unwrap_or_default(),
        gas_used: receipt
            .and_then(|receipt| receipt.gas_used)
            .map(|gas| gas.to_string())
            .unwrap_or_default(),
        cumulative_gas_used: receipt
            .map(|receipt| receipt.cumulative_gas_used.to_string())
            .unwrap_or_default(),
        max_fee_per_gas: transaction.max_fee_per_gas.map(|fee| fee.to_string()),
        max_priority_fee_per_gas: transaction
            .max_priority_fee_per_gas
            .map(|fee| fee.to_string()),
        nonce: transaction.nonce.to_string(),
        data: bytes_hex(transaction.input.as_ref()),
        contract_address: receipt
            .and_then(|receipt| receipt.contract_address)
            .map(address_hex),
        status: receipt
            .and_then(|receipt| receipt.status)
            .map(|status| status.as_u64() as i32),
        tx_status,
        crawled_at: DateTime::now(),
        network: network.to_string(),
    }
}

/// Recover the sender from the signature. Falls back to the node-provided
/// `from` when recovery fails; an empty sender is the documented outcome for
/// EIP-4844 blob transactions.
pub(crate) fn recover_sender(transaction: &EthersTransaction) -> String {
    match transaction.recover_from() {
        Ok(address) => address_hex(address),
        Err(error) => {
            if transaction.from != Address::zero() {
                debug!(hash = %transaction.hash, "using node-provided sender");
                return address_hex(transaction.from);
            }

            let is_blob = transaction
                .transaction_type
                .is_some_and(|kind| kind.as_u64() == 3);
            if is_blob {
                debug!(
                    hash = %transaction.hash,
                    "cannot recover the sender of a blob transaction"
                );
            } else {
                warn!(
                    hash = %transaction.hash,
                    %error,
                    "failed to recover transaction sender"
                );
            }
            String::new()
        }
    }
}

fn hash_hex(hash: H256) -> String {
    format!("{hash:#x}")
}

fn address_hex(address: Address) -> String {
    format!("{address:#x}")
}

fn bytes_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
