// Shared in-memory collaborators for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;

use chain_crawler::config::{CrawlerConfig, SchedulerConfig};
use chain_crawler::crawler::Crawler;
use chain_crawler::database::methods::DbMethods;
use chain_crawler::database::types::{
    Block, BlockStatus, CrawlerMetric, SystemHealth, Transaction, TxStatus,
};
use chain_crawler::database::Error as DbError;
use chain_crawler::ethereum::{ChainGateway, Error as GatewayError};
use chain_crawler::publisher::{EventSink, TransactionEvent};
use chain_crawler::scheduler::Scheduler;
use chain_crawler::shutdown::Shutdown;

pub const NETWORK: &str = "testnet";

pub fn block_fixture(number: u64, transactions: &[Transaction]) -> Block {
    Block {
        id: None,
        number: number.to_string(),
        hash: format!("0x{number:064x}"),
        parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
        miner: "0x00000000000000000000000000000000000000aa".to_string(),
        state_root: format!("0x{:064x}", number + 1_000_000),
        tx_root: format!("0x{:064x}", number + 2_000_000),
        receipts_root: format!("0x{:064x}", number + 3_000_000),
        logs_bloom: String::new(),
        extra_data: "0x".to_string(),
        nonce: "0x0000000000000000".to_string(),
        size: "1000".to_string(),
        gas_limit: "30000000".to_string(),
        gas_used: "21000".to_string(),
        difficulty: "0".to_string(),
        total_difficulty: "0".to_string(),
        timestamp: (1_700_000_000 + number).to_string(),
        uncles: vec![],
        transaction_hashes: transactions.iter().map(|tx| tx.hash.clone()).collect(),
        crawled_at: DateTime::now(),
        processed_at: None,
        network: NETWORK.to_string(),
        status: BlockStatus::Pending,
    }
}

pub fn transaction_fixture(number: u64, index: i64, value: &str) -> Transaction {
    Transaction {
        id: None,
        hash: format!("0x{:064x}", number * 1_000 + index as u64),
        block_hash: format!("0x{number:064x}"),
        block_number: number.to_string(),
        transaction_index: index,
        from_address: "0x0000000000000000000000000000000000000001".to_string(),
        to_address: Some("0x0000000000000000000000000000000000000002".to_string()),
        value: value.to_string(),
        gas: "21000".to_string(),
        gas_price: "7".to_string(),
        gas_used: "21000".to_string(),
        cumulative_gas_used: "21000".to_string(),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        nonce: index.to_string(),
        data: "0x".to_string(),
        contract_address: None,
        status: Some(1),
        tx_status: TxStatus::Processed,
        crawled_at: DateTime::now(),
        network: NETWORK.to_string(),
    }
}

/// Chain gateway backed by a map of prepared blocks.
#[derive(Default)]
pub struct MockGateway {
    tip: AtomicU64,
    chain: Mutex<HashMap<u64, (Block, Vec<Transaction>)>>,
    failing: Mutex<HashSet<u64>>,
    pub block_requests: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn add_block(&self, number: u64, transactions: Vec<Transaction>) {
        let block = block_fixture(number, &transactions);
        self.chain
            .lock()
            .unwrap()
            .insert(number, (block, transactions));
        if number > self.tip.load(Ordering::SeqCst) {
            self.set_tip(number);
        }
    }

    /// Seed blocks `0..=tip`, each carrying `transactions_per_block`
    /// transactions with value "1".
    pub fn with_linear_chain(tip: u64, transactions_per_block: i64) -> Self {
        let gateway = Self::new();
        for number in 0..=tip {
            let transactions = (0..transactions_per_block)
                .map(|index| transaction_fixture(number, index, "1"))
                .collect();
            gateway.add_block(number, transactions);
        }
        gateway
    }

    pub fn fail_block(&self, number: u64) {
        self.failing.lock().unwrap().insert(number);
    }

    pub fn heal_block(&self, number: u64) {
        self.failing.lock().unwrap().remove(&number);
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn latest_block_number(&self) -> Result<u64, GatewayError> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, GatewayError> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&number) {
            return Err(GatewayError::Connection(format!(
                "connection reset while fetching block {number}"
            )));
        }

        self.chain
            .lock()
            .unwrap()
            .get(&number)
            .map(|(block, _)| block.clone())
            .ok_or_else(|| GatewayError::BlockNotFound(number.to_string()))
    }

    async fn transactions_by_block(&self, number: u64) -> Result<Vec<Transaction>, GatewayError> {
        if self.failing.lock().unwrap().contains(&number) {
            return Err(GatewayError::Connection(format!(
                "connection reset while fetching block {number}"
            )));
        }

        self.chain
            .lock()
            .unwrap()
            .get(&number)
            .map(|(_, transactions)| transactions.clone())
            .ok_or_else(|| GatewayError::BlockNotFound(number.to_string()))
    }
}

fn injected_failure() -> DbError {
    DbError::Driver(std::io::Error::other("injected write failure").into())
}

/// In-memory document store mirroring the idempotence discipline of the real
/// repositories: duplicate block inserts are absorbed, transaction writes
/// upsert by hash and never touch the storage identity of an existing row.
#[derive(Default)]
pub struct MockDb {
    pub blocks: Mutex<HashMap<String, Block>>,
    pub transactions: Mutex<HashMap<String, Transaction>>,
    pub metrics: Mutex<Vec<CrawlerMetric>>,
    pub health: Mutex<Vec<SystemHealth>>,
    pub fail_transaction_writes: AtomicBool,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_processed_block(&self, number: u64) {
        let mut block = block_fixture(number, &[]);
        block.id = Some(ObjectId::new());
        block.status = BlockStatus::Processed;
        block.processed_at = Some(DateTime::now());
        self.blocks.lock().unwrap().insert(block.number.clone(), block);
    }

    pub fn seed_transaction(&self, transaction: Transaction) -> ObjectId {
        let id = ObjectId::new();
        let mut transaction = transaction;
        transaction.id = Some(id);
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction.hash.clone(), transaction);
        id
    }

    pub fn processed_numbers(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .blocks
            .lock()
            .unwrap()
            .values()
            .filter(|block| block.status == BlockStatus::Processed)
            .map(|block| block.number.parse().unwrap())
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Canonical projection of the store for idempotence comparisons:
    /// block numbers with status and per-block transaction (hash, value, id)
    /// triples, deterministically ordered.
    pub fn snapshot(&self) -> Vec<(String, BlockStatus, Vec<(String, String, ObjectId)>)> {
        let blocks = self.blocks.lock().unwrap();
        let transactions = self.transactions.lock().unwrap();

        let mut rows: Vec<_> = blocks
            .values()
            .map(|block| {
                let mut txs: Vec<_> = transactions
                    .values()
                    .filter(|tx| tx.block_number == block.number)
                    .map(|tx| (tx.hash.clone(), tx.value.clone(), tx.id.unwrap()))
                    .collect();
                txs.sort();
                (block.number.clone(), block.status, txs)
            })
            .collect();
        rows.sort();
        rows
    }
}

#[async_trait]
impl DbMethods for MockDb {
    async fn insert_block(&self, block: &Block) -> Result<(), DbError> {
        let mut blocks = self.blocks.lock().unwrap();
        // Duplicate key: the first writer wins and the insert reads as
        // success, like the real repository.
        if !blocks.contains_key(&block.number) {
            let mut block = block.clone();
            block.id = Some(ObjectId::new());
            blocks.insert(block.number.clone(), block);
        }
        Ok(())
    }

    async fn insert_blocks(&self, blocks: &[Block]) -> Result<(), DbError> {
        for block in blocks {
            self.insert_block(block).await?;
        }
        Ok(())
    }

    async fn block_by_number(
        &self,
        number: &str,
        _network: &str,
    ) -> Result<Option<Block>, DbError> {
        Ok(self.blocks.lock().unwrap().get(number).cloned())
    }

    async fn block_by_hash(&self, hash: &str, _network: &str) -> Result<Option<Block>, DbError> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .values()
            .find(|block| block.hash == hash)
            .cloned())
    }

    async fn last_processed_block(&self, _network: &str) -> Result<Option<Block>, DbError> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .values()
            .filter(|block| block.status == BlockStatus::Processed)
            .max_by_key(|block| block.number.parse::<u64>().unwrap_or(0))
            .cloned())
    }

    async fn update_block_status(
        &self,
        hash: &str,
        _network: &str,
        status: BlockStatus,
    ) -> Result<(), DbError> {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(block) = blocks.values_mut().find(|block| block.hash == hash) {
            block.status = status;
        }
        Ok(())
    }

    async fn mark_block_processed(&self, hash: &str, _network: &str) -> Result<(), DbError> {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(block) = blocks.values_mut().find(|block| block.hash == hash) {
            block.status = BlockStatus::Processed;
            block.processed_at = Some(DateTime::now());
        }
        Ok(())
    }

    async fn delete_block(&self, number: &str, _network: &str) -> Result<(), DbError> {
        self.blocks.lock().unwrap().remove(number);
        Ok(())
    }

    async fn block_exists(&self, number: &str, _network: &str) -> Result<bool, DbError> {
        Ok(self.blocks.lock().unwrap().contains_key(number))
    }

    async fn count_blocks(&self, _network: &str) -> Result<u64, DbError> {
        Ok(self.blocks.lock().unwrap().len() as u64)
    }

    async fn write_transactions(&self, transactions: &[Transaction]) -> Result<(), DbError> {
        if self.fail_transaction_writes.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let mut stored = self.transactions.lock().unwrap();
        for transaction in transactions {
            match stored.get_mut(&transaction.hash) {
                Some(existing) => {
                    // Upsert: all mutable fields move, the identity does not.
                    let id = existing.id;
                    *existing = transaction.clone();
                    existing.id = id;
                }
                None => {
                    let mut transaction = transaction.clone();
                    transaction.id = Some(ObjectId::new());
                    stored.insert(transaction.hash.clone(), transaction);
                }
            }
        }
        Ok(())
    }

    async fn transaction_by_hash(
        &self,
        hash: &str,
        _network: &str,
    ) -> Result<Option<Transaction>, DbError> {
        Ok(self.transactions.lock().unwrap().get(hash).cloned())
    }

    async fn transactions_by_block_hash(
        &self,
        block_hash: &str,
    ) -> Result<Vec<Transaction>, DbError> {
        let mut transactions: Vec<_> = self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.block_hash == block_hash)
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.transaction_index);
        Ok(transactions)
    }

    async fn transactions_by_block_number(
        &self,
        number: &str,
        _network: &str,
    ) -> Result<Vec<Transaction>, DbError> {
        let mut transactions: Vec<_> = self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.block_number == number)
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.transaction_index);
        Ok(transactions)
    }

    async fn transactions_by_address(
        &self,
        address: &str,
        _network: &str,
    ) -> Result<Vec<Transaction>, DbError> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| {
                tx.from_address == address || tx.to_address.as_deref() == Some(address)
            })
            .cloned()
            .collect())
    }

    async fn transactions_by_status(
        &self,
        status: TxStatus,
        _network: &str,
    ) -> Result<Vec<Transaction>, DbError> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.tx_status == status)
            .cloned()
            .collect())
    }

    async fn transactions_in_time_range(
        &self,
        start: DateTime,
        end: DateTime,
        _network: &str,
    ) -> Result<Vec<Transaction>, DbError> {
        let mut transactions: Vec<_> = self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.crawled_at >= start && tx.crawled_at <= end)
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.crawled_at);
        Ok(transactions)
    }

    async fn transaction_volume(&self, _network: &str) -> Result<String, DbError> {
        let total: u128 = self
            .transactions
            .lock()
            .unwrap()
            .values()
            .map(|tx| tx.value.parse::<u128>().unwrap_or(0))
            .sum();
        Ok(total.to_string())
    }

    async fn top_transactions_by_value(
        &self,
        _network: &str,
        limit: i64,
    ) -> Result<Vec<Transaction>, DbError> {
        let mut transactions: Vec<_> = self.transactions.lock().unwrap().values().cloned().collect();
        transactions.sort_by_key(|tx| std::cmp::Reverse(tx.value.parse::<u128>().unwrap_or(0)));
        transactions.truncate(limit as usize);
        Ok(transactions)
    }

    async fn count_transactions(&self, _network: &str) -> Result<u64, DbError> {
        Ok(self.transactions.lock().unwrap().len() as u64)
    }

    async fn record_crawler_metric(&self, metric: &CrawlerMetric) -> Result<(), DbError> {
        self.metrics.lock().unwrap().push(metric.clone());
        Ok(())
    }

    async fn record_system_health(&self, health: &SystemHealth) -> Result<(), DbError> {
        self.health.lock().unwrap().push(health.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSink {
    pub events: Mutex<Vec<TransactionEvent>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl EventSink for MockSink {
    async fn publish_transaction(&self, event: &TransactionEvent) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("event stream unavailable");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub gateway: Arc<MockGateway>,
    pub db: Arc<MockDb>,
    pub sink: Arc<MockSink>,
    pub crawler: Arc<Crawler>,
}

/// Crawler configuration without pacing sleeps, so tests run instantly.
pub fn fast_crawler_config() -> CrawlerConfig {
    CrawlerConfig {
        batch_delay: Duration::ZERO,
        block_delay: Duration::ZERO,
        concurrent_workers: 4,
        ..CrawlerConfig::default()
    }
}

pub fn harness_with(gateway: MockGateway, config: CrawlerConfig) -> Harness {
    let gateway = Arc::new(gateway);
    let db = Arc::new(MockDb::new());
    let sink = Arc::new(MockSink::default());
    let crawler = Arc::new(Crawler::new(
        gateway.clone(),
        db.clone(),
        Some(sink.clone()),
        config,
        NETWORK.to_string(),
    ));

    Harness {
        gateway,
        db,
        sink,
        crawler,
    }
}

pub fn harness(gateway: MockGateway) -> Harness {
    harness_with(gateway, fast_crawler_config())
}

pub fn scheduler_with(
    harness: &Harness,
    scheduler_config: SchedulerConfig,
    crawler_config: CrawlerConfig,
    start_block: u64,
) -> Arc<Scheduler> {
    Arc::new(
        Scheduler::new(
            scheduler_config,
            crawler_config,
            harness.crawler.clone(),
            harness.gateway.clone(),
            harness.db.clone(),
            None,
            start_block,
            NETWORK.to_string(),
            Shutdown::new(Duration::from_secs(30), Duration::from_secs(1)),
        )
        .unwrap(),
    )
}
