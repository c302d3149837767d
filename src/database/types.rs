use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a persisted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Pending,
    Processed,
}

impl From<BlockStatus> for &'static str {
    fn from(status: BlockStatus) -> Self {
        match status {
            BlockStatus::Pending => "pending",
            BlockStatus::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

impl From<TxStatus> for &'static str {
    fn from(status: TxStatus) -> Self {
        match status {
            TxStatus::Pending => "pending",
            TxStatus::Processed => "processed",
            TxStatus::Failed => "failed",
        }
    }
}

/// Storage-facing block record.
///
/// All chain numerics are carried as decimal strings to preserve the full
/// 256-bit range; byte payloads are `0x`-prefixed lowercase hex. The `_id` is
/// assigned at write time and never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ObjectId>,
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    pub state_root: String,
    pub tx_root: String,
    pub receipts_root: String,
    pub logs_bloom: String,
    pub extra_data: String,
    pub nonce: String,
    pub size: String,
    pub gas_limit: String,
    pub gas_used: String,
    pub difficulty: String,
    pub total_difficulty: String,
    pub timestamp: String,
    pub uncles: Vec<String>,
    pub transaction_hashes: Vec<String>,
    pub crawled_at: DateTime,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub processed_at: Option<DateTime>,
    pub network: String,
    pub status: BlockStatus,
}

/// Storage-facing transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ObjectId>,
    pub hash: String,
    pub block_hash: String,
    pub block_number: String,
    pub transaction_index: i64,
    /// Recovered from the signature; empty when recovery fails (expected for
    /// EIP-4844 blob transactions).
    #[serde(rename = "from")]
    pub from_address: String,
    /// `None` for contract creation.
    #[serde(rename = "to")]
    pub to_address: Option<String>,
    pub value: String,
    pub gas: String,
    pub gas_price: String,
    pub gas_used: String,
    pub cumulative_gas_used: String,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub nonce: String,
    pub data: String,
    pub contract_address: Option<String>,
    /// Receipt status (0/1); `None` when no receipt was fetched.
    pub status: Option<i32>,
    pub tx_status: TxStatus,
    pub crawled_at: DateTime,
    pub network: String,
}

/// Progress snapshot written after successful ingestion steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlerMetric {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ObjectId>,
    pub network: String,
    pub last_processed_block: String,
    pub recorded_at: DateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ObjectId>,
    pub component: String,
    pub healthy: bool,
    pub message: String,
    pub recorded_at: DateTime,
}

impl SystemHealth {
    pub fn healthy(component: &str, message: impl Into<String>) -> Self {
        Self {
            id: None,
            component: component.to_string(),
            healthy: true,
            message: message.into(),
            recorded_at: DateTime::now(),
        }
    }
}
