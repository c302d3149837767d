use async_trait::async_trait;
use ethers::types::U512;
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::options::{UpdateModifications, UpdateOneModel, WriteModel};
use tracing::{debug, instrument, warn};

use super::types::{Block, BlockStatus, CrawlerMetric, SystemHealth, Transaction, TxStatus};
use super::{is_duplicate_key_error, with_retry, Database, Error};

/// Digits of `2^256 - 1`; the widest decimal string a `value` can hold.
const MAX_VALUE_DIGITS: usize = 78;

/// Storage operations used by the ingestion pipeline and the scheduler.
///
/// All writes are idempotent: re-running any of them against the same input
/// leaves the store unchanged.
#[async_trait]
pub trait DbMethods: Send + Sync {
    // Blocks

    /// Insert a block. A primary-key violation means another writer (or a
    /// concurrent retry) won and is treated as success.
    async fn insert_block(&self, block: &Block) -> Result<(), Error>;

    async fn insert_blocks(&self, blocks: &[Block]) -> Result<(), Error>;

    async fn block_by_number(&self, number: &str, network: &str)
        -> Result<Option<Block>, Error>;

    async fn block_by_hash(&self, hash: &str, network: &str) -> Result<Option<Block>, Error>;

    /// The block with the highest number whose status is `Processed`, used to
    /// initialize the scheduler cursor at startup.
    async fn last_processed_block(&self, network: &str) -> Result<Option<Block>, Error>;

    async fn update_block_status(
        &self,
        hash: &str,
        network: &str,
        status: BlockStatus,
    ) -> Result<(), Error>;

    /// Targeted update by hash; stamps `processed_at` with the commit instant.
    async fn mark_block_processed(&self, hash: &str, network: &str) -> Result<(), Error>;

    async fn delete_block(&self, number: &str, network: &str) -> Result<(), Error>;

    async fn block_exists(&self, number: &str, network: &str) -> Result<bool, Error>;

    async fn count_blocks(&self, network: &str) -> Result<u64, Error>;

    // Transactions

    /// Commit a transaction batch following the configured write strategy
    /// (bulk upsert by hash, with an optional plain-insert fallback).
    async fn write_transactions(&self, transactions: &[Transaction]) -> Result<(), Error>;

    async fn transaction_by_hash(
        &self,
        hash: &str,
        network: &str,
    ) -> Result<Option<Transaction>, Error>;

    async fn transactions_by_block_hash(
        &self,
        block_hash: &str,
    ) -> Result<Vec<Transaction>, Error>;

    async fn transactions_by_block_number(
        &self,
        number: &str,
        network: &str,
    ) -> Result<Vec<Transaction>, Error>;

    async fn transactions_by_address(
        &self,
        address: &str,
        network: &str,
    ) -> Result<Vec<Transaction>, Error>;

    async fn transactions_by_status(
        &self,
        status: TxStatus,
        network: &str,
    ) -> Result<Vec<Transaction>, Error>;

    /// Transactions crawled inside `[start, end]`, oldest first.
    async fn transactions_in_time_range(
        &self,
        start: DateTime,
        end: DateTime,
        network: &str,
    ) -> Result<Vec<Transaction>, Error>;

    /// Total `value` moved on a network, as a decimal string. Summed
    /// client-side: no server-side numeric type carries the 256-bit range.
    async fn transaction_volume(&self, network: &str) -> Result<String, Error>;

    /// Largest transactions by `value`. The values are decimal strings, so
    /// the ranking happens on a fixed-width zero-padded copy.
    async fn top_transactions_by_value(
        &self,
        network: &str,
        limit: i64,
    ) -> Result<Vec<Transaction>, Error>;

    async fn count_transactions(&self, network: &str) -> Result<u64, Error>;

    // Bookkeeping

    async fn record_crawler_metric(&self, metric: &CrawlerMetric) -> Result<(), Error>;

    async fn record_system_health(&self, health: &SystemHealth) -> Result<(), Error>;
}

#[async_trait]
impl DbMethods for Database {
    #[instrument(skip_all, fields(number = %block.number), level = "debug")]
    async fn insert_block(&self, block: &Block) -> Result<(), Error> {
        let result = with_retry("insert_block", || async {
            self.blocks().insert_one(block).await.map(|_| ())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(error) if is_duplicate_key_error(&error) => {
                warn!(
                    number = %block.number,
                    "block already present, treating insert as success"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip_all, fields(count = blocks.len()), level = "debug")]
    async fn insert_blocks(&self, blocks: &[Block]) -> Result<(), Error> {
        if blocks.is_empty() {
            return Ok(());
        }

        let result = with_retry("insert_blocks", || async {
            self.blocks()
                .insert_many(blocks)
                .ordered(false)
                .await
                .map(|_| ())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(error) if is_duplicate_key_error(&error) => {
                warn!("some blocks already present, treating insert as success");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn block_by_number(
        &self,
        number: &str,
        network: &str,
    ) -> Result<Option<Block>, Error> {
        let filter = doc! { "number": number, "network": network };
        let block = with_retry("block_by_number", || async {
            self.blocks().find_one(filter.clone()).await
        })
        .await?;
        Ok(block)
    }

    #[instrument(skip(self), level = "debug")]
    async fn block_by_hash(&self, hash: &str, network: &str) -> Result<Option<Block>, Error> {
        let filter = doc! { "hash": hash, "network": network };
        let block = with_retry("block_by_hash", || async {
            self.blocks().find_one(filter.clone()).await
        })
        .await?;
        Ok(block)
    }

    #[instrument(skip(self), level = "debug")]
    async fn last_processed_block(&self, network: &str) -> Result<Option<Block>, Error> {
        // Block numbers are stored as decimal strings, so a lexicographic
        // sort would order "9" after "10". Convert before sorting.
        let pipeline = vec![
            doc! { "$match": {
                "network": network,
                "status": <&str>::from(BlockStatus::Processed),
            } },
            doc! { "$addFields": { "number_numeric": { "$toLong": "$number" } } },
            doc! { "$sort": { "number_numeric": -1 } },
            doc! { "$limit": 1 },
            doc! { "$unset": "number_numeric" },
        ];

        let mut cursor = with_retry("last_processed_block", || async {
            self.blocks().aggregate(pipeline.clone()).await
        })
        .await?;

        match cursor.try_next().await? {
            Some(document) => Ok(Some(mongodb::bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_block_status(
        &self,
        hash: &str,
        network: &str,
        status: BlockStatus,
    ) -> Result<(), Error> {
        let filter = doc! { "hash": hash, "network": network };
        let update = doc! { "$set": { "status": <&str>::from(status) } };
        with_retry("update_block_status", || async {
            self.blocks()
                .update_one(filter.clone(), update.clone())
                .await
                .map(|_| ())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn mark_block_processed(&self, hash: &str, network: &str) -> Result<(), Error> {
        let filter = doc! { "hash": hash, "network": network };
        let update = doc! { "$set": {
            "status": <&str>::from(BlockStatus::Processed),
            "processed_at": DateTime::now(),
        } };
        with_retry("mark_block_processed", || async {
            self.blocks()
                .update_one(filter.clone(), update.clone())
                .await
                .map(|_| ())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_block(&self, number: &str, network: &str) -> Result<(), Error> {
        let filter = doc! { "number": number, "network": network };
        with_retry("delete_block", || async {
            self.blocks().delete_one(filter.clone()).await.map(|_| ())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn block_exists(&self, number: &str, network: &str) -> Result<bool, Error> {
        let filter = doc! { "number": number, "network": network };
        let count = with_retry("block_exists", || async {
            self.blocks().count_documents(filter.clone()).await
        })
        .await?;
        Ok(count > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_blocks(&self, network: &str) -> Result<u64, Error> {
        let count = with_retry("count_blocks", || async {
            self.blocks()
                .count_documents(doc! { "network": network })
                .await
        })
        .await?;
        Ok(count)
    }

    #[instrument(skip_all, fields(count = transactions.len()), level = "debug")]
    async fn write_transactions(&self, transactions: &[Transaction]) -> Result<(), Error> {
        if transactions.is_empty() {
            return Ok(());
        }

        let strategy = self.write_strategy();
        if !strategy.use_upsert {
            return self.insert_transactions(transactions).await;
        }

        match self.upsert_transactions(transactions).await {
            Ok(()) => Ok(()),
            Err(error) if strategy.upsert_fallback => {
                warn!(
                    error = %error,
                    "bulk upsert failed, falling back to plain insert"
                );
                self.insert_transactions(transactions).await
            }
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn transaction_by_hash(
        &self,
        hash: &str,
        network: &str,
    ) -> Result<Option<Transaction>, Error> {
        let filter = doc! { "hash": hash, "network": network };
        let transaction = with_retry("transaction_by_hash", || async {
            self.transactions().find_one(filter.clone()).await
        })
        .await?;
        Ok(transaction)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transactions_by_block_hash(
        &self,
        block_hash: &str,
    ) -> Result<Vec<Transaction>, Error> {
        let filter = doc! { "block_hash": block_hash };
        let cursor = with_retry("transactions_by_block_hash", || async {
            self.transactions()
                .find(filter.clone())
                .sort(doc! { "transaction_index": 1 })
                .await
        })
        .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transactions_by_block_number(
        &self,
        number: &str,
        network: &str,
    ) -> Result<Vec<Transaction>, Error> {
        let filter = doc! { "block_number": number, "network": network };
        let cursor = with_retry("transactions_by_block_number", || async {
            self.transactions()
                .find(filter.clone())
                .sort(doc! { "transaction_index": 1 })
                .await
        })
        .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transactions_by_address(
        &self,
        address: &str,
        network: &str,
    ) -> Result<Vec<Transaction>, Error> {
        let filter = doc! {
            "network": network,
            "$or": [ { "from": address }, { "to": address } ],
        };
        let cursor = with_retry("transactions_by_address", || async {
            self.transactions().find(filter.clone()).await
        })
        .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transactions_by_status(
        &self,
        status: TxStatus,
        network: &str,
    ) -> Result<Vec<Transaction>, Error> {
        let filter = doc! { "tx_status": <&str>::from(status), "network": network };
        let cursor = with_retry("transactions_by_status", || async {
            self.transactions().find(filter.clone()).await
        })
        .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transactions_in_time_range(
        &self,
        start: DateTime,
        end: DateTime,
        network: &str,
    ) -> Result<Vec<Transaction>, Error> {
        let filter = doc! {
            "network": network,
            "crawled_at": { "$gte": start, "$lte": end },
        };
        let cursor = with_retry("transactions_in_time_range", || async {
            self.transactions()
                .find(filter.clone())
                .sort(doc! { "crawled_at": 1 })
                .await
        })
        .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn transaction_volume(&self, network: &str) -> Result<String, Error> {
        let filter = doc! { "network": network };
        let mut cursor = with_retry("transaction_volume", || async {
            self.transactions()
                .clone_with_type::<Document>()
                .find(filter.clone())
                .projection(doc! { "value": 1 })
                .await
        })
        .await?;

        let mut total = U512::zero();
        while let Some(document) = cursor.try_next().await? {
            let value = document.get_str("value").unwrap_or("0");
            match U512::from_dec_str(value) {
                Ok(value) => total = total.saturating_add(value),
                Err(_) => warn!(value, "skipping non-numeric transaction value"),
            }
        }
        Ok(total.to_string())
    }

    #[instrument(skip(self), level = "debug")]
    async fn top_transactions_by_value(
        &self,
        network: &str,
        limit: i64,
    ) -> Result<Vec<Transaction>, Error> {
        // `value` can hold the full 256-bit range (up to 78 digits), which
        // overflows Decimal128, so the ranking key is a fixed-width
        // zero-padded copy: lexicographic order then matches numeric order.
        let padding = "0".repeat(MAX_VALUE_DIGITS);
        let pipeline = vec![
            doc! { "$match": { "network": network } },
            doc! { "$addFields": { "value_sort_key": { "$concat": [
                { "$substrCP": [
                    padding,
                    0,
                    { "$subtract": [ MAX_VALUE_DIGITS as i64, { "$strLenCP": "$value" } ] },
                ] },
                "$value",
            ] } } },
            doc! { "$sort": { "value_sort_key": -1 } },
            doc! { "$limit": limit },
            doc! { "$unset": "value_sort_key" },
        ];

        let mut cursor = with_retry("top_transactions_by_value", || async {
            self.transactions().aggregate(pipeline.clone()).await
        })
        .await?;

        let mut transactions = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            transactions.push(mongodb::bson::from_document(document)?);
        }
        Ok(transactions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_transactions(&self, network: &str) -> Result<u64, Error> {
        let count = with_retry("count_transactions", || async {
            self.transactions()
                .count_documents(doc! { "network": network })
                .await
        })
        .await?;
        Ok(count)
    }

    #[instrument(skip_all, level = "debug")]
    async fn record_crawler_metric(&self, metric: &CrawlerMetric) -> Result<(), Error> {
        self.crawler_metrics().insert_one(metric).await?;
        Ok(())
    }

    #[instrument(skip_all, level = "debug")]
    async fn record_system_health(&self, health: &SystemHealth) -> Result<(), Error> {
        self.system_health().insert_one(health).await?;
        Ok(())
    }
}

impl Database {
    /// Bulk upsert by `hash`: all mutable fields go through `$set`, while the
    /// storage identity is assigned through `$setOnInsert` only, so a
    /// re-processed transaction never rewrites the `_id` of an existing
    /// document.
    async fn upsert_transactions(&self, transactions: &[Transaction]) -> Result<(), Error> {
        let namespace = self.transactions().namespace();

        let mut models = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let (set, set_on_insert) = transaction_update_documents(transaction)?;
            models.push(WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(namespace.clone())
                    .filter(doc! { "hash": &transaction.hash })
                    .update(UpdateModifications::Document(doc! {
                        "$set": set,
                        "$setOnInsert": set_on_insert,
                    }))
                    .upsert(true)
                    .build(),
            ));
        }

        with_retry("upsert_transactions", || async {
            self.client()
                .bulk_write(models.clone())
                .ordered(false)
                .await
                .map(|_| ())
        })
        .await?;

        debug!(count = transactions.len(), "transactions upserted");
        Ok(())
    }

    /// Legacy write path: unordered bulk insert. A duplicate-key failure
    /// means the target state is already present and is surfaced as success.
    async fn insert_transactions(&self, transactions: &[Transaction]) -> Result<(), Error> {
        let result = with_retry("insert_transactions", || async {
            self.transactions()
                .insert_many(transactions)
                .ordered(false)
                .await
                .map(|_| ())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(error) if is_duplicate_key_error(&error) => {
                warn!("some transactions already present, treating insert as success");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Split a transaction record into the `$set` and `$setOnInsert` halves of an
/// upsert. The `_id` must never appear in the mutable half: the server
/// rejects updates that touch the immutable identity of an existing document.
pub(crate) fn transaction_update_documents(
    transaction: &Transaction,
) -> Result<(Document, Document), Error> {
    let mut set = mongodb::bson::to_document(transaction)?;
    set.remove("_id");

    let set_on_insert = doc! { "_id": ObjectId::new() };

    Ok((set, set_on_insert))
}
