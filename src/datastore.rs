//! # Datastore
//!
//! Persistence seam of the indexer. Writes are grouped into a [`WriteSet`]
//! (everything one event produces) and committed atomically; every row is an
//! upsert keyed by its natural key, so replaying a range is harmless.
//!
//! Two implementations:
//! - [`crate::database::PgDatastore`]: Postgres via sqlx.
//! - [`MemoryDatastore`]: in-process maps with the same upsert semantics, used
//!   by tests and dry runs.

use crate::error::IndexerError;
use crate::types::{FundingRequestRecord, MemberRecord, PoolRecord, TransactionRecord, VoteRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Rows produced by reconciling one event. Committed as a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub pools: Vec<PoolRecord>,
    pub members: Vec<MemberRecord>,
    pub requests: Vec<FundingRequestRecord>,
    pub votes: Vec<VoteRecord>,
    pub transactions: Vec<TransactionRecord>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
            && self.members.is_empty()
            && self.requests.is_empty()
            && self.votes.is_empty()
            && self.transactions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
            + self.members.len()
            + self.requests.len()
            + self.votes.len()
            + self.transactions.len()
    }
}

/// The singleton `indexer_state` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRow {
    pub last_block: u64,
    /// Lowercase hex addresses.
    pub known_pools: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub pools: u64,
    pub members: u64,
    pub requests: u64,
    pub votes: u64,
    pub transactions: u64,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Applies every row of `writes` or none of them.
    async fn commit(&self, writes: &WriteSet) -> Result<(), IndexerError>;

    async fn load_checkpoint(&self) -> Result<Option<CheckpointRow>, IndexerError>;

    /// Upserts the checkpoint row. `last_block` never moves backwards; the
    /// stored pool list is replaced.
    async fn save_checkpoint(&self, last_block: u64, known_pools: &[String])
        -> Result<(), IndexerError>;

    async fn pool(&self, address: &str) -> Result<Option<PoolRecord>, IndexerError>;
    async fn member(&self, pool: &str, address: &str)
        -> Result<Option<MemberRecord>, IndexerError>;
    async fn request(&self, pool: &str, onchain_id: u64)
        -> Result<Option<FundingRequestRecord>, IndexerError>;
    async fn votes_for(&self, pool: &str, onchain_id: u64)
        -> Result<Vec<VoteRecord>, IndexerError>;
    async fn counts(&self) -> Result<TableCounts, IndexerError>;
}

#[derive(Debug, Default)]
struct Tables {
    pools: BTreeMap<String, PoolRecord>,
    members: BTreeMap<(String, String), MemberRecord>,
    requests: BTreeMap<(String, u64), FundingRequestRecord>,
    votes: BTreeMap<(String, u64, String), VoteRecord>,
    transactions: BTreeMap<(String, u64), TransactionRecord>,
    checkpoint: Option<CheckpointRow>,
}

impl Tables {
    fn apply(&mut self, writes: &WriteSet) {
        for pool in &writes.pools {
            let mut row = pool.clone();
            if let Some(existing) = self.pools.get(&pool.address) {
                // created_tx is only known from the PoolCreated log
                if row.created_tx.is_none() {
                    row.created_tx = existing.created_tx.clone();
                }
            }
            self.pools.insert(row.address.clone(), row);
        }
        for member in &writes.members {
            self.members.insert(
                (member.pool_address.clone(), member.address.clone()),
                member.clone(),
            );
        }
        for request in &writes.requests {
            self.requests.insert(
                (request.pool_address.clone(), request.onchain_id),
                request.clone(),
            );
        }
        for vote in &writes.votes {
            self.votes.insert(
                (
                    vote.pool_address.clone(),
                    vote.request_onchain_id,
                    vote.voter_address.clone(),
                ),
                vote.clone(),
            );
        }
        for tx in &writes.transactions {
            self.transactions
                .entry((tx.tx_hash.clone(), tx.log_index))
                .or_insert_with(|| tx.clone());
        }
    }
}

/// In-memory [`Datastore`]. A commit either lands entirely or, when write
/// failures are injected with [`MemoryDatastore::set_fail_writes`], not at all.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_checkpoint: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `commit`/`save_checkpoint` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes only `save_checkpoint` fail: rows land, progress does not.
    pub fn set_fail_checkpoint(&self, fail: bool) {
        self.fail_checkpoint.store(fail, Ordering::SeqCst);
    }

    pub fn pools(&self) -> Vec<PoolRecord> {
        self.lock().map(|t| t.pools.values().cloned().collect()).unwrap_or_default()
    }

    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.lock()
            .map(|t| t.transactions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, IndexerError> {
        self.tables
            .lock()
            .map_err(|_| IndexerError::Datastore("memory datastore lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<(), IndexerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexerError::Datastore(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn commit(&self, writes: &WriteSet) -> Result<(), IndexerError> {
        self.check_writable()?;
        self.lock()?.apply(writes);
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<CheckpointRow>, IndexerError> {
        Ok(self.lock()?.checkpoint.clone())
    }

    async fn save_checkpoint(
        &self,
        last_block: u64,
        known_pools: &[String],
    ) -> Result<(), IndexerError> {
        self.check_writable()?;
        if self.fail_checkpoint.load(Ordering::SeqCst) {
            return Err(IndexerError::Datastore(
                "injected checkpoint failure".to_string(),
            ));
        }
        let mut tables = self.lock()?;
        let last_block = tables
            .checkpoint
            .as_ref()
            .map_or(last_block, |cp| cp.last_block.max(last_block));
        tables.checkpoint = Some(CheckpointRow {
            last_block,
            known_pools: known_pools.to_vec(),
            updated_at: Some(Utc::now()),
        });
        Ok(())
    }

    async fn pool(&self, address: &str) -> Result<Option<PoolRecord>, IndexerError> {
        Ok(self.lock()?.pools.get(address).cloned())
    }

    async fn member(
        &self,
        pool: &str,
        address: &str,
    ) -> Result<Option<MemberRecord>, IndexerError> {
        Ok(self
            .lock()?
            .members
            .get(&(pool.to_string(), address.to_string()))
            .cloned())
    }

    async fn request(
        &self,
        pool: &str,
        onchain_id: u64,
    ) -> Result<Option<FundingRequestRecord>, IndexerError> {
        Ok(self
            .lock()?
            .requests
            .get(&(pool.to_string(), onchain_id))
            .cloned())
    }

    async fn votes_for(
        &self,
        pool: &str,
        onchain_id: u64,
    ) -> Result<Vec<VoteRecord>, IndexerError> {
        Ok(self
            .lock()?
            .votes
            .values()
            .filter(|v| v.pool_address == pool && v.request_onchain_id == onchain_id)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<TableCounts, IndexerError> {
        let tables = self.lock()?;
        Ok(TableCounts {
            pools: tables.pools.len() as u64,
            members: tables.members.len() as u64,
            requests: tables.requests.len() as u64,
            votes: tables.votes.len() as u64,
            transactions: tables.transactions.len() as u64,
        })
    }
}
