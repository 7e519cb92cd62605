//! Resumable progress: the last block whose writes are fully committed plus the
//! pool set known at that point.

use crate::datastore::Datastore;
use crate::error::IndexerError;
use crate::pool_registry::PoolRegistry;
use crate::types::{address_to_string, string_to_address};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use log::{debug, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_block: u64,
    pub known_pools: Vec<Address>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reads and writes the singleton checkpoint row of a [`Datastore`].
pub struct CheckpointStore<D: ?Sized> {
    store: Arc<D>,
    start_block: u64,
}

impl<D: Datastore + ?Sized> CheckpointStore<D> {
    /// `start_block` is the cursor used before anything was ever saved; the
    /// first tick scans from `start_block + 1`.
    pub fn new(store: Arc<D>, start_block: u64) -> Self {
        Self { store, start_block }
    }

    pub async fn load(&self) -> Result<Checkpoint, IndexerError> {
        let Some(row) = self.store.load_checkpoint().await? else {
            debug!("No checkpoint stored, starting at block {}", self.start_block);
            return Ok(Checkpoint {
                last_block: self.start_block,
                known_pools: Vec::new(),
                updated_at: None,
            });
        };

        let mut known_pools = Vec::with_capacity(row.known_pools.len());
        for raw in &row.known_pools {
            match string_to_address(raw) {
                Ok(addr) => known_pools.push(addr),
                // the factory bootstrap re-adds anything dropped here
                Err(e) => warn!("Ignoring unparsable pool {:?} in checkpoint: {}", raw, e),
            }
        }

        Ok(Checkpoint {
            last_block: row.last_block,
            known_pools,
            updated_at: row.updated_at,
        })
    }

    /// Persists `last_block` and the registry contents. Call only once every
    /// write for the range ending at `last_block` is committed.
    pub async fn save(&self, last_block: u64, registry: &PoolRegistry) -> Result<(), IndexerError> {
        let pools: Vec<String> = registry.addresses().map(address_to_string).collect();
        self.store.save_checkpoint(last_block, &pools).await
    }
}
