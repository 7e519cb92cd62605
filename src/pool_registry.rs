//! In-memory set of pool contracts being tracked, in discovery order.

use crate::chain_reader::ChainReader;
use crate::error::IndexerError;
use ethers::types::Address;
use indexmap::IndexSet;
use log::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolRegistry {
    pools: IndexSet<Address>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addresses(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            pools: addresses.into_iter().collect(),
        }
    }

    /// Unions the factory's `getAllPools()` into the set and returns the pools
    /// that were not known before.
    pub async fn bootstrap<C: ChainReader + ?Sized>(
        &mut self,
        chain: &C,
        factory: Address,
    ) -> Result<Vec<Address>, IndexerError> {
        let listed = chain.all_pools(factory).await?;
        let added: Vec<Address> = listed.into_iter().filter(|pool| self.add(*pool)).collect();
        info!(
            "Factory bootstrap: {} pools known ({} new)",
            self.pools.len(),
            added.len()
        );
        Ok(added)
    }

    /// Returns `true` when `pool` was not tracked yet.
    pub fn add(&mut self, pool: Address) -> bool {
        self.pools.insert(pool)
    }

    pub fn contains(&self, pool: &Address) -> bool {
        self.pools.contains(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.pools.iter().copied()
    }
}
