//! # Event Scanner
//!
//! Collects the tracked events of one block range. Factory `PoolCreated` logs
//! are read first so pools created inside the range are registered before
//! their own logs are queried.

use crate::chain_reader::{ChainReader, RawLog};
use crate::error::IndexerError;
use crate::events::{EventKind, EventPayload, IndexedEvent};
use crate::pool_registry::PoolRegistry;
use ethers::types::{Address, H256};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use std::sync::Arc;

/// Result of scanning `[from, to]`.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Factory events first, then pool events by (block, log index).
    pub events: Vec<IndexedEvent>,
    /// Pools first seen through a `PoolCreated` log in this range.
    pub new_pools: Vec<Address>,
    pub logs_seen: usize,
}

pub struct EventScanner<C: ?Sized> {
    chain: Arc<C>,
    factory: Address,
    concurrency: usize,
    pool_topics: Vec<H256>,
}

impl<C: ChainReader + ?Sized> EventScanner<C> {
    pub fn new(chain: Arc<C>, factory: Address, concurrency: usize) -> Self {
        Self {
            chain,
            factory,
            concurrency: concurrency.max(1),
            pool_topics: EventKind::pool_topics(),
        }
    }

    /// Scans `[from, to]`, growing `registry` with pools created in the range.
    /// Any RPC failure aborts the whole scan.
    pub async fn scan(
        &self,
        from: u64,
        to: u64,
        registry: &mut PoolRegistry,
    ) -> Result<ScanOutcome, IndexerError> {
        let mut outcome = ScanOutcome::default();
        if from > to {
            return Ok(outcome);
        }

        let factory_logs = self
            .chain
            .get_logs(&[self.factory], &[EventKind::PoolCreated.topic()], from, to)
            .await?;
        outcome.logs_seen += factory_logs.len();

        let mut factory_events = decode_all(&factory_logs, |addr| addr == self.factory)?;
        factory_events.sort_by_key(IndexedEvent::position);
        for event in &factory_events {
            if let EventPayload::PoolCreated { pool, .. } = event.payload {
                if registry.add(pool) {
                    debug!("Discovered pool {:?} at block {}", pool, event.block_number);
                    outcome.new_pools.push(pool);
                }
            }
        }

        let pools: Vec<Address> = registry.addresses().collect();
        let topics = &self.pool_topics;
        let results: Vec<Result<Vec<RawLog>, IndexerError>> = stream::iter(pools)
            .map(|pool| {
                let chain = self.chain.clone();
                async move { chain.get_logs(&[pool], topics, from, to).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut pool_logs = Vec::new();
        for result in results {
            pool_logs.extend(result?);
        }
        outcome.logs_seen += pool_logs.len();

        let mut pool_events = decode_all(&pool_logs, |addr| registry.contains(&addr))?;
        pool_events.retain(|event| event.kind() != EventKind::PoolCreated);
        pool_events.sort_by_key(IndexedEvent::position);

        outcome.events = factory_events;
        outcome.events.extend(pool_events);
        Ok(outcome)
    }
}

fn decode_all(
    logs: &[RawLog],
    expected_emitter: impl Fn(Address) -> bool,
) -> Result<Vec<IndexedEvent>, IndexerError> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        if !expected_emitter(log.address) {
            warn!(
                "Ignoring log from unexpected emitter {:?} (tx {:?})",
                log.address, log.tx_hash
            );
            continue;
        }
        if let Some(event) = IndexedEvent::from_log(log)? {
            events.push(event);
        }
    }
    Ok(events)
}
