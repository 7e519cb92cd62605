//! # Indexer Loop
//!
//! Drives the scanner and the reconciler over consecutive block ranges.
//!
//! ## Lifecycle
//!
//! `Bootstrapping` (load checkpoint, read the factory pool list) → `Syncing`
//! while behind head → `Idle` once caught up. A failed tick moves to
//! `FailedTick`; the checkpoint is left where it was and the next tick retries
//! the same range.
//!
//! ## Ordering
//!
//! Within a tick every event is committed before the checkpoint is saved, so a
//! crash at any point replays at most the current range. Replays are harmless
//! because every write is an upsert.

use crate::chain_reader::ChainReader;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::datastore::{Datastore, TableCounts};
use crate::error::IndexerError;
use crate::event_scanner::EventScanner;
use crate::pool_registry::PoolRegistry;
use crate::reconciler::StateReconciler;
use ethers::types::Address;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub factory: Address,
    pub chain_id: u64,
    /// Cursor used when no checkpoint exists yet.
    pub start_block: u64,
    /// Maximum number of blocks per tick.
    pub batch_size: u64,
    /// Blocks to stay behind head.
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Concurrent per-pool `eth_getLogs` calls.
    pub log_concurrency: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            factory: Address::zero(),
            chain_id: 84532,
            start_block: 0,
            batch_size: 1000,
            confirmations: 0,
            poll_interval: Duration::from_secs(5),
            log_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Bootstrapping,
    Syncing,
    Idle,
    FailedTick,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Syncing => write!(f, "syncing"),
            Self::Idle => write!(f, "idle"),
            Self::FailedTick => write!(f, "failed-tick"),
        }
    }
}

/// What a tick that processed a range did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub from: u64,
    pub to: u64,
    /// Head after subtracting confirmations.
    pub head: u64,
    pub events: usize,
    pub rows: usize,
    pub new_pools: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    /// Nothing to do: the cursor is at or past the confirmed head.
    Idle { last_block: u64, head: u64 },
    Advanced(TickReport),
}

impl TickOutcome {
    fn behind_head(&self) -> bool {
        matches!(self, TickOutcome::Advanced(report) if report.to < report.head)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub pools_found: usize,
    pub pools_indexed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub last_block: u64,
    pub known_pools: usize,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub counts: TableCounts,
}

pub struct Indexer<C: ?Sized, D: ?Sized> {
    chain: Arc<C>,
    store: Arc<D>,
    checkpoints: CheckpointStore<D>,
    scanner: EventScanner<C>,
    reconciler: StateReconciler<C, D>,
    registry: PoolRegistry,
    config: IndexerConfig,
    last_block: u64,
    state: IndexerState,
    started: bool,
}

/// An indexer shared between the polling loop and the operator trigger.
pub type SharedIndexer = Arc<Mutex<Indexer<dyn ChainReader, dyn Datastore>>>;

impl<C, D> Indexer<C, D>
where
    C: ChainReader + ?Sized,
    D: Datastore + ?Sized,
{
    pub fn new(chain: Arc<C>, store: Arc<D>, config: IndexerConfig) -> Self {
        Self {
            checkpoints: CheckpointStore::new(store.clone(), config.start_block),
            scanner: EventScanner::new(chain.clone(), config.factory, config.log_concurrency),
            reconciler: StateReconciler::new(chain.clone(), store.clone(), config.chain_id),
            registry: PoolRegistry::new(),
            last_block: config.start_block,
            state: IndexerState::Bootstrapping,
            started: false,
            chain,
            store,
            config,
        }
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Loads the checkpoint and merges in the factory's pool list. Pools that
    /// only the factory knew about get their row refreshed; a failure there is
    /// logged and left to later events or the operator refresh.
    pub async fn start(&mut self) -> Result<(), IndexerError> {
        self.state = IndexerState::Bootstrapping;
        let Checkpoint {
            last_block,
            known_pools,
            ..
        } = self.checkpoints.load().await?;

        let mut registry = PoolRegistry::from_addresses(known_pools);
        let added = registry.bootstrap(&*self.chain, self.config.factory).await?;
        for pool in added {
            if let Err(e) = self.reconciler.refresh_pool(pool).await {
                warn!("Bootstrap refresh of pool {:?} failed: {}", pool, e);
            }
        }

        self.registry = registry;
        self.last_block = last_block;
        self.started = true;
        crate::metrics::set_last_block(self.last_block);
        crate::metrics::set_known_pools(self.registry.len());
        info!(
            "Indexer started at block {} with {} pools (factory {:?})",
            self.last_block,
            self.registry.len(),
            self.config.factory
        );
        Ok(())
    }

    /// One pass over `(last_block, min(last_block + batch_size, head)]`.
    pub async fn tick(&mut self) -> Result<TickOutcome, IndexerError> {
        let started_at = Instant::now();
        match self.try_tick().await {
            Ok(outcome) => {
                match &outcome {
                    TickOutcome::Idle { .. } => {
                        self.state = IndexerState::Idle;
                        crate::metrics::increment_tick("idle");
                    }
                    TickOutcome::Advanced(report) => {
                        self.state = if outcome.behind_head() {
                            IndexerState::Syncing
                        } else {
                            IndexerState::Idle
                        };
                        crate::metrics::increment_tick("ok");
                        crate::metrics::record_tick_duration(started_at.elapsed());
                        info!(
                            "Indexed blocks {}..={} ({} events, {} rows, {} new pools) in {:?}",
                            report.from,
                            report.to,
                            report.events,
                            report.rows,
                            report.new_pools,
                            started_at.elapsed()
                        );
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.state = IndexerState::FailedTick;
                crate::metrics::increment_tick("failed");
                crate::metrics::increment_tick_error(e.kind());
                Err(e)
            }
        }
    }

    async fn try_tick(&mut self) -> Result<TickOutcome, IndexerError> {
        if !self.started {
            self.start().await?;
        }

        let chain_head = self.chain.block_number().await?;
        crate::metrics::set_chain_head(chain_head);
        let head = chain_head.saturating_sub(self.config.confirmations);
        if self.last_block >= head {
            debug!("Caught up at block {} (head {})", self.last_block, head);
            return Ok(TickOutcome::Idle {
                last_block: self.last_block,
                head,
            });
        }

        let from = self.last_block + 1;
        let to = self
            .last_block
            .saturating_add(self.config.batch_size.max(1))
            .min(head);

        let scan = self.scanner.scan(from, to, &mut self.registry).await?;
        debug!(
            "Blocks {}..={}: {} logs, {} tracked events",
            from,
            to,
            scan.logs_seen,
            scan.events.len()
        );
        let mut rows = 0;
        for event in &scan.events {
            rows += self.reconciler.apply(event).await?;
            crate::metrics::increment_events(event.kind().as_str(), 1);
        }

        self.checkpoints.save(to, &self.registry).await?;
        self.last_block = to;
        crate::metrics::set_last_block(to);
        crate::metrics::set_known_pools(self.registry.len());

        Ok(TickOutcome::Advanced(TickReport {
            from,
            to,
            head,
            events: scan.events.len(),
            rows,
            new_pools: scan.new_pools.len(),
        }))
    }

    pub async fn run_once(&mut self) -> Result<TickOutcome, IndexerError> {
        self.tick().await
    }

    /// Re-reads the factory pool list, then every known pool, and upserts the
    /// pool rows. Per-pool failures are logged and counted out of
    /// `pools_indexed`.
    pub async fn refresh_pools(&mut self) -> Result<RefreshReport, IndexerError> {
        if !self.started {
            self.start().await?;
        } else {
            self.registry
                .bootstrap(&*self.chain, self.config.factory)
                .await?;
        }
        let pools: Vec<Address> = self.registry.addresses().collect();
        let mut pools_indexed = 0;
        for pool in &pools {
            match self.reconciler.refresh_pool(*pool).await {
                Ok(_) => pools_indexed += 1,
                Err(e) => warn!("Refreshing pool {:?} failed: {}", pool, e),
            }
        }
        Ok(RefreshReport {
            pools_found: pools.len(),
            pools_indexed,
        })
    }

    /// Checkpoint and row counts, without touching the chain.
    pub async fn status(&self) -> Result<IndexerStatus, IndexerError> {
        let checkpoint = self.checkpoints.load().await?;
        Ok(IndexerStatus {
            last_block: checkpoint.last_block,
            known_pools: checkpoint.known_pools.len(),
            updated_at: checkpoint.updated_at,
            counts: self.store.counts().await?,
        })
    }

    /// Ticks until `shutdown` flips to `true`. Sleeps `poll_interval` between
    /// ticks unless the previous one left the cursor behind head.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let delay = self.step().await;
            if !pause(delay, &mut shutdown).await {
                break;
            }
        }
        info!("Indexer loop stopped at block {}", self.last_block);
    }

    /// One loop iteration: tick, log a failure, return the delay before the
    /// next one.
    async fn step(&mut self) -> Duration {
        match self.tick().await {
            Ok(outcome) if outcome.behind_head() => Duration::ZERO,
            Ok(_) => self.config.poll_interval,
            Err(e) => {
                if e.is_transient() {
                    warn!("Tick failed, retrying same range next tick: {}", e);
                } else {
                    error!("Tick failed, retrying same range next tick: {}", e);
                }
                self.config.poll_interval
            }
        }
    }
}

/// Sleeps for `delay`. Returns `false` when `shutdown` fired first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Polling loop for a [`SharedIndexer`]. The lock is held for one tick at a
/// time so the operator trigger can interleave.
pub async fn run_shared(indexer: SharedIndexer, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        let delay = indexer.lock().await.step().await;
        if !pause(delay, &mut shutdown).await {
            break;
        }
    }
    info!("Indexer loop stopped");
}
