//! # Pool Indexer
//!
//! Chain-state indexer for pooled-funds contracts. It discovers every pool
//! deployed by a factory, follows their events, re-reads authoritative contract
//! state for each one and keeps a relational datastore in sync.
//!
//! ## Overview
//!
//! - **Resumable**: progress is a persisted checkpoint (last block plus the
//!   known pool set) saved only after a range is fully committed.
//! - **Open-ended discovery**: the factory's pool list seeds the registry at
//!   start; `PoolCreated` logs grow it within the same range.
//! - **Authoritative rows**: events are hints; rows are rebuilt from contract
//!   reads, never patched with deltas.
//! - **Idempotent**: every write is an upsert by natural key, so replays and
//!   overlapping runs converge.
//!
//! ## Architecture
//!
//! ### Chain access
//! [`chain_reader::ChainReader`] wraps the JSON-RPC node (ethers).
//!
//! ### Storage
//! [`datastore::Datastore`] is the persistence seam, implemented for Postgres in
//! [`database`] and in memory for tests.
//!
//! ### Pipeline
//! [`indexer::Indexer`] ticks over block ranges: [`event_scanner`] collects the
//! logs, [`reconciler`] turns them into rows, [`checkpoint`] records progress.

// Core Types
/// Rows and value conversions
pub mod types;
/// Error taxonomy
pub mod error;
/// Tracked contract events
pub mod events;

// Contracts (Public ABIs Only)
/// Factory, pool and ERC-20 bindings
pub mod contracts;

// Infrastructure
/// Read-only chain access
pub mod chain_reader;
/// Persistence trait and in-memory implementation
pub mod datastore;
/// PostgreSQL database integration
pub mod database;
/// Metrics and observability
pub mod metrics;

// Indexing Pipeline
/// Persisted progress cursor
pub mod checkpoint;
/// Known pool set
pub mod pool_registry;
/// Per-range log collection
pub mod event_scanner;
/// Event to row reconciliation
pub mod reconciler;
/// Tick loop
pub mod indexer;

// Operator Surface
/// HTTP trigger and health endpoints
pub mod trigger;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use chain_reader::{ChainReader, EthersChainReader};
pub use datastore::{Datastore, MemoryDatastore};
pub use error::IndexerError;
pub use indexer::{Indexer, IndexerConfig};
pub use settings::Settings;
