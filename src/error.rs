//! Error taxonomy shared by the scanner, reconciler and datastore layers.
//!
//! Every variant except [`IndexerError::Config`] aborts the current tick and
//! leaves the checkpoint where it was; the next tick retries the same range.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// The RPC node returned an error (network, rate limit, revert...).
    #[error("rpc call {method} failed: {message}")]
    Rpc {
        method: &'static str,
        message: String,
    },

    /// The RPC call did not answer within the configured timeout.
    #[error("rpc call {method} timed out after {after:?}")]
    Timeout {
        method: &'static str,
        after: Duration,
    },

    /// A log or return value could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A datastore read or write failed. Writes are rolled back.
    #[error("datastore error: {0}")]
    Datastore(String),

    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Whether the failure is expected to clear up on its own (network, rate
    /// limits, lock contention). Only used for logs and metrics: every
    /// non-config error is retried by the next tick anyway.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::Rpc { .. } | IndexerError::Timeout { .. } | IndexerError::Datastore(_)
        )
    }

    /// Short label used for the `indexer_errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexerError::Rpc { .. } => "rpc",
            IndexerError::Timeout { .. } => "timeout",
            IndexerError::Decode(_) => "decode",
            IndexerError::Datastore(_) => "datastore",
            IndexerError::Config(_) => "config",
        }
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(e: sqlx::Error) -> Self {
        IndexerError::Datastore(e.to_string())
    }
}

impl From<ethers::abi::Error> for IndexerError {
    fn from(e: ethers::abi::Error) -> Self {
        IndexerError::Decode(e.to_string())
    }
}
