use crate::error::IndexerError;
use crate::indexer::IndexerConfig;
use crate::types::string_to_address;
use config::{Config, ConfigError, Environment, File};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_POOL_FACTORY: &str = "0x3A15E25Fed95d1092F593aD72B395835edec8ce6";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Rpc {
    pub url: String,
    /// Per-call timeout.
    pub timeout_ms: u64,
    /// Global requests per second; 0 disables the limiter.
    pub qps_limit: u32,
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            url: "https://sepolia.base.org".to_string(),
            timeout_ms: 10_000,
            qps_limit: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Contracts {
    pub pool_factory: String,
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            pool_factory: DEFAULT_POOL_FACTORY.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_log_concurrency")]
    pub log_concurrency: usize,
}

fn default_chain_id() -> u64 {
    84532 // Base Sepolia
}
fn default_polling_interval_ms() -> u64 {
    5_000
}
fn default_batch_size() -> u64 {
    1_000
}
fn default_log_concurrency() -> usize {
    8
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            polling_interval_ms: default_polling_interval_ms(),
            batch_size: default_batch_size(),
            start_block: 0,
            confirmations: 0,
            log_concurrency: default_log_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_max_connections() -> u32 {
    5
}
fn default_connect_attempts() -> u32 {
    10
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Trigger {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trigger_bind")]
    pub bind: String,
    /// Bearer secret for `/api/indexer`. Empty or unset leaves it open.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_trigger_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_trigger_bind(),
            secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    /// env_logger filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON lines through tracing-subscriber (observability builds only).
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Metrics {
    /// Prometheus listener, e.g. `0.0.0.0:9100`. Unset disables the exporter.
    #[serde(default)]
    pub bind: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Settings {
    /// `Config.toml` (optional), then `INDEXER_<SECTION>__<KEY>` variables,
    /// then the plain deployment variables (`RPC_URL`, `DATABASE_URL`, ...).
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(File::with_name("Config").required(false))
    }

    pub fn load<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("INDEXER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides(|key| env::var(key).ok());
        Ok(settings)
    }

    /// Variables used by earlier deployments of the indexer. Unparsable
    /// numbers are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = get("RPC_URL") {
            self.rpc.url = url;
        }
        if let Some(factory) = get("POOL_FACTORY") {
            self.contracts.pool_factory = factory;
        }
        if let Some(url) = get("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(secret) = get("CRON_SECRET") {
            self.trigger.secret = Some(secret);
        }
        if let Some(raw) = get("START_BLOCK") {
            match raw.parse() {
                Ok(block) => self.indexer.start_block = block,
                Err(_) => log::warn!("Ignoring invalid START_BLOCK={:?}", raw),
            }
        }
        if let Some(raw) = get("CHAIN_ID") {
            match raw.parse() {
                Ok(id) => self.indexer.chain_id = id,
                Err(_) => log::warn!("Ignoring invalid CHAIN_ID={:?}", raw),
            }
        }
    }

    /// Fatal configuration problems, reported before anything starts.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.database.url.trim().is_empty() {
            return Err(IndexerError::Config(
                "DATABASE_URL (database.url) is required".to_string(),
            ));
        }
        if self.rpc.url.trim().is_empty() {
            return Err(IndexerError::Config(
                "RPC_URL (rpc.url) is required".to_string(),
            ));
        }
        self.factory_address()?;
        if self.indexer.batch_size == 0 {
            return Err(IndexerError::Config(
                "indexer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.trigger.enabled {
            self.trigger_bind()?;
        }
        Ok(())
    }

    pub fn factory_address(&self) -> Result<Address, IndexerError> {
        string_to_address(&self.contracts.pool_factory).map_err(|e| {
            IndexerError::Config(format!(
                "invalid pool factory address {:?}: {}",
                self.contracts.pool_factory, e
            ))
        })
    }

    pub fn trigger_bind(&self) -> Result<SocketAddr, IndexerError> {
        self.trigger.bind.parse().map_err(|e| {
            IndexerError::Config(format!("invalid trigger.bind {:?}: {}", self.trigger.bind, e))
        })
    }

    /// Secret required by the trigger route, if any.
    pub fn trigger_secret(&self) -> Option<String> {
        self.trigger
            .secret
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms.max(1))
    }

    pub fn indexer_config(&self) -> Result<IndexerConfig, IndexerError> {
        Ok(IndexerConfig {
            factory: self.factory_address()?,
            chain_id: self.indexer.chain_id,
            start_block: self.indexer.start_block,
            batch_size: self.indexer.batch_size.max(1),
            confirmations: self.indexer.confirmations,
            poll_interval: Duration::from_millis(self.indexer.polling_interval_ms),
            log_concurrency: self.indexer.log_concurrency.max(1),
        })
    }
}
