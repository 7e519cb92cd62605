//! # Chain Reader
//!
//! Read-only view of the chain the indexer needs: head height, contract state
//! reads and historical log queries.
//!
//! [`EthersChainReader`] is the production implementation on top of an ethers
//! [`Middleware`]. Every call goes through [`EthersChainReader::guarded`], which
//! waits on the optional QPS limiter, applies the RPC timeout and maps failures
//! to [`IndexerError`].

use crate::contracts::{Erc20, FundingRequest, IPool, IPoolFactory};
use crate::error::IndexerError;
use async_trait::async_trait;
use ethers::abi::Tokenizable;
use ethers::prelude::*;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// `config()` of a pool contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub deposit_token: Address,
    pub min_deposit: U256,
    pub voting_period: U256,
    pub quorum_bps: U256,
    pub approval_threshold_bps: U256,
    pub guardian_threshold_bps: U256,
}

/// `members(address)` of a pool contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberInfo {
    pub is_active: bool,
    pub is_guardian: bool,
    pub joined_at: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub symbol: String,
    pub decimals: u8,
}

/// `getRequest(id)` of a pool contract.
pub type OnchainRequest = FundingRequest;

/// A log as returned by `eth_getLogs`, with the positional fields resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> Result<u64, IndexerError>;

    /// Factory `getAllPools()`.
    async fn all_pools(&self, factory: Address) -> Result<Vec<Address>, IndexerError>;

    async fn pool_config(&self, pool: Address) -> Result<PoolConfig, IndexerError>;
    async fn pool_admin(&self, pool: Address) -> Result<Address, IndexerError>;
    async fn total_deposited(&self, pool: Address) -> Result<U256, IndexerError>;
    async fn share_token(&self, pool: Address) -> Result<Address, IndexerError>;
    async fn member(&self, pool: Address, member: Address) -> Result<MemberInfo, IndexerError>;
    async fn request(&self, pool: Address, request_id: U256)
        -> Result<OnchainRequest, IndexerError>;

    /// ERC-20 `symbol()` and `decimals()`.
    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata, IndexerError>;
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, IndexerError>;

    /// Logs emitted by any of `addresses` whose topic0 is any of `topics`, in
    /// the inclusive block range `[from, to]`.
    async fn get_logs(
        &self,
        addresses: &[Address],
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

pub struct EthersChainReader<M> {
    client: Arc<M>,
    timeout: Duration,
    limiter: Option<Arc<DirectRateLimiter>>,
}

impl EthersChainReader<Provider<Http>> {
    /// HTTP provider for `url`. A `qps_limit` of 0 disables rate limiting.
    pub fn connect(url: &str, timeout: Duration, qps_limit: u32) -> Result<Self, IndexerError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| IndexerError::Config(format!("invalid RPC url {}: {}", url, e)))?;
        Ok(Self::new(Arc::new(provider), timeout).with_qps_limit(qps_limit))
    }
}

impl<M: Middleware + 'static> EthersChainReader<M> {
    pub fn new(client: Arc<M>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            limiter: None,
        }
    }

    pub fn with_qps_limit(mut self, qps_limit: u32) -> Self {
        self.limiter = NonZeroU32::new(qps_limit)
            .map(|qps| Arc::new(RateLimiter::direct(Quota::per_second(qps))));
        self
    }

    async fn guarded<T, E, F>(&self, method: &'static str, fut: F) -> Result<T, IndexerError>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        crate::metrics::increment_rpc_call(method);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IndexerError::Rpc {
                method,
                message: e.to_string(),
            }),
            Err(_) => Err(IndexerError::Timeout {
                method,
                after: self.timeout,
            }),
        }
    }

    fn pool(&self, pool: Address) -> IPool<M> {
        IPool::new(pool, self.client.clone())
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for EthersChainReader<M> {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        let head = self
            .guarded("eth_blockNumber", self.client.get_block_number())
            .await?;
        Ok(head.as_u64())
    }

    async fn all_pools(&self, factory: Address) -> Result<Vec<Address>, IndexerError> {
        let factory = IPoolFactory::new(factory, self.client.clone());
        let call = factory.get_all_pools();
        self.guarded("getAllPools", call.call()).await
    }

    async fn pool_config(&self, pool: Address) -> Result<PoolConfig, IndexerError> {
        let call = self.pool(pool).config();
        let (
            name,
            deposit_token,
            min_deposit,
            voting_period,
            quorum_bps,
            approval_threshold_bps,
            guardian_threshold_bps,
        ) = self.guarded("config", call.call()).await?;
        Ok(PoolConfig {
            name,
            deposit_token,
            min_deposit,
            voting_period,
            quorum_bps,
            approval_threshold_bps,
            guardian_threshold_bps,
        })
    }

    async fn pool_admin(&self, pool: Address) -> Result<Address, IndexerError> {
        let call = self.pool(pool).admin();
        self.guarded("admin", call.call()).await
    }

    async fn total_deposited(&self, pool: Address) -> Result<U256, IndexerError> {
        let call = self.pool(pool).total_deposited();
        self.guarded("totalDeposited", call.call()).await
    }

    async fn share_token(&self, pool: Address) -> Result<Address, IndexerError> {
        let call = self.pool(pool).share_token();
        self.guarded("shareToken", call.call()).await
    }

    async fn member(&self, pool: Address, member: Address) -> Result<MemberInfo, IndexerError> {
        let call = self.pool(pool).members(member);
        let (is_active, is_guardian, joined_at) = self.guarded("members", call.call()).await?;
        Ok(MemberInfo {
            is_active,
            is_guardian,
            joined_at,
        })
    }

    async fn request(
        &self,
        pool: Address,
        request_id: U256,
    ) -> Result<OnchainRequest, IndexerError> {
        let call = self.pool(pool).get_request(request_id);
        // the binding returns the struct as a tuple
        let raw = self.guarded("getRequest", call.call()).await?;
        FundingRequest::from_token(raw.into_token()).map_err(|e| {
            IndexerError::Decode(format!("getRequest({}) on {:?}: {}", request_id, pool, e))
        })
    }

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata, IndexerError> {
        let erc20 = Erc20::new(token, self.client.clone());
        let symbol_call = erc20.symbol();
        let decimals_call = erc20.decimals();
        let (symbol, decimals) = futures::try_join!(
            self.guarded("symbol", symbol_call.call()),
            self.guarded("decimals", decimals_call.call()),
        )?;
        Ok(TokenMetadata { symbol, decimals })
    }

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, IndexerError> {
        let call = Erc20::new(token, self.client.clone()).balance_of(holder);
        self.guarded("balanceOf", call.call()).await
    }

    async fn get_logs(
        &self,
        addresses: &[Address],
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        if addresses.is_empty() || topics.is_empty() || from > to {
            return Ok(Vec::new());
        }
        let filter = Filter::new()
            .address(ValueOrArray::Array(addresses.to_vec()))
            .topic0(ValueOrArray::Array(
                topics.iter().copied().map(Some).collect::<Vec<_>>(),
            ))
            .from_block(from)
            .to_block(to);

        let logs = self
            .guarded("eth_getLogs", self.client.get_logs(&filter))
            .await?;

        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            out.push(raw_log(log)?);
        }
        Ok(out)
    }
}

fn raw_log(log: Log) -> Result<RawLog, IndexerError> {
    let missing = |field: &str| {
        IndexerError::Decode(format!(
            "log from {:?} is missing {} (pending log?)",
            log.address, field
        ))
    };
    let block_number = log.block_number.ok_or_else(|| missing("block_number"))?;
    let tx_hash = log.transaction_hash.ok_or_else(|| missing("transaction_hash"))?;
    let log_index = log.log_index.ok_or_else(|| missing("log_index"))?;
    Ok(RawLog {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_number: block_number.as_u64(),
        tx_hash,
        log_index: crate::types::conversions::u256_to_u64(log_index),
    })
}
