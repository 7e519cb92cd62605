#![allow(dead_code)]

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use pool_indexer::chain_reader::{
    ChainReader, MemberInfo, OnchainRequest, PoolConfig, RawLog, TokenMetadata,
};
use pool_indexer::contracts::FundingRequest;
use pool_indexer::error::IndexerError;
use pool_indexer::events::EventKind;
use pool_indexer::indexer::IndexerConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn usdc(units: u64) -> U256 {
    U256::from(units) * U256::exp10(6)
}

pub fn ether(units: u64) -> U256 {
    U256::from(units) * U256::exp10(18)
}

pub const FACTORY: u64 = 0xfac7;
pub const POOL: u64 = 0x9001;
pub const ADMIN: u64 = 0xad;
pub const USDC: u64 = 0x05dc;
pub const SHARES: u64 = 0x5a5e;
pub const ALICE: u64 = 0xa11ce;
pub const BOB: u64 = 0xb0b;

#[derive(Debug, Clone)]
pub struct PoolState {
    pub config: PoolConfig,
    pub admin: Address,
    pub total_deposited: U256,
    pub share_token: Address,
}

#[derive(Debug, Default)]
pub struct ChainState {
    pub head: u64,
    pub factory_pools: Vec<Address>,
    pub logs: Vec<RawLog>,
    pub pools: HashMap<Address, PoolState>,
    pub members: HashMap<(Address, Address), MemberInfo>,
    pub balances: HashMap<(Address, Address), U256>,
    pub requests: HashMap<(Address, U256), OnchainRequest>,
    pub tokens: HashMap<Address, TokenMetadata>,
    /// Methods that fail with an RPC error until removed.
    pub failing: HashSet<&'static str>,
    /// `(addresses, from, to)` of every `get_logs` call.
    pub log_queries: Vec<(Vec<Address>, u64, u64)>,
}

/// Scripted chain: state and logs are set by the test, reads answer from it.
#[derive(Debug, Default)]
pub struct MockChain {
    pub state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.with(|s| s.head = head);
        chain
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_head(&self, head: u64) {
        self.with(|s| s.head = head);
    }

    pub fn fail(&self, method: &'static str) {
        self.with(|s| {
            s.failing.insert(method);
        });
    }

    pub fn heal(&self, method: &'static str) {
        self.with(|s| {
            s.failing.remove(method);
        });
    }

    pub fn push_log(&self, log: RawLog) {
        self.with(|s| s.logs.push(log));
    }

    pub fn log_queries(&self) -> Vec<(Vec<Address>, u64, u64)> {
        self.with(|s| s.log_queries.clone())
    }

    /// Pool with a 6-decimals USDC deposit token and quorum 5000 bps.
    pub fn deploy_pool(&self, pool: Address, name: &str) {
        self.with(|s| {
            s.pools.insert(
                pool,
                PoolState {
                    config: PoolConfig {
                        name: name.to_string(),
                        deposit_token: addr(USDC),
                        min_deposit: usdc(10),
                        voting_period: U256::from(86_400u64),
                        quorum_bps: U256::from(5000u64),
                        approval_threshold_bps: U256::from(6000u64),
                        guardian_threshold_bps: U256::from(1000u64),
                    },
                    admin: addr(ADMIN),
                    total_deposited: U256::zero(),
                    share_token: addr(SHARES),
                },
            );
            s.tokens.insert(
                addr(USDC),
                TokenMetadata {
                    symbol: "USDC".to_string(),
                    decimals: 6,
                },
            );
        });
    }

    pub fn set_total_deposited(&self, pool: Address, total: U256) {
        self.with(|s| {
            if let Some(p) = s.pools.get_mut(&pool) {
                p.total_deposited = total;
            }
        });
    }

    pub fn set_member(&self, pool: Address, member: Address, info: MemberInfo, shares: U256) {
        self.with(|s| {
            let share_token = s.pools.get(&pool).map(|p| p.share_token).unwrap_or(addr(SHARES));
            s.members.insert((pool, member), info);
            s.balances.insert((share_token, member), shares);
        });
    }

    pub fn set_request(&self, pool: Address, request: OnchainRequest) {
        self.with(|s| {
            s.requests.insert((pool, request.id), request);
        });
    }

    fn check(&self, method: &'static str) -> Result<(), IndexerError> {
        if self.with(|s| s.failing.contains(method)) {
            return Err(IndexerError::Rpc {
                method,
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

fn revert(method: &'static str) -> IndexerError {
    IndexerError::Rpc {
        method,
        message: "execution reverted".to_string(),
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        self.check("eth_blockNumber")?;
        Ok(self.with(|s| s.head))
    }

    async fn all_pools(&self, factory: Address) -> Result<Vec<Address>, IndexerError> {
        self.check("getAllPools")?;
        if factory != addr(FACTORY) {
            return Err(revert("getAllPools"));
        }
        Ok(self.with(|s| s.factory_pools.clone()))
    }

    async fn pool_config(&self, pool: Address) -> Result<PoolConfig, IndexerError> {
        self.check("config")?;
        self.with(|s| s.pools.get(&pool).map(|p| p.config.clone()))
            .ok_or_else(|| revert("config"))
    }

    async fn pool_admin(&self, pool: Address) -> Result<Address, IndexerError> {
        self.check("admin")?;
        self.with(|s| s.pools.get(&pool).map(|p| p.admin))
            .ok_or_else(|| revert("admin"))
    }

    async fn total_deposited(&self, pool: Address) -> Result<U256, IndexerError> {
        self.check("totalDeposited")?;
        self.with(|s| s.pools.get(&pool).map(|p| p.total_deposited))
            .ok_or_else(|| revert("totalDeposited"))
    }

    async fn share_token(&self, pool: Address) -> Result<Address, IndexerError> {
        self.check("shareToken")?;
        self.with(|s| s.pools.get(&pool).map(|p| p.share_token))
            .ok_or_else(|| revert("shareToken"))
    }

    async fn member(&self, pool: Address, member: Address) -> Result<MemberInfo, IndexerError> {
        self.check("members")?;
        Ok(self.with(|s| s.members.get(&(pool, member)).copied().unwrap_or_default()))
    }

    async fn request(
        &self,
        pool: Address,
        request_id: U256,
    ) -> Result<OnchainRequest, IndexerError> {
        self.check("getRequest")?;
        self.with(|s| s.requests.get(&(pool, request_id)).cloned())
            .ok_or_else(|| revert("getRequest"))
    }

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata, IndexerError> {
        self.check("symbol")?;
        self.with(|s| s.tokens.get(&token).cloned())
            .ok_or_else(|| revert("symbol"))
    }

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, IndexerError> {
        self.check("balanceOf")?;
        Ok(self.with(|s| s.balances.get(&(token, holder)).copied().unwrap_or_default()))
    }

    async fn get_logs(
        &self,
        addresses: &[Address],
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        self.with(|s| s.log_queries.push((addresses.to_vec(), from, to)));
        self.check("eth_getLogs")?;
        Ok(self.with(|s| {
            s.logs
                .iter()
                .filter(|log| addresses.contains(&log.address))
                .filter(|log| log.topics.first().is_some_and(|t| topics.contains(t)))
                .filter(|log| log.block_number >= from && log.block_number <= to)
                .cloned()
                .collect()
        }))
    }
}

pub fn test_config(start_block: u64) -> IndexerConfig {
    IndexerConfig {
        factory: addr(FACTORY),
        chain_id: 84532,
        start_block,
        batch_size: 1000,
        confirmations: 0,
        poll_interval: Duration::from_millis(10),
        log_concurrency: 4,
    }
}

fn address_topic(a: Address) -> H256 {
    H256::from(a)
}

fn uint_topic(v: u64) -> H256 {
    let mut buf = [0u8; 32];
    U256::from(v).to_big_endian(&mut buf);
    H256::from(buf)
}

fn tx_hash(block: u64, log_index: u64) -> H256 {
    H256::from_low_u64_be(block * 1_000 + log_index)
}

fn log(
    emitter: Address,
    topics: Vec<H256>,
    data: Vec<u8>,
    block: u64,
    log_index: u64,
) -> RawLog {
    RawLog {
        address: emitter,
        topics,
        data: Bytes::from(data),
        block_number: block,
        tx_hash: tx_hash(block, log_index),
        log_index,
    }
}

pub fn pool_created_log(pool: Address, name: &str, block: u64, log_index: u64) -> RawLog {
    log(
        addr(FACTORY),
        vec![
            EventKind::PoolCreated.topic(),
            address_topic(pool),
            address_topic(addr(ADMIN)),
        ],
        encode(&[Token::String(name.to_string())]),
        block,
        log_index,
    )
}

pub fn deposited_log(
    pool: Address,
    member: Address,
    amount: U256,
    shares: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![EventKind::Deposited.topic(), address_topic(member)],
        encode(&[Token::Uint(amount), Token::Uint(shares)]),
        block,
        log_index,
    )
}

pub fn withdrawn_log(
    pool: Address,
    member: Address,
    amount: U256,
    shares: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![EventKind::Withdrawn.topic(), address_topic(member)],
        encode(&[Token::Uint(amount), Token::Uint(shares)]),
        block,
        log_index,
    )
}

pub fn request_created_log(
    pool: Address,
    request_id: u64,
    requester: Address,
    amount: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![
            EventKind::RequestCreated.topic(),
            uint_topic(request_id),
            address_topic(requester),
        ],
        encode(&[Token::Uint(amount), Token::Uint(U256::zero())]),
        block,
        log_index,
    )
}

pub fn vote_cast_log(
    pool: Address,
    request_id: u64,
    voter: Address,
    support: bool,
    weight: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![
            EventKind::VoteCast.topic(),
            uint_topic(request_id),
            address_topic(voter),
        ],
        encode(&[Token::Bool(support), Token::Uint(weight)]),
        block,
        log_index,
    )
}

pub fn request_funded_log(
    pool: Address,
    request_id: u64,
    requester: Address,
    amount: U256,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![
            EventKind::RequestFunded.topic(),
            uint_topic(request_id),
            address_topic(requester),
        ],
        encode(&[Token::Uint(amount)]),
        block,
        log_index,
    )
}

pub fn funding_request(id: u64, requester: Address, amount: U256, status: u8) -> FundingRequest {
    FundingRequest {
        id: U256::from(id),
        requester,
        title: "Community garden".to_string(),
        description_uri: "ipfs://bafy-garden".to_string(),
        amount,
        request_type: 0,
        reward_bps: U256::zero(),
        duration: U256::from(30 * 86_400u64),
        collateral_amount: U256::zero(),
        collateral_token: Address::zero(),
        status,
        voting_ends_at: U256::from(1_700_086_400u64),
        yes_votes: U256::zero(),
        no_votes: U256::zero(),
        funded_at: U256::zero(),
        repaid_amount: U256::zero(),
    }
}

pub fn member_whitelisted_log(pool: Address, member: Address, block: u64, log_index: u64) -> RawLog {
    log(
        pool,
        vec![EventKind::MemberWhitelisted.topic(), address_topic(member)],
        Vec::new(),
        block,
        log_index,
    )
}

pub fn guardian_added_log(pool: Address, guardian: Address, block: u64, log_index: u64) -> RawLog {
    log(
        pool,
        vec![EventKind::GuardianAdded.topic(), address_topic(guardian)],
        Vec::new(),
        block,
        log_index,
    )
}

/// `RequestApproved` or `RequestRejected`: only the request id is carried.
pub fn request_decision_log(
    pool: Address,
    kind: EventKind,
    request_id: u64,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![kind.topic(), uint_topic(request_id)],
        Vec::new(),
        block,
        log_index,
    )
}

pub fn guardian_approval_log(
    pool: Address,
    request_id: u64,
    guardian: Address,
    block: u64,
    log_index: u64,
) -> RawLog {
    log(
        pool,
        vec![
            EventKind::GuardianApproval.topic(),
            uint_topic(request_id),
            address_topic(guardian),
        ],
        Vec::new(),
        block,
        log_index,
    )
}
