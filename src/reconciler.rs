//! # State Reconciler
//!
//! Turns an event into complete rows. An event is only a hint that something
//! changed: every row written here is rebuilt from a fresh read of contract
//! state, so applying the same event twice (or out of date) converges to the
//! current on-chain truth.
//!
//! | Event | Reads | Rows |
//! |-------|-------|------|
//! | `PoolCreated` | pool config, admin, totals, token metadata | pool (with `created_tx`) |
//! | `Deposited` / `Withdrawn` | pool, member, share balance | pool, member, transaction |
//! | `MemberWhitelisted` / `GuardianAdded` | pool, member, share balance | pool, member |
//! | `RequestCreated` / `RequestApproved` / `RequestRejected` / `GuardianApproval` | request | request |
//! | `VoteCast` | request | request, vote |
//! | `RequestFunded` | pool, request | pool, request, transaction |

use crate::chain_reader::{ChainReader, TokenMetadata};
use crate::datastore::{Datastore, WriteSet};
use crate::error::IndexerError;
use crate::events::{decode_amount, decode_vote, EventPayload, IndexedEvent};
use crate::types::conversions::{u256_to_u32, u256_to_u64};
use crate::types::{
    address_to_string, format_token_amount, hash_to_string, unix_to_datetime,
    FundingRequestRecord, MemberRecord, PoolRecord, RequestStatus, RequestType,
    TransactionRecord, TxKind, VoteRecord,
};
use ethers::types::{Address, H256, U256};
use log::{debug, info, warn};
use std::sync::Arc;

/// Decimals of every pool share token.
pub const SHARE_DECIMALS: u8 = 18;

/// Metadata used when the deposit token does not answer `symbol()`/`decimals()`.
pub const FALLBACK_TOKEN: (&str, u8) = ("UNKNOWN", 18);

/// A freshly read pool row plus the raw values other rows derive from.
#[derive(Debug, Clone)]
struct PoolSnapshot {
    record: PoolRecord,
    share_token: Address,
    decimals: u8,
}

pub struct StateReconciler<C: ?Sized, D: ?Sized> {
    chain: Arc<C>,
    store: Arc<D>,
    chain_id: u64,
}

impl<C, D> StateReconciler<C, D>
where
    C: ChainReader + ?Sized,
    D: Datastore + ?Sized,
{
    pub fn new(chain: Arc<C>, store: Arc<D>, chain_id: u64) -> Self {
        Self {
            chain,
            store,
            chain_id,
        }
    }

    /// Reads current state for `event` and commits the resulting rows as one
    /// transaction. Returns the number of rows written.
    pub async fn apply(&self, event: &IndexedEvent) -> Result<usize, IndexerError> {
        let writes = self.build(event).await?;
        self.store.commit(&writes).await?;
        debug!(
            "{} at {}:{} -> {} rows",
            event.kind().as_str(),
            event.block_number,
            event.log_index,
            writes.len()
        );
        Ok(writes.len())
    }

    /// The rows `event` produces, without writing them.
    pub async fn build(&self, event: &IndexedEvent) -> Result<WriteSet, IndexerError> {
        let mut writes = WriteSet::default();
        let emitter = event.emitter;

        match &event.payload {
            EventPayload::PoolCreated { pool, admin } => {
                let snapshot = self.fetch_pool(*pool, Some(event.tx_hash)).await?;
                info!(
                    "Pool indexed: {} ({:?}, admin {:?})",
                    snapshot.record.name, pool, admin
                );
                writes.pools.push(snapshot.record);
            }
            EventPayload::Deposited { member } | EventPayload::Withdrawn { member } => {
                let snapshot = self.fetch_pool(emitter, None).await?;
                let member_row = self.fetch_member(emitter, *member, snapshot.share_token).await?;
                let kind = if matches!(event.payload, EventPayload::Deposited { .. }) {
                    TxKind::Deposit
                } else {
                    TxKind::Withdraw
                };
                let amount = decode_amount(&event.data)?;
                writes.transactions.push(transaction(
                    event,
                    *member,
                    kind,
                    format_token_amount(amount, snapshot.decimals),
                ));
                writes.pools.push(snapshot.record);
                writes.members.push(member_row);
            }
            EventPayload::MemberWhitelisted { member }
            | EventPayload::GuardianAdded { guardian: member } => {
                let snapshot = self.fetch_pool(emitter, None).await?;
                let member_row = self.fetch_member(emitter, *member, snapshot.share_token).await?;
                writes.pools.push(snapshot.record);
                writes.members.push(member_row);
            }
            EventPayload::RequestCreated { request_id, .. }
            | EventPayload::RequestApproved { request_id }
            | EventPayload::RequestRejected { request_id }
            | EventPayload::GuardianApproval { request_id, .. } => {
                writes
                    .requests
                    .push(self.fetch_request(emitter, *request_id).await?);
            }
            EventPayload::VoteCast { request_id, voter } => {
                let request = self.fetch_request(emitter, *request_id).await?;
                let (support, weight) = decode_vote(&event.data)?;
                writes.votes.push(VoteRecord {
                    pool_address: address_to_string(emitter),
                    request_onchain_id: request.onchain_id,
                    voter_address: address_to_string(*voter),
                    support,
                    weight: weight.to_string(),
                    tx_hash: hash_to_string(event.tx_hash),
                });
                writes.requests.push(request);
            }
            EventPayload::RequestFunded {
                request_id,
                requester,
            } => {
                let snapshot = self.fetch_pool(emitter, None).await?;
                let request = self.fetch_request(emitter, *request_id).await?;
                let amount = decode_amount(&event.data)?;
                writes.transactions.push(transaction(
                    event,
                    *requester,
                    TxKind::Fund,
                    format_token_amount(amount, snapshot.decimals),
                ));
                writes.pools.push(snapshot.record);
                writes.requests.push(request);
            }
        }

        Ok(writes)
    }

    /// Re-reads `pool` and upserts its row. Used by the operator trigger.
    pub async fn refresh_pool(&self, pool: Address) -> Result<PoolRecord, IndexerError> {
        let snapshot = self.fetch_pool(pool, None).await?;
        let writes = WriteSet {
            pools: vec![snapshot.record.clone()],
            ..Default::default()
        };
        self.store.commit(&writes).await?;
        Ok(snapshot.record)
    }

    async fn fetch_pool(
        &self,
        pool: Address,
        created_tx: Option<H256>,
    ) -> Result<PoolSnapshot, IndexerError> {
        let chain = &self.chain;
        let (config, admin, total, share_token) = futures::try_join!(
            chain.pool_config(pool),
            chain.pool_admin(pool),
            chain.total_deposited(pool),
            chain.share_token(pool),
        )?;

        let token = match chain.token_metadata(config.deposit_token).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    "Token metadata for {:?} unavailable, using fallback: {}",
                    config.deposit_token, e
                );
                TokenMetadata {
                    symbol: FALLBACK_TOKEN.0.to_string(),
                    decimals: FALLBACK_TOKEN.1,
                }
            }
        };

        let record = PoolRecord {
            address: address_to_string(pool),
            name: config.name,
            deposit_token: address_to_string(config.deposit_token),
            deposit_token_symbol: token.symbol,
            deposit_token_decimals: token.decimals,
            min_deposit: format_token_amount(config.min_deposit, token.decimals),
            voting_period: u256_to_u64(config.voting_period),
            quorum_bps: u256_to_u32(config.quorum_bps),
            approval_bps: u256_to_u32(config.approval_threshold_bps),
            guardian_threshold_bps: u256_to_u32(config.guardian_threshold_bps),
            admin_address: address_to_string(admin),
            share_token: address_to_string(share_token),
            total_deposited: format_token_amount(total, token.decimals),
            chain_id: self.chain_id,
            is_active: true,
            created_tx: created_tx.map(hash_to_string),
        };

        Ok(PoolSnapshot {
            record,
            share_token,
            decimals: token.decimals,
        })
    }

    async fn fetch_member(
        &self,
        pool: Address,
        member: Address,
        share_token: Address,
    ) -> Result<MemberRecord, IndexerError> {
        let (info, shares) = futures::try_join!(
            self.chain.member(pool, member),
            self.chain.balance_of(share_token, member),
        )?;
        Ok(MemberRecord {
            pool_address: address_to_string(pool),
            address: address_to_string(member),
            is_guardian: info.is_guardian,
            is_active: info.is_active,
            shares: format_token_amount(shares, SHARE_DECIMALS),
            joined_at: if info.is_active {
                unix_to_datetime(info.joined_at)
            } else {
                None
            },
        })
    }

    async fn fetch_request(
        &self,
        pool: Address,
        request_id: U256,
    ) -> Result<FundingRequestRecord, IndexerError> {
        let request = self.chain.request(pool, request_id).await?;
        Ok(FundingRequestRecord {
            pool_address: address_to_string(pool),
            // keyed by the id the event referenced
            onchain_id: u256_to_u64(request_id),
            requester_address: address_to_string(request.requester),
            title: request.title,
            description_uri: request.description_uri,
            amount: request.amount.to_string(),
            request_type: RequestType::from_ordinal(request.request_type),
            reward_bps: u256_to_u32(request.reward_bps),
            duration: u256_to_u64(request.duration),
            collateral_token: address_to_string(request.collateral_token),
            collateral_amount: request.collateral_amount.to_string(),
            repaid_amount: request.repaid_amount.to_string(),
            status: RequestStatus::from_ordinal(request.status),
            voting_ends_at: unix_to_datetime(request.voting_ends_at),
            yes_votes: request.yes_votes.to_string(),
            no_votes: request.no_votes.to_string(),
            funded_at: unix_to_datetime(request.funded_at),
        })
    }
}

fn transaction(
    event: &IndexedEvent,
    account: Address,
    kind: TxKind,
    amount: String,
) -> TransactionRecord {
    TransactionRecord {
        tx_hash: hash_to_string(event.tx_hash),
        log_index: event.log_index,
        pool_address: address_to_string(event.emitter),
        address: address_to_string(account),
        tx_type: kind,
        amount,
        block_number: event.block_number,
    }
}
