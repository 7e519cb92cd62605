//! # Pool Events
//!
//! Typed view of the factory and pool logs the indexer tracks.
//!
//! Only the **indexed** arguments (pool, member, request id) are extracted when a
//! log is scanned. Amounts are re-read from contract state during
//! reconciliation; the two exceptions that must come from the payload are
//! vote support/weight and the audit amount of a transfer, which are decoded
//! on demand with [`decode_vote`] and [`decode_amount`].

use crate::chain_reader::RawLog;
use crate::error::IndexerError;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// Event kinds emitted by the factory and the pool contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PoolCreated,
    Deposited,
    Withdrawn,
    MemberWhitelisted,
    GuardianAdded,
    RequestCreated,
    VoteCast,
    RequestApproved,
    RequestRejected,
    RequestFunded,
    GuardianApproval,
}

impl EventKind {
    /// Every kind emitted by a pool contract (everything but `PoolCreated`).
    pub const POOL_EVENTS: [EventKind; 10] = [
        EventKind::Deposited,
        EventKind::Withdrawn,
        EventKind::MemberWhitelisted,
        EventKind::GuardianAdded,
        EventKind::RequestCreated,
        EventKind::VoteCast,
        EventKind::RequestApproved,
        EventKind::RequestRejected,
        EventKind::RequestFunded,
        EventKind::GuardianApproval,
    ];

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::PoolCreated => "PoolCreated(address,address,string)",
            EventKind::Deposited => "Deposited(address,uint256,uint256)",
            EventKind::Withdrawn => "Withdrawn(address,uint256,uint256)",
            EventKind::MemberWhitelisted => "MemberWhitelisted(address)",
            EventKind::GuardianAdded => "GuardianAdded(address)",
            EventKind::RequestCreated => "RequestCreated(uint256,address,uint256,uint8)",
            EventKind::VoteCast => "VoteCast(uint256,address,bool,uint256)",
            EventKind::RequestApproved => "RequestApproved(uint256)",
            EventKind::RequestRejected => "RequestRejected(uint256)",
            EventKind::RequestFunded => "RequestFunded(uint256,address,uint256)",
            EventKind::GuardianApproval => "GuardianApproval(uint256,address)",
        }
    }

    /// topic0 of the event (keccak256 of the canonical signature).
    pub fn topic(&self) -> H256 {
        H256::from(keccak256(self.signature().as_bytes()))
    }

    pub fn pool_topics() -> Vec<H256> {
        Self::POOL_EVENTS.iter().map(|kind| kind.topic()).collect()
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        std::iter::once(EventKind::PoolCreated)
            .chain(Self::POOL_EVENTS)
            .find(|kind| kind.topic() == *topic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PoolCreated => "PoolCreated",
            EventKind::Deposited => "Deposited",
            EventKind::Withdrawn => "Withdrawn",
            EventKind::MemberWhitelisted => "MemberWhitelisted",
            EventKind::GuardianAdded => "GuardianAdded",
            EventKind::RequestCreated => "RequestCreated",
            EventKind::VoteCast => "VoteCast",
            EventKind::RequestApproved => "RequestApproved",
            EventKind::RequestRejected => "RequestRejected",
            EventKind::RequestFunded => "RequestFunded",
            EventKind::GuardianApproval => "GuardianApproval",
        }
    }
}

/// Identifiers carried by the indexed topics of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    PoolCreated { pool: Address, admin: Address },
    Deposited { member: Address },
    Withdrawn { member: Address },
    MemberWhitelisted { member: Address },
    GuardianAdded { guardian: Address },
    RequestCreated { request_id: U256, requester: Address },
    VoteCast { request_id: U256, voter: Address },
    RequestApproved { request_id: U256 },
    RequestRejected { request_id: U256 },
    RequestFunded { request_id: U256, requester: Address },
    GuardianApproval { request_id: U256, guardian: Address },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PoolCreated { .. } => EventKind::PoolCreated,
            EventPayload::Deposited { .. } => EventKind::Deposited,
            EventPayload::Withdrawn { .. } => EventKind::Withdrawn,
            EventPayload::MemberWhitelisted { .. } => EventKind::MemberWhitelisted,
            EventPayload::GuardianAdded { .. } => EventKind::GuardianAdded,
            EventPayload::RequestCreated { .. } => EventKind::RequestCreated,
            EventPayload::VoteCast { .. } => EventKind::VoteCast,
            EventPayload::RequestApproved { .. } => EventKind::RequestApproved,
            EventPayload::RequestRejected { .. } => EventKind::RequestRejected,
            EventPayload::RequestFunded { .. } => EventKind::RequestFunded,
            EventPayload::GuardianApproval { .. } => EventKind::GuardianApproval,
        }
    }
}

/// A scanned log: where it came from plus its decoded identifiers. The raw
/// `data` is kept for the handlers that need payload values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    /// Contract that emitted the log (factory or pool).
    pub emitter: Address,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub payload: EventPayload,
    pub data: Bytes,
}

impl IndexedEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Ordering key inside a batch.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Decode a raw log. Returns `Ok(None)` for logs with an untracked topic0.
    pub fn from_log(log: &RawLog) -> Result<Option<Self>, IndexerError> {
        let Some(topic0) = log.topics.first() else {
            return Ok(None);
        };
        let Some(kind) = EventKind::from_topic(topic0) else {
            return Ok(None);
        };

        let payload = match kind {
            EventKind::PoolCreated => EventPayload::PoolCreated {
                pool: topic_address(log, 1)?,
                admin: topic_address(log, 2)?,
            },
            EventKind::Deposited => EventPayload::Deposited {
                member: topic_address(log, 1)?,
            },
            EventKind::Withdrawn => EventPayload::Withdrawn {
                member: topic_address(log, 1)?,
            },
            EventKind::MemberWhitelisted => EventPayload::MemberWhitelisted {
                member: topic_address(log, 1)?,
            },
            EventKind::GuardianAdded => EventPayload::GuardianAdded {
                guardian: topic_address(log, 1)?,
            },
            EventKind::RequestCreated => EventPayload::RequestCreated {
                request_id: topic_uint(log, 1)?,
                requester: topic_address(log, 2)?,
            },
            EventKind::VoteCast => EventPayload::VoteCast {
                request_id: topic_uint(log, 1)?,
                voter: topic_address(log, 2)?,
            },
            EventKind::RequestApproved => EventPayload::RequestApproved {
                request_id: topic_uint(log, 1)?,
            },
            EventKind::RequestRejected => EventPayload::RequestRejected {
                request_id: topic_uint(log, 1)?,
            },
            EventKind::RequestFunded => EventPayload::RequestFunded {
                request_id: topic_uint(log, 1)?,
                requester: topic_address(log, 2)?,
            },
            EventKind::GuardianApproval => EventPayload::GuardianApproval {
                request_id: topic_uint(log, 1)?,
                guardian: topic_address(log, 2)?,
            },
        };

        Ok(Some(IndexedEvent {
            emitter: log.address,
            block_number: log.block_number,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            payload,
            data: log.data.clone(),
        }))
    }
}

fn topic(log: &RawLog, index: usize) -> Result<&H256, IndexerError> {
    log.topics.get(index).ok_or_else(|| {
        IndexerError::Decode(format!(
            "log {:?}#{} has {} topics, expected at least {}",
            log.tx_hash,
            log.log_index,
            log.topics.len(),
            index + 1
        ))
    })
}

fn topic_address(log: &RawLog, index: usize) -> Result<Address, IndexerError> {
    Ok(Address::from_slice(&topic(log, index)?.as_bytes()[12..]))
}

fn topic_uint(log: &RawLog, index: usize) -> Result<U256, IndexerError> {
    Ok(U256::from_big_endian(topic(log, index)?.as_bytes()))
}

/// `VoteCast` data: `(bool support, uint256 weight)`.
pub fn decode_vote(data: &[u8]) -> Result<(bool, U256), IndexerError> {
    let tokens = ethers::abi::decode(&[ParamType::Bool, ParamType::Uint(256)], data)?;
    match tokens.as_slice() {
        [Token::Bool(support), Token::Uint(weight)] => Ok((*support, *weight)),
        other => Err(IndexerError::Decode(format!(
            "unexpected VoteCast payload: {:?}",
            other
        ))),
    }
}

/// First non-indexed `uint256` of the payload: `amount` for `Deposited`,
/// `Withdrawn` and `RequestFunded`.
pub fn decode_amount(data: &[u8]) -> Result<U256, IndexerError> {
    let tokens = ethers::abi::decode(&[ParamType::Uint(256)], data)?;
    match tokens.first() {
        Some(Token::Uint(amount)) => Ok(*amount),
        other => Err(IndexerError::Decode(format!(
            "unexpected amount payload: {:?}",
            other
        ))),
    }
}
