//! Rows the indexer writes. Each one is a complete materialized view of
//! on-chain state keyed by its natural key, never a delta.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `pools` row. Key: `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: String,
    pub name: String,
    pub deposit_token: String,
    pub deposit_token_symbol: String,
    pub deposit_token_decimals: u8,
    pub min_deposit: String,
    /// Seconds.
    pub voting_period: u64,
    pub quorum_bps: u32,
    pub approval_bps: u32,
    pub guardian_threshold_bps: u32,
    pub admin_address: String,
    pub share_token: String,
    pub total_deposited: String,
    pub chain_id: u64,
    pub is_active: bool,
    /// Only known when the row is built from the `PoolCreated` log; later
    /// overwrites leave the stored value untouched.
    pub created_tx: Option<String>,
}

/// `members` row. Key: `(pool_address, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub pool_address: String,
    pub address: String,
    pub is_guardian: bool,
    pub is_active: bool,
    pub shares: String,
    pub joined_at: Option<DateTime<Utc>>,
}

/// `requests` row. Key: `(pool_address, onchain_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequestRecord {
    pub pool_address: String,
    pub onchain_id: u64,
    pub requester_address: String,
    pub title: String,
    pub description_uri: String,
    /// Raw base units, as stored in the contract.
    pub amount: String,
    pub request_type: RequestType,
    pub reward_bps: u32,
    /// Seconds.
    pub duration: u64,
    pub collateral_token: String,
    pub collateral_amount: String,
    pub repaid_amount: String,
    pub status: RequestStatus,
    pub voting_ends_at: Option<DateTime<Utc>>,
    pub yes_votes: String,
    pub no_votes: String,
    pub funded_at: Option<DateTime<Utc>>,
}

/// `votes` row. Key: `(pool_address, request_onchain_id, voter_address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub pool_address: String,
    pub request_onchain_id: u64,
    pub voter_address: String,
    pub support: bool,
    pub weight: String,
    pub tx_hash: String,
}

/// `transactions` audit row. Key: `(tx_hash, log_index)`; insert-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub log_index: u64,
    pub pool_address: String,
    pub address: String,
    pub tx_type: TxKind,
    pub amount: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Grant,
    Loan,
    Investment,
}

impl RequestType {
    /// Contract enum ordinal. Unknown ordinals fall back to `Grant`.
    pub fn from_ordinal(value: u8) -> Self {
        match value {
            1 => RequestType::Loan,
            2 => RequestType::Investment,
            _ => RequestType::Grant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Grant => "GRANT",
            RequestType::Loan => "LOAN",
            RequestType::Investment => "INVESTMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRANT" => Some(RequestType::Grant),
            "LOAN" => Some(RequestType::Loan),
            "INVESTMENT" => Some(RequestType::Investment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Voting,
    Approved,
    Rejected,
    Funded,
    Completed,
    Defaulted,
    Cancelled,
}

impl RequestStatus {
    const ALL: [RequestStatus; 8] = [
        RequestStatus::Pending,
        RequestStatus::Voting,
        RequestStatus::Approved,
        RequestStatus::Rejected,
        RequestStatus::Funded,
        RequestStatus::Completed,
        RequestStatus::Defaulted,
        RequestStatus::Cancelled,
    ];

    /// Contract enum ordinal. Unknown ordinals fall back to `Pending`.
    pub fn from_ordinal(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(RequestStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Voting => "VOTING",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Funded => "FUNDED",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Defaulted => "DEFAULTED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKind {
    Deposit,
    Withdraw,
    Fund,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "DEPOSIT",
            TxKind::Withdraw => "WITHDRAW",
            TxKind::Fund => "FUND",
        }
    }
}
