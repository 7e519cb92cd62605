pub mod conversions;
pub mod records;

pub use conversions::{
    address_to_string, format_token_amount, hash_to_string, string_to_address, unix_to_datetime,
};
pub use records::{
    FundingRequestRecord, MemberRecord, PoolRecord, RequestStatus, RequestType,
    TransactionRecord, TxKind, VoteRecord,
};
