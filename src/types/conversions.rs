use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, H256, U256};
use std::str::FromStr;

// Token amounts as decimal strings, the way the API layer reads them ("1100", "0.5")
pub fn format_token_amount(value: U256, decimals: u8) -> String {
    match ethers::utils::format_units(value, decimals as u32) {
        Ok(formatted) => trim_fraction(formatted),
        // decimals > 77 cannot be represented; keep the raw integer
        Err(_) => value.to_string(),
    }
}

fn trim_fraction(formatted: String) -> String {
    if !formatted.contains('.') {
        return formatted;
    }
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

// Addresses are stored lowercase so lookups by the UI never depend on checksum casing
pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn hash_to_string(hash: H256) -> String {
    format!("{:?}", hash)
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

/// Saturating narrowing for on-chain counters (periods, bps, ids) that never
/// come close to `u64::MAX` in practice.
pub fn u256_to_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

pub fn u256_to_u32(value: U256) -> u32 {
    u256_to_u64(value).min(u32::MAX as u64) as u32
}

/// Unix seconds to UTC. Zero means "unset" on-chain and maps to `None`.
pub fn unix_to_datetime(seconds: U256) -> Option<DateTime<Utc>> {
    let secs = u256_to_u64(seconds);
    if secs == 0 || secs > i64::MAX as u64 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
