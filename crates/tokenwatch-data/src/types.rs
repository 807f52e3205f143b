//! Type definitions for token transfer data.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

/// A decoded `Transfer` log, as returned by the range fetcher.
///
/// Not persisted directly; the persister turns it into a [`NewTransaction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    /// Transaction hash that emitted the log (lowercase hex with 0x prefix).
    pub tx_hash: String,
    /// Log index within the block.
    pub log_index: u64,
    /// Sender address (hex text).
    pub from_address: String,
    /// Recipient address (hex text).
    pub to_address: String,
    /// Transferred value in the token's smallest unit.
    pub raw_amount: U256,
    /// Block number containing this log.
    pub block_number: u64,
    /// Block timestamp in unix seconds.
    pub block_timestamp: u64,
}

impl TransferEvent {
    /// Position of the event in chain history.
    pub fn chain_position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// A transaction staged for insertion, before the store assigns an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub tx_hash: String,
    pub log_index: u64,
    pub from_address: String,
    pub to_address: String,
    /// Raw integer amount as decimal text (exact).
    pub raw_amount: String,
    /// Amount scaled by the token's decimals.
    pub amount: f64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
    pub block_number: u64,
}

/// Persisted transfer record.
///
/// `is_anomaly` and `anomaly_score` are the only fields changed after
/// insertion, and only by the scorer. `anomaly_score` is `None` until the row
/// has been through a scoring pass; more negative means more anomalous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Surrogate key assigned by the store.
    pub id: i64,
    pub tx_hash: String,
    pub log_index: u64,
    pub from_address: String,
    pub to_address: String,
    pub raw_amount: String,
    pub amount: f64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
    pub block_number: u64,
    pub is_anomaly: bool,
    pub anomaly_score: Option<f64>,
}

/// Score assigned to one transaction by a scoring pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreUpdate {
    pub id: i64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

/// Aggregates over a trailing time window, read by the dashboard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub total_volume: f64,
    pub transaction_count: u64,
    pub anomaly_count: u64,
}

/// Scale a raw token amount down by `10^decimals`.
///
/// Integer and fractional parts are split in `U256` first so that large raw
/// values keep their low digits.
pub fn scale_amount(raw: U256, decimals: u8) -> f64 {
    let unit = U256::from(10u8).pow(U256::from(decimals));
    let whole = raw / unit;
    let frac = raw % unit;
    u256_to_f64(whole) + u256_to_f64(frac) / 10f64.powi(i32::from(decimals))
}

fn u256_to_f64(value: U256) -> f64 {
    match u128::try_from(value) {
        Ok(v) => v as f64,
        // Above u128 precision is already lost in f64; parse the decimal text.
        Err(_) => value.to_string().parse().unwrap_or(f64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_amount_six_decimals() {
        assert_eq!(scale_amount(U256::from(1_500_000u64), 6), 1.5);
        assert_eq!(scale_amount(U256::from(1u64), 6), 0.000001);
        assert_eq!(scale_amount(U256::ZERO, 6), 0.0);
    }

    #[test]
    fn scale_amount_zero_decimals_is_identity() {
        assert_eq!(scale_amount(U256::from(42u64), 0), 42.0);
    }

    #[test]
    fn scale_amount_handles_values_above_u128() {
        let raw = U256::from(u128::MAX) * U256::from(1_000u64);
        let scaled = scale_amount(raw, 18);
        assert!(scaled > 3.4e20 && scaled.is_finite());
    }

    #[test]
    fn chain_position_orders_by_block_then_log_index() {
        let a = TransferEvent {
            tx_hash: "0x01".into(),
            log_index: 7,
            from_address: "0xa".into(),
            to_address: "0xb".into(),
            raw_amount: U256::from(1u8),
            block_number: 100,
            block_timestamp: 0,
        };
        let mut b = a.clone();
        b.log_index = 2;
        b.block_number = 101;
        assert!(a.chain_position() < b.chain_position());
    }
}
