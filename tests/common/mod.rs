//! Shared test helpers and utilities.
//!
//! Factory functions for stores, source logs and transfer events with
//! sensible defaults.

#![allow(dead_code)]

use alloy::primitives::{Address, B256, U256};
use tokenwatch_cli::config::{PipelineArgs, PipelineConfig};
use tokenwatch_data::fetcher::RetryPolicy;
use tokenwatch_data::source::{MockLogSource, TransferLog};
use tokenwatch_data::store::Store;
use tokenwatch_data::types::TransferEvent;

/// One unit of a 6-decimal token.
pub const UNIT: u64 = 1_000_000;

/// Creates an in-memory SQLite Store for integration tests.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Store {
    Store::new(":memory:").expect("in-memory store should always open")
}

/// Deterministic transaction hash for test number `n`.
pub fn tx_hash(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

/// Creates a source log for transaction `n` in `block_number` moving `value`
/// raw token units.
///
/// # Example
/// ```ignore
/// let log = sample_log(1, 100, 5 * UNIT);
/// assert_eq!(log.block_number, 100);
/// ```
pub fn sample_log(n: u64, block_number: u64, value: u64) -> TransferLog {
    TransferLog {
        tx_hash: tx_hash(n),
        log_index: 0,
        from: Address::with_last_byte(0xaa),
        to: Address::with_last_byte(0xbb),
        value: U256::from(value),
        block_number,
        block_timestamp: None,
    }
}

/// Creates a fetched transfer event, as the range fetcher would emit it.
pub fn sample_event(n: u64, block_number: u64, value: u64) -> TransferEvent {
    TransferEvent {
        tx_hash: format!("{}", tx_hash(n)),
        log_index: 0,
        from_address: format!("{:#x}", Address::with_last_byte(0xaa)),
        to_address: format!("{:#x}", Address::with_last_byte(0xbb)),
        raw_amount: U256::from(value),
        block_number,
        block_timestamp: MockLogSource::timestamp_of(block_number),
    }
}

/// A valid pipeline configuration with retries disabled.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineArgs {
        rpc_url: Some("http://localhost:8545".to_string()),
        ..PipelineArgs::default()
    }
    .into_config()
    .expect("default config should validate");
    config.retry = RetryPolicy::immediate(1);
    config
}
