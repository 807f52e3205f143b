//! Log source abstraction and the Alloy RPC implementation.
//!
//! The fetcher only depends on [`LogSource`]; [`RpcLogSource`] talks to an
//! Ethereum JSON-RPC endpoint and classifies provider failures into
//! [`SourceError`] so callers can tell "result set too large" apart from
//! ordinary connectivity problems.

use alloy::network::Ethereum;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::{BlockId, BlockNumberOrTag, Filter, Log};
use alloy::transports::TransportError;
use async_trait::async_trait;
use eyre::{Context, Result};
use std::sync::Arc;

/// Compile-time ABI for the ERC-20 `Transfer` event.
pub mod erc20 {
    use alloy::sol;

    sol! {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// Failures reported by a [`LogSource`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// The provider refused to return the result set for this range.
    #[error("provider result limit exceeded: {0}")]
    LimitExceeded(String),
    /// Connectivity or transport failure; worth retrying.
    #[error("network error: {0}")]
    Network(String),
    /// Any other JSON-RPC error response.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// A returned log could not be decoded as a transfer.
    #[error("malformed log: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether the whole call should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Network(_))
    }
}

/// One `eth_getLogs` query over a closed block interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogQuery {
    /// Token contract emitting the events.
    pub contract: Address,
    /// Event signature topic (topic0).
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

/// A transfer log as returned by the source, before timestamp resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferLog {
    pub tx_hash: B256,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    /// Some providers include the block timestamp on each log.
    pub block_timestamp: Option<u64>,
}

/// Read access to transfer logs and block metadata of one chain.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number known to the source.
    async fn current_head(&self) -> Result<u64, SourceError>;

    /// All logs matching `query`, or `LimitExceeded` if the provider refuses.
    async fn transfer_logs(&self, query: &LogQuery) -> Result<Vec<TransferLog>, SourceError>;

    /// Timestamp (unix seconds) of the given block.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError>;
}

#[async_trait]
impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    async fn current_head(&self) -> Result<u64, SourceError> {
        (**self).current_head().await
    }

    async fn transfer_logs(&self, query: &LogQuery) -> Result<Vec<TransferLog>, SourceError> {
        (**self).transfer_logs(query).await
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        (**self).block_timestamp(block_number).await
    }
}

/// JSON-RPC error code most providers use for oversized log queries.
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Message fragments providers use when a log query is too large.
const LIMIT_MESSAGES: &[&str] = &[
    "query returned more than",
    "response size exceeded",
    "log response size",
    "block range",
    "limit exceeded",
    "too many results",
];

/// Message fragments providers use when throttling a client.
const RATE_LIMIT_MESSAGES: &[&str] = &["rate limit", "request count", "too many requests"];

/// Whether an error response means "slow down", not "ask for less".
///
/// Some providers reuse `-32005` for throttling, so this is checked before
/// [`is_limit_error`].
pub fn is_rate_limited(code: i64, message: &str) -> bool {
    if code == 429 {
        return true;
    }
    let message = message.to_ascii_lowercase();
    RATE_LIMIT_MESSAGES.iter().any(|fragment| message.contains(fragment))
}

/// Whether an error response means "split the range and try again".
pub fn is_limit_error(code: i64, message: &str) -> bool {
    if code == LIMIT_EXCEEDED_CODE {
        return true;
    }
    let message = message.to_ascii_lowercase();
    LIMIT_MESSAGES.iter().any(|fragment| message.contains(fragment))
}

fn classify(err: TransportError) -> SourceError {
    match err.as_error_resp() {
        Some(resp) if is_rate_limited(resp.code, &resp.message) => {
            SourceError::Network(resp.message.to_string())
        }
        Some(resp) if is_limit_error(resp.code, &resp.message) => {
            SourceError::LimitExceeded(resp.message.to_string())
        }
        Some(resp) => SourceError::Rpc {
            code: resp.code,
            message: resp.message.to_string(),
        },
        None => SourceError::Network(err.to_string()),
    }
}

/// Decode an RPC log into a [`TransferLog`].
pub fn decode_transfer_log(log: &Log) -> Result<TransferLog, SourceError> {
    let decoded = log
        .log_decode::<erc20::Transfer>()
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| SourceError::Decode("log without transaction hash".into()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| SourceError::Decode(format!("log {tx_hash} without block number")))?;
    let log_index = log
        .log_index
        .ok_or_else(|| SourceError::Decode(format!("log {tx_hash} without log index")))?;

    let event = decoded.inner.data;
    Ok(TransferLog {
        tx_hash,
        log_index,
        from: event.from,
        to: event.to,
        value: event.value,
        block_number,
        block_timestamp: log.block_timestamp,
    })
}

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// [`LogSource`] backed by an Alloy HTTP provider.
pub struct RpcLogSource {
    provider: Arc<ProviderType>,
}

impl RpcLogSource {
    /// Builds an HTTP provider for `rpc_url` without touching the network.
    ///
    /// # Errors
    /// Returns error if the URL is malformed.
    pub fn new(rpc_url: &str) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn current_head(&self) -> Result<u64, SourceError> {
        self.provider.get_block_number().await.map_err(classify)
    }

    #[tracing::instrument(skip_all, fields(from = query.from_block, to = query.to_block))]
    async fn transfer_logs(&self, query: &LogQuery) -> Result<Vec<TransferLog>, SourceError> {
        let filter = Filter::new()
            .address(query.contract)
            .event_signature(query.topic0)
            .from_block(query.from_block)
            .to_block(query.to_block);

        let logs = self.provider.get_logs(&filter).await.map_err(classify)?;
        tracing::debug!(logs = logs.len(), "eth_getLogs returned");

        let mut transfers = Vec::with_capacity(logs.len());
        for log in &logs {
            // Removed logs belong to a reorged-out block.
            if log.removed {
                continue;
            }
            transfers.push(decode_transfer_log(log)?);
        }
        Ok(transfers)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        let block = self
            .provider
            .get_block(BlockId::Number(BlockNumberOrTag::Number(block_number)))
            .await
            .map_err(classify)?;

        block
            .map(|b| b.header.timestamp)
            .ok_or_else(|| SourceError::Rpc {
                code: 0,
                message: format!("block {block_number} not found"),
            })
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockLogSource;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted in-memory [`LogSource`] for tests.
    ///
    /// Serves a fixed set of logs, optionally refuses queries whose result
    /// would exceed `max_results`, and replays scripted failures per range.
    #[derive(Default)]
    pub struct MockLogSource {
        head: Mutex<u64>,
        logs: Mutex<Vec<TransferLog>>,
        max_results: Option<usize>,
        failures: Mutex<HashMap<(u64, u64), VecDeque<SourceError>>>,
        head_failures: Mutex<VecDeque<SourceError>>,
        queries: Mutex<Vec<(u64, u64)>>,
        timestamp_lookups: Mutex<Vec<u64>>,
    }

    impl MockLogSource {
        pub fn new(head: u64) -> Self {
            Self {
                head: Mutex::new(head),
                ..Self::default()
            }
        }

        /// Refuse any query that would return more than `max` logs.
        pub fn with_max_results(mut self, max: usize) -> Self {
            self.max_results = Some(max);
            self
        }

        pub fn with_logs(self, logs: Vec<TransferLog>) -> Self {
            *self.logs.lock().unwrap() = logs;
            self
        }

        pub fn push_log(&self, log: TransferLog) {
            self.logs.lock().unwrap().push(log);
        }

        pub fn set_head(&self, head: u64) {
            *self.head.lock().unwrap() = head;
        }

        /// Queue an error for the next query of exactly `[from, to]`.
        pub fn fail_range(&self, from: u64, to: u64, err: SourceError) {
            self.failures
                .lock()
                .unwrap()
                .entry((from, to))
                .or_default()
                .push_back(err);
        }

        /// Queue an error for the next `current_head` call.
        pub fn fail_head(&self, err: SourceError) {
            self.head_failures.lock().unwrap().push_back(err);
        }

        /// Ranges queried so far, in call order.
        pub fn queries(&self) -> Vec<(u64, u64)> {
            self.queries.lock().unwrap().clone()
        }

        /// Blocks whose timestamp was looked up, in call order.
        pub fn timestamp_lookups(&self) -> Vec<u64> {
            self.timestamp_lookups.lock().unwrap().clone()
        }

        /// Timestamp served for a block: 12 seconds per block.
        pub fn timestamp_of(block_number: u64) -> u64 {
            1_700_000_000 + block_number * 12
        }
    }

    #[async_trait]
    impl LogSource for MockLogSource {
        async fn current_head(&self) -> Result<u64, SourceError> {
            if let Some(err) = self.head_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(*self.head.lock().unwrap())
        }

        async fn transfer_logs(&self, query: &LogQuery) -> Result<Vec<TransferLog>, SourceError> {
            let range = (query.from_block, query.to_block);
            self.queries.lock().unwrap().push(range);

            if let Some(err) = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&range)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }

            let matched: Vec<TransferLog> = self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.block_number >= query.from_block && l.block_number <= query.to_block)
                .cloned()
                .collect();

            match self.max_results {
                Some(max) if matched.len() > max => Err(SourceError::LimitExceeded(format!(
                    "query returned more than {max} results"
                ))),
                _ => Ok(matched),
            }
        }

        async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
            self.timestamp_lookups.lock().unwrap().push(block_number);
            Ok(Self::timestamp_of(block_number))
        }
    }
}
