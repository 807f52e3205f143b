//! Adaptive range fetching of transfer events.
//!
//! Providers cap the number of logs a single `eth_getLogs` call may return.
//! [`RangeFetcher::fetch`] queries the whole interval first and bisects any
//! sub-range the provider refuses, working through an explicit stack of
//! `(start, end)` ranges rather than recursing. A single block that is still
//! refused is reported to the caller.

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use std::collections::HashMap;
use std::time::Duration;

use crate::source::{erc20, LogQuery, LogSource, SourceError, TransferLog};
use crate::types::TransferEvent;

/// Errors surfaced by [`RangeFetcher::fetch`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid range: start {start} is greater than end {end}")]
    InvalidRange { start: u64, end: u64 },
    /// Even a single-block query exceeds the provider limit.
    #[error("provider limit exceeded for single block {block}: {message}")]
    LimitExceeded { block: u64, message: String },
    #[error("log source failed for blocks {start}..={end}: {source}")]
    Source {
        start: u64,
        end: u64,
        #[source]
        source: SourceError,
    },
}

/// Bounded retry with exponential backoff for transient source failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::debug!(
                        call = what,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying transient source failure"
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fetches `Transfer` events of one token contract over block ranges.
pub struct RangeFetcher<S> {
    source: S,
    contract: Address,
    topic0: B256,
    retry: RetryPolicy,
}

impl<S: LogSource> RangeFetcher<S> {
    pub fn new(source: S, contract: Address) -> Self {
        Self {
            source,
            contract,
            topic0: erc20::Transfer::SIGNATURE_HASH,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Latest block of the chain, with transient failures retried.
    pub async fn current_head(&self) -> Result<u64, SourceError> {
        self.retry
            .run("eth_blockNumber", || self.source.current_head())
            .await
    }

    /// Fetches every transfer event in `[start, end]`, ordered by
    /// `(block_number, log_index)`.
    ///
    /// Ranges the provider refuses are split at their midpoint and fetched
    /// independently. Block timestamps are looked up once per distinct block
    /// within this call.
    ///
    /// # Errors
    /// Returns [`FetchError::LimitExceeded`] if a single block is still too
    /// large, and [`FetchError::Source`] once transient retries are exhausted
    /// or the source reports a non-retryable error.
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, start: u64, end: u64) -> Result<Vec<TransferEvent>, FetchError> {
        if start > end {
            return Err(FetchError::InvalidRange { start, end });
        }

        let mut pending = vec![(start, end)];
        let mut logs: Vec<TransferLog> = Vec::new();
        let mut splits = 0usize;

        while let Some((lo, hi)) = pending.pop() {
            let query = LogQuery {
                contract: self.contract,
                topic0: self.topic0,
                from_block: lo,
                to_block: hi,
            };

            match self
                .retry
                .run("eth_getLogs", || self.source.transfer_logs(&query))
                .await
            {
                Ok(mut batch) => logs.append(&mut batch),
                Err(SourceError::LimitExceeded(message)) if lo == hi => {
                    return Err(FetchError::LimitExceeded { block: lo, message });
                }
                Err(SourceError::LimitExceeded(_)) => {
                    let mid = lo + (hi - lo) / 2;
                    tracing::debug!(lo, mid, hi, "provider limit hit, splitting range");
                    splits += 1;
                    // Left half on top so sub-ranges are visited in chain order.
                    pending.push((mid + 1, hi));
                    pending.push((lo, mid));
                }
                Err(source) => {
                    return Err(FetchError::Source {
                        start: lo,
                        end: hi,
                        source,
                    })
                }
            }
        }

        logs.sort_by_key(|l| (l.block_number, l.log_index));
        let events = self.attach_timestamps(logs).await?;

        tracing::info!(start, end, events = events.len(), splits, "fetched transfer events");
        Ok(events)
    }

    async fn attach_timestamps(
        &self,
        logs: Vec<TransferLog>,
    ) -> Result<Vec<TransferEvent>, FetchError> {
        let mut block_times: HashMap<u64, u64> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());

        for log in logs {
            let block_timestamp = match log.block_timestamp {
                Some(ts) => ts,
                None => match block_times.get(&log.block_number) {
                    Some(ts) => *ts,
                    None => {
                        let ts = self
                            .retry
                            .run("eth_getBlockByNumber", || {
                                self.source.block_timestamp(log.block_number)
                            })
                            .await
                            .map_err(|source| FetchError::Source {
                                start: log.block_number,
                                end: log.block_number,
                                source,
                            })?;
                        block_times.insert(log.block_number, ts);
                        ts
                    }
                },
            };

            events.push(TransferEvent {
                tx_hash: format!("{}", log.tx_hash),
                log_index: log.log_index,
                from_address: format!("{}", log.from).to_lowercase(),
                to_address: format!("{}", log.to).to_lowercase(),
                raw_amount: log.value,
                block_number: log.block_number,
                block_timestamp,
            });
        }

        Ok(events)
    }
}
