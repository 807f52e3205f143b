//! Pipeline configuration from flags and environment.
//!
//! Every constant can be given as a flag or a `TOKENWATCH_*` variable (a
//! `.env` file is loaded first). [`PipelineArgs::into_config`] validates the
//! values; a [`ConfigError`] is fatal at startup.

use alloy::primitives::Address;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tokenwatch_analysis::{IsolationForest, ScorerConfig};
use tokenwatch_data::RetryPolicy;

/// USDC on Sepolia.
pub const DEFAULT_CONTRACT: &str = "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238";
pub const DEFAULT_DECIMALS: u8 = 6;
pub const DEFAULT_LOOKBACK_BLOCKS: u64 = 100;
pub const DEFAULT_CONFIRMATIONS: u64 = 0;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_WINDOW_SIZE: usize = 1000;
pub const DEFAULT_MIN_ROWS: usize = 10;
pub const DEFAULT_CONTAMINATION: f64 = 0.05;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_TREES: usize = 100;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Scoring settings, shared by `score` and the full pipeline.
#[derive(Args, Debug, Clone)]
pub struct ScoringArgs {
    /// Number of most recent transactions per scoring pass.
    #[arg(long, env = "TOKENWATCH_WINDOW_SIZE", default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: usize,

    /// Minimum transactions before a model is fitted.
    #[arg(long, env = "TOKENWATCH_MIN_ROWS", default_value_t = DEFAULT_MIN_ROWS)]
    pub min_rows: usize,

    /// Expected fraction of anomalous transactions.
    #[arg(long, env = "TOKENWATCH_CONTAMINATION", default_value_t = DEFAULT_CONTAMINATION)]
    pub contamination: f64,

    #[arg(long, env = "TOKENWATCH_SEED", default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[arg(long, env = "TOKENWATCH_TREES", default_value_t = DEFAULT_TREES)]
    pub trees: usize,
}

impl Default for ScoringArgs {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            min_rows: DEFAULT_MIN_ROWS,
            contamination: DEFAULT_CONTAMINATION,
            seed: DEFAULT_SEED,
            trees: DEFAULT_TREES,
        }
    }
}

/// Validated scoring settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringConfig {
    pub window_size: usize,
    pub scorer: ScorerConfig,
}

impl ScoringArgs {
    pub fn into_config(self) -> Result<ScoringConfig, ConfigError> {
        if self.window_size == 0 {
            return Err(invalid("window_size", "must be positive"));
        }
        if self.min_rows < 2 {
            return Err(invalid("min_rows", "must be at least 2"));
        }
        if self.window_size < self.min_rows {
            return Err(invalid("window_size", "must not be smaller than min_rows"));
        }
        let forest = IsolationForest {
            trees: self.trees,
            contamination: self.contamination,
            seed: self.seed,
            ..IsolationForest::default()
        };
        forest
            .validate()
            .map_err(|e| invalid("forest", e.to_string()))?;

        Ok(ScoringConfig {
            window_size: self.window_size,
            scorer: ScorerConfig {
                min_rows: self.min_rows,
                forest,
            },
        })
    }
}

/// Settings for commands that ingest from the chain.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Ethereum JSON-RPC endpoint (with API key).
    #[arg(long, env = "TOKENWATCH_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Token contract whose Transfer events are ingested.
    #[arg(long, env = "TOKENWATCH_CONTRACT", default_value = DEFAULT_CONTRACT)]
    pub contract: String,

    /// Token decimals used to scale raw amounts.
    #[arg(long, env = "TOKENWATCH_DECIMALS", default_value_t = DEFAULT_DECIMALS)]
    pub decimals: u8,

    /// Maximum number of blocks behind the head a cycle looks at.
    #[arg(long, env = "TOKENWATCH_LOOKBACK_BLOCKS", default_value_t = DEFAULT_LOOKBACK_BLOCKS)]
    pub lookback_blocks: u64,

    /// Blocks to stay behind the head.
    #[arg(long, env = "TOKENWATCH_CONFIRMATIONS", default_value_t = DEFAULT_CONFIRMATIONS)]
    pub confirmations: u64,

    /// Events per persistence unit of work.
    #[arg(long, env = "TOKENWATCH_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Seconds between the end of one cycle and the start of the next.
    #[arg(long, env = "TOKENWATCH_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    /// Attempts per RPC call on network errors.
    #[arg(long, env = "TOKENWATCH_RETRY_ATTEMPTS", default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Backoff before the first retry, doubled per attempt.
    #[arg(long, env = "TOKENWATCH_RETRY_BACKOFF_MS", default_value_t = DEFAULT_RETRY_BACKOFF_MS)]
    pub retry_backoff_ms: u64,

    /// Directory receiving a JSON blob of each cycle's new transactions.
    #[arg(long, env = "TOKENWATCH_EXPORT_DIR")]
    pub export_dir: Option<PathBuf>,

    #[command(flatten)]
    pub scoring: ScoringArgs,
}

impl Default for PipelineArgs {
    fn default() -> Self {
        Self {
            rpc_url: None,
            contract: DEFAULT_CONTRACT.to_string(),
            decimals: DEFAULT_DECIMALS,
            lookback_blocks: DEFAULT_LOOKBACK_BLOCKS,
            confirmations: DEFAULT_CONFIRMATIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            export_dir: None,
            scoring: ScoringArgs::default(),
        }
    }
}

/// Validated pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub rpc_url: String,
    pub contract: Address,
    pub decimals: u8,
    pub lookback_blocks: u64,
    pub confirmations: u64,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub export_dir: Option<PathBuf>,
    pub scoring: ScoringConfig,
}

impl PipelineArgs {
    pub fn into_config(self) -> Result<PipelineConfig, ConfigError> {
        let rpc_url = self
            .rpc_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("TOKENWATCH_RPC_URL"))?;
        let contract = self
            .contract
            .parse::<Address>()
            .map_err(|e| invalid("contract", e.to_string()))?;
        if self.decimals > 36 {
            return Err(invalid("decimals", "must be at most 36"));
        }
        if self.lookback_blocks == 0 {
            return Err(invalid("lookback_blocks", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs", "must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(invalid("retry_attempts", "must be positive"));
        }

        Ok(PipelineConfig {
            rpc_url,
            contract,
            decimals: self.decimals,
            lookback_blocks: self.lookback_blocks,
            confirmations: self.confirmations,
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_backoff_ms),
            },
            export_dir: self.export_dir,
            scoring: self.scoring.into_config()?,
        })
    }
}
