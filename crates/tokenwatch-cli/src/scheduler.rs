//! Ingestion cycles and the loop that runs them.
//!
//! A cycle reads the chain head, fetches every transfer event between the
//! persisted cursor and the head (bounded by the lookback window), persists
//! them in batches, optionally exports the new rows and rescores the recent
//! window. The cursor moves only after every batch of the cycle committed.
//!
//! [`Scheduler`] runs cycles one at a time with a fixed pause between the end
//! of one cycle and the start of the next. A failed cycle is logged and the
//! loop carries on.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokenwatch_analysis::{AnomalyScorer, ScoreError, ScoreOutcome};
use tokenwatch_data::export::export_batch;
use tokenwatch_data::fetcher::{FetchError, RangeFetcher};
use tokenwatch_data::persister::{EventPersister, PersistReport};
use tokenwatch_data::source::{LogSource, SourceError};
use tokenwatch_data::store::{Store, StoreError, INGEST_CURSOR};

use crate::config::PipelineConfig;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("failed to read chain head: {0}")]
    Head(#[from] SourceError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cursor storage failed: {0}")]
    Storage(#[from] StoreError),
}

/// What one cycle did.
#[derive(Debug)]
pub struct CycleReport {
    /// Block range fetched, `None` when already caught up.
    pub range: Option<(u64, u64)>,
    pub fetched: usize,
    pub persist: PersistReport,
    pub cursor_advanced: bool,
    pub scoring: Result<ScoreOutcome, ScoreError>,
    pub exported: Option<PathBuf>,
}

/// One fetch, persist, score pipeline over a store.
pub struct Pipeline<'a, S> {
    fetcher: RangeFetcher<S>,
    store: &'a Store,
    config: PipelineConfig,
}

impl<'a, S: LogSource> Pipeline<'a, S> {
    pub fn new(source: S, store: &'a Store, config: PipelineConfig) -> Self {
        let fetcher = RangeFetcher::new(source, config.contract).with_retry(config.retry);
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Block range the next cycle would fetch for a chain at `head`.
    ///
    /// `None` when caught up, or when the chain is shorter than the
    /// confirmation depth.
    fn plan(&self, head: u64, cursor: Option<u64>) -> Option<(u64, u64)> {
        let target = head.checked_sub(self.config.confirmations)?;
        let floor = target.saturating_sub(self.config.lookback_blocks.saturating_sub(1));
        let start = match cursor {
            Some(last) => last.saturating_add(1).max(floor),
            None => floor,
        };
        (start <= target).then_some((start, target))
    }

    /// Runs one full cycle.
    ///
    /// # Errors
    /// Fails when the head cannot be read, the range cannot be fetched or the
    /// cursor cannot be read or written. Nothing is persisted in the first
    /// two cases. Failed batches and a failed scoring pass do not fail the
    /// cycle; they are reported in [`CycleReport`].
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let head = self.fetcher.current_head().await?;
        let cursor = self.store.cursor(INGEST_CURSOR)?;
        let range = self.plan(head, cursor);

        let mut report = CycleReport {
            range,
            fetched: 0,
            persist: PersistReport::default(),
            cursor_advanced: false,
            scoring: Ok(ScoreOutcome::Skipped { available: 0 }),
            exported: None,
        };

        match range {
            Some((start, end)) => {
                let events = self.fetcher.fetch(start, end).await?;
                report.fetched = events.len();
                report.persist =
                    EventPersister::new(self.store, self.config.decimals, self.config.batch_size)
                        .persist(&events);

                if report.persist.is_complete() {
                    self.store.set_cursor(INGEST_CURSOR, end)?;
                    report.cursor_advanced = true;
                } else {
                    tracing::warn!(
                        start,
                        end,
                        failed_batches = report.persist.failed_batches(),
                        "cursor held back, range will be fetched again"
                    );
                }
            }
            None => tracing::debug!(head, ?cursor, "already caught up"),
        }

        report.exported = self.export(&report.persist).await;

        let scorer = AnomalyScorer::new(self.store, self.config.scoring.scorer);
        report.scoring = scorer.score(self.config.scoring.window_size);
        if let Err(err) = &report.scoring {
            tracing::error!(%err, "scoring pass failed, stored scores left as they were");
        }

        Ok(report)
    }

    async fn export(&self, persist: &PersistReport) -> Option<PathBuf> {
        let dir = self.config.export_dir.as_deref()?;
        if persist.inserted.is_empty() {
            return None;
        }
        let first_timestamp = persist.inserted.first().map(|t| t.timestamp);
        match export_batch(dir, first_timestamp, &persist.inserted).await {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(error = %err, "export failed");
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Runs pipeline cycles back to back with `interval` between them.
pub struct Scheduler<'a, S> {
    pipeline: Pipeline<'a, S>,
    interval: Duration,
    state: SchedulerState,
}

impl<'a, S: LogSource> Scheduler<'a, S> {
    pub fn new(pipeline: Pipeline<'a, S>, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs exactly one cycle and logs its outcome.
    pub async fn tick(&mut self) -> Result<CycleReport, CycleError> {
        self.state = SchedulerState::Running;
        let result = self.pipeline.run_cycle().await;
        self.state = SchedulerState::Idle;

        match &result {
            Ok(report) => tracing::info!(
                range = ?report.range,
                fetched = report.fetched,
                inserted = report.persist.inserted_count(),
                skipped = report.persist.skipped,
                cursor_advanced = report.cursor_advanced,
                scoring = ?report.scoring.as_ref().ok(),
                "cycle finished"
            ),
            Err(err) => tracing::error!(%err, "cycle failed, no progress this cycle"),
        }
        result
    }

    /// Runs cycles until `shutdown` resolves and returns how many finished.
    ///
    /// The wait starts after a cycle ends, so cycles never overlap. Shutdown
    /// during a cycle drops it between store writes; every batch is its own
    /// unit of work, so nothing half-written is left behind.
    pub async fn run<F>(&mut self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles = 0;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.tick() => cycles += 1,
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.state = SchedulerState::Idle;
        tracing::info!(cycles, "scheduler stopped");
        cycles
    }
}
