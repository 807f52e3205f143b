//! Scoring pass over the most recent transactions.
//!
//! Loads the latest window from the store, fits an isolation forest on its
//! features and writes every row's decision value and outlier flag back in
//! one unit of work. Any failure leaves stored scores untouched. Rows that
//! fall out of the window keep the score of their last pass.

use tokenwatch_data::store::{Store, StoreError};
use tokenwatch_data::types::ScoreUpdate;

use crate::features::{self, FeatureError};
use crate::forest::{ForestError, IsolationForest};

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("feature extraction failed: {0}")]
    Features(#[from] FeatureError),
    #[error("model fit failed: {0}")]
    ModelFit(#[from] ForestError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorerConfig {
    /// Fewer rows than this and the pass does nothing.
    pub min_rows: usize,
    pub forest: IsolationForest,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_rows: 10,
            forest: IsolationForest::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
    /// Not enough transactions to fit a model.
    Skipped { available: usize },
    Scored { rows: usize, anomalies: usize },
}

pub struct AnomalyScorer<'a> {
    store: &'a Store,
    config: ScorerConfig,
}

impl<'a> AnomalyScorer<'a> {
    pub fn new(store: &'a Store, config: ScorerConfig) -> Self {
        Self { store, config }
    }

    /// Scores the most recent `window_size` transactions.
    #[tracing::instrument(skip(self))]
    pub fn score(&self, window_size: usize) -> Result<ScoreOutcome, ScoreError> {
        let window = self.store.recent_transactions(window_size)?;
        if window.len() < self.config.min_rows {
            tracing::debug!(
                available = window.len(),
                min_rows = self.config.min_rows,
                "not enough transactions to score"
            );
            return Ok(ScoreOutcome::Skipped {
                available: window.len(),
            });
        }

        let matrix = features::extract(&window)?;
        let verdicts = self.config.forest.fit_predict(&matrix.rows)?;

        let updates: Vec<ScoreUpdate> = matrix
            .ids
            .iter()
            .zip(&verdicts)
            .map(|(&id, verdict)| ScoreUpdate {
                id,
                anomaly_score: verdict.score,
                is_anomaly: verdict.is_outlier,
            })
            .collect();
        let anomalies = updates.iter().filter(|u| u.is_anomaly).count();

        self.store.update_scores(&updates)?;

        tracing::info!(rows = updates.len(), anomalies, "scored transaction window");
        Ok(ScoreOutcome::Scored {
            rows: updates.len(),
            anomalies,
        })
    }
}
