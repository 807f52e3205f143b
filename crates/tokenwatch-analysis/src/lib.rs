//! tokenwatch-analysis crate
//!
//! Rolling-window feature extraction, isolation-forest outlier scoring and
//! the scoring pass that writes scores back to the store.

pub mod features;
pub mod forest;
pub mod scorer;

pub use forest::IsolationForest;
pub use scorer::{AnomalyScorer, ScoreError, ScoreOutcome, ScorerConfig};
