//! Isolation forest outlier detection.
//!
//! Each tree isolates points by recursive random axis-aligned splits on a
//! random subsample. Points that are isolated after few splits are outliers.
//!
//! Score convention, fixed for the whole crate:
//! - `score_samples` is the negated anomaly score, in `[-1, 0)`.
//! - `decision_function = score_samples - offset`, where `offset` is the
//!   `contamination` percentile of the training scores.
//! - Negative decision values are outliers; more negative is more anomalous.
//!
//! Fitting with the same seed on the same data gives identical scores.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

/// Euler–Mascheroni constant, for the harmonic number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ForestError {
    #[error("cannot fit on an empty sample")]
    Empty,
    #[error("non-finite value in row {row}")]
    NonFinite { row: usize },
    #[error("contamination must be in (0, 0.5], got {0}")]
    InvalidContamination(f64),
    #[error("forest needs at least one tree")]
    NoTrees,
}

/// Isolation forest hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsolationForest {
    pub trees: usize,
    /// Subsample size per tree, capped at the number of rows.
    pub max_samples: usize,
    /// Expected fraction of outliers; sets the decision threshold.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            trees: 100,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn path_length<const D: usize>(&self, point: &[f64; D]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                    depth += 1.0;
                }
            }
        }
    }
}

/// A fitted forest with its decision threshold.
#[derive(Debug, Clone)]
pub struct FittedForest {
    trees: Vec<Tree>,
    sample_size: usize,
    offset: f64,
}

/// Per-row model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Decision function value; negative is an outlier.
    pub score: f64,
    pub is_outlier: bool,
}

impl IsolationForest {
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.trees == 0 {
            return Err(ForestError::NoTrees);
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ForestError::InvalidContamination(self.contamination));
        }
        Ok(())
    }

    /// Fits the forest on `data`.
    pub fn fit<const D: usize>(&self, data: &[[f64; D]]) -> Result<FittedForest, ForestError> {
        self.validate()?;
        if data.is_empty() {
            return Err(ForestError::Empty);
        }
        if let Some(row) = data.iter().position(|r| r.iter().any(|v| !v.is_finite())) {
            return Err(ForestError::NonFinite { row });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let sample_size = self.max_samples.clamp(1, data.len());
        let max_depth = (sample_size.max(2) as f64).log2().ceil() as usize;

        let trees = (0..self.trees)
            .map(|_| {
                let sample = index::sample(&mut rng, data.len(), sample_size).into_vec();
                let mut nodes = Vec::new();
                grow(data, sample, 0, max_depth, &mut rng, &mut nodes);
                Tree { nodes }
            })
            .collect();

        let mut forest = FittedForest {
            trees,
            sample_size,
            offset: 0.0,
        };
        let training: Vec<f64> = data.iter().map(|p| forest.score_sample(p)).collect();
        forest.offset = percentile(&training, 100.0 * self.contamination);
        Ok(forest)
    }

    /// Fits on `data` and scores every row of it.
    pub fn fit_predict<const D: usize>(
        &self,
        data: &[[f64; D]],
    ) -> Result<Vec<Verdict>, ForestError> {
        let forest = self.fit(data)?;
        Ok(data.iter().map(|p| forest.verdict(p)).collect())
    }
}

impl FittedForest {
    /// Negated anomaly score in `[-1, 0)`; lower is more anomalous.
    pub fn score_sample<const D: usize>(&self, point: &[f64; D]) -> f64 {
        let mean_depth = self
            .trees
            .iter()
            .map(|t| t.path_length(point))
            .sum::<f64>()
            / self.trees.len() as f64;
        -(2f64).powf(-mean_depth / average_path_length(self.sample_size))
    }

    pub fn decision_function<const D: usize>(&self, point: &[f64; D]) -> f64 {
        self.score_sample(point) - self.offset
    }

    pub fn verdict<const D: usize>(&self, point: &[f64; D]) -> Verdict {
        let score = self.decision_function(point);
        Verdict {
            score,
            is_outlier: score < 0.0,
        }
    }
}

/// Grows one subtree over `sample` into `nodes` and returns its root index.
fn grow<const D: usize>(
    data: &[[f64; D]],
    sample: Vec<usize>,
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<Node>,
) -> usize {
    let id = nodes.len();
    nodes.push(Node::Leaf { size: sample.len() });
    if depth >= max_depth || sample.len() <= 1 {
        return id;
    }

    // Only features that still vary inside this node can split it.
    let ranges: Vec<(usize, f64, f64)> = (0..D)
        .filter_map(|f| {
            let (lo, hi) = sample.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(data[i][f]), hi.max(data[i][f]))
            });
            (lo < hi).then_some((f, lo, hi))
        })
        .collect();
    if ranges.is_empty() {
        return id;
    }

    let (feature, lo, hi) = ranges[rng.gen_range(0..ranges.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        sample.into_iter().partition(|&i| data[i][feature] <= threshold);

    let left = grow(data, left_rows, depth + 1, max_depth, rng, nodes);
    let right = grow(data, right_rows, depth + 1, max_depth, rng, nodes);
    nodes[id] = Node::Split {
        feature,
        threshold,
        left,
        right,
    };
    id
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}
