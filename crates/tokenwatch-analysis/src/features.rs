//! Feature extraction over a rolling window of transactions.
//!
//! Each row carries two features:
//! - the amount's z-score against the window (0 when the window has no spread)
//! - the block gap to the previous transaction in chain order
//!
//! The oldest transaction has no predecessor; its gap is imputed with the
//! median of the other gaps so that every row in the window can be scored.

use tokenwatch_data::types::Transaction;

/// Number of features per row.
pub const FEATURES: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FeatureError {
    #[error("empty window")]
    Empty,
    #[error("non-finite amount {amount} for transaction {id}")]
    NonFinite { id: i64, amount: f64 },
}

/// Features of a window, row `i` belonging to transaction `ids[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub ids: Vec<i64>,
    pub rows: Vec<[f64; FEATURES]>,
}

/// Builds the feature matrix for `window`, ordered by `(block_number, log_index)`.
pub fn extract(window: &[Transaction]) -> Result<FeatureMatrix, FeatureError> {
    if window.is_empty() {
        return Err(FeatureError::Empty);
    }
    if let Some(bad) = window.iter().find(|t| !t.amount.is_finite()) {
        return Err(FeatureError::NonFinite {
            id: bad.id,
            amount: bad.amount,
        });
    }

    let mut ordered: Vec<&Transaction> = window.iter().collect();
    ordered.sort_by_key(|t| (t.block_number, t.log_index));

    let amounts: Vec<f64> = ordered.iter().map(|t| t.amount).collect();
    let (mean, std) = mean_std(&amounts);

    let mut gaps: Vec<f64> = Vec::with_capacity(ordered.len());
    gaps.push(0.0);
    for pair in ordered.windows(2) {
        gaps.push(pair[1].block_number.abs_diff(pair[0].block_number) as f64);
    }
    gaps[0] = median(&gaps[1..]);

    let rows = amounts
        .iter()
        .zip(&gaps)
        .map(|(amount, gap)| {
            let z = if std > 0.0 { (amount - mean) / std } else { 0.0 };
            [z, *gap]
        })
        .collect();

    Ok(FeatureMatrix {
        ids: ordered.iter().map(|t| t.id).collect(),
        rows,
    })
}

/// Population mean and standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: i64, block_number: u64, amount: f64) -> Transaction {
        Transaction {
            id,
            tx_hash: format!("0x{:064x}", id),
            log_index: 0,
            from_address: "0x01".to_string(),
            to_address: "0x02".to_string(),
            raw_amount: String::new(),
            amount,
            timestamp: 0,
            block_number,
            is_anomaly: false,
            anomaly_score: None,
        }
    }

    #[test]
    fn zscore_and_gaps() {
        let window = vec![tx(1, 100, 1.0), tx(2, 102, 2.0), tx(3, 106, 3.0)];
        let m = extract(&window).expect("extract");

        // mean 2, population std sqrt(2/3)
        let std = (2.0f64 / 3.0).sqrt();
        assert!((m.rows[0][0] + 1.0 / std).abs() < 1e-12);
        assert_eq!(m.rows[1][0], 0.0);
        assert_eq!(m.rows[1][1], 2.0);
        assert_eq!(m.rows[2][1], 4.0);
        // median of [2, 4]
        assert_eq!(m.rows[0][1], 3.0);
    }

    #[test]
    fn constant_amounts_give_zero_zscore() {
        let window = vec![tx(1, 1, 5.0), tx(2, 2, 5.0), tx(3, 3, 5.0)];
        let m = extract(&window).expect("extract");
        assert!(m.rows.iter().all(|r| r[0] == 0.0));
    }

    #[test]
    fn rows_follow_chain_order_not_input_order() {
        let mut late = tx(9, 50, 1.0);
        late.log_index = 3;
        let mut early = tx(4, 50, 1.0);
        early.log_index = 1;
        let m = extract(&[late, tx(7, 10, 1.0), early]).expect("extract");
        assert_eq!(m.ids, vec![7, 4, 9]);
        assert_eq!(m.rows[1][1], 40.0);
        assert_eq!(m.rows[2][1], 0.0);
    }

    #[test]
    fn single_row_window_has_zero_gap() {
        let m = extract(&[tx(1, 10, 3.0)]).expect("extract");
        assert_eq!(m.rows, vec![[0.0, 0.0]]);
    }

    #[test]
    fn rejects_empty_and_non_finite() {
        assert_eq!(extract(&[]), Err(FeatureError::Empty));
        assert!(matches!(
            extract(&[tx(1, 1, f64::NAN)]),
            Err(FeatureError::NonFinite { id: 1, .. })
        ));
    }
}
