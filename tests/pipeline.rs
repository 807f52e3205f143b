//! Integration tests for full ingestion cycles against a scripted source.

mod common;

use common::{sample_log, test_config, test_store, UNIT};
use std::sync::Arc;
use tokenwatch_analysis::ScoreOutcome;
use tokenwatch_cli::scheduler::{CycleError, Pipeline};
use tokenwatch_data::source::{MockLogSource, SourceError};
use tokenwatch_data::store::INGEST_CURSOR;

/// Running the same cycle twice leaves the store unchanged the second time.
#[tokio::test]
async fn repeated_cycle_is_idempotent() {
    let store = test_store();
    let source = Arc::new(MockLogSource::new(110).with_logs(
        (0..12).map(|n| sample_log(n, 100 + n, (n + 1) * UNIT)).collect(),
    ));
    let pipeline = Pipeline::new(Arc::clone(&source), &store, test_config());

    let first = pipeline.run_cycle().await.expect("first cycle");
    assert_eq!(first.persist.inserted_count(), 11);
    assert!(matches!(first.scoring, Ok(ScoreOutcome::Scored { rows: 11, .. })));

    // Forget the cursor so the same range is fetched again.
    store.set_cursor(INGEST_CURSOR, 10).unwrap();
    let second = pipeline.run_cycle().await.expect("second cycle");

    assert_eq!(second.persist.inserted_count(), 0);
    assert_eq!(second.persist.skipped, 11);
    assert_eq!(store.transaction_count().unwrap(), 11);
}

/// The cursor follows the head across cycles and new blocks are picked up.
#[tokio::test]
async fn cursor_converges_to_head() {
    let store = test_store();
    let source = Arc::new(MockLogSource::new(50).with_logs(vec![sample_log(1, 50, UNIT)]));
    let pipeline = Pipeline::new(Arc::clone(&source), &store, test_config());

    pipeline.run_cycle().await.expect("cycle");
    assert_eq!(store.cursor(INGEST_CURSOR).unwrap(), Some(50));

    source.push_log(sample_log(2, 55, UNIT));
    source.set_head(60);
    let report = pipeline.run_cycle().await.expect("cycle");

    assert_eq!(report.range, Some((51, 60)));
    assert_eq!(report.persist.inserted_count(), 1);
    assert_eq!(store.cursor(INGEST_CURSOR).unwrap(), Some(60));
    assert_eq!(store.transaction_count().unwrap(), 2);
}

/// A fetch that keeps failing leaves the store and cursor as they were.
#[tokio::test]
async fn failed_fetch_makes_no_progress() {
    let store = test_store();
    store.set_cursor(INGEST_CURSOR, 90).unwrap();
    let source = Arc::new(MockLogSource::new(100).with_logs(vec![sample_log(1, 95, UNIT)]));
    source.fail_range(91, 100, SourceError::Network("connection reset".to_string()));
    let pipeline = Pipeline::new(Arc::clone(&source), &store, test_config());

    let err = pipeline.run_cycle().await.unwrap_err();

    assert!(matches!(err, CycleError::Fetch(_)));
    assert_eq!(store.cursor(INGEST_CURSOR).unwrap(), Some(90));
    assert_eq!(store.transaction_count().unwrap(), 0);

    // The next cycle retries the same range and succeeds.
    let report = pipeline.run_cycle().await.expect("cycle");
    assert_eq!(report.range, Some((91, 100)));
    assert_eq!(store.transaction_count().unwrap(), 1);
}
