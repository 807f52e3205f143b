//! Integration tests for range fetching and batched persistence.

mod common;

use common::{sample_event, sample_log, test_store, tx_hash, UNIT};
use std::sync::Arc;
use tokenwatch_data::fetcher::RangeFetcher;
use tokenwatch_data::persister::EventPersister;
use tokenwatch_data::source::{MockLogSource, SourceError};
use tokenwatch_data::store::INGEST_CURSOR;
use tokenwatch_data::{RetryPolicy, Store};

use alloy::primitives::Address;

fn fetcher(source: Arc<MockLogSource>) -> RangeFetcher<Arc<MockLogSource>> {
    RangeFetcher::new(source, Address::with_last_byte(0x01)).with_retry(RetryPolicy::immediate(1))
}

/// Three transfers in blocks 100..=103 become three rows with scaled amounts.
#[tokio::test]
async fn fetched_events_persist_with_scaled_amounts() {
    let source = Arc::new(MockLogSource::new(103).with_logs(vec![
        sample_log(1, 100, 1_500_000),
        sample_log(2, 101, 20 * UNIT),
        sample_log(3, 103, 7),
    ]));
    let store = test_store();

    let events = fetcher(source).fetch(100, 103).await.expect("fetch");
    let report = EventPersister::new(&store, 6, 100).persist(&events);

    assert!(report.is_complete());
    assert_eq!(store.transaction_count().unwrap(), 3);

    let first = store
        .transaction_by_hash(&format!("{}", tx_hash(1)))
        .unwrap()
        .expect("stored");
    assert_eq!(first.amount, 1.5);
    assert_eq!(first.raw_amount, "1500000");
    assert_eq!(first.block_number, 100);
    assert_eq!(first.timestamp, MockLogSource::timestamp_of(100));

    let dust = store
        .transaction_by_hash(&format!("{}", tx_hash(3)))
        .unwrap()
        .expect("stored");
    assert_eq!(dust.amount, 0.000007);
    assert_eq!(dust.block_number, 103);
}

/// A provider limit on the full range is answered from both halves.
#[tokio::test]
async fn limit_error_splits_range_and_loses_nothing() {
    let source = Arc::new(MockLogSource::new(200).with_logs(vec![
        sample_log(1, 120, UNIT),
        sample_log(2, 180, UNIT),
    ]));
    source.fail_range(
        100,
        200,
        SourceError::LimitExceeded("query returned more than 10000 results".to_string()),
    );

    let events = fetcher(Arc::clone(&source)).fetch(100, 200).await.expect("fetch");

    assert_eq!(source.queries(), vec![(100, 200), (100, 150), (151, 200)]);
    let blocks: Vec<u64> = events.iter().map(|e| e.block_number).collect();
    assert_eq!(blocks, vec![120, 180]);
}

/// However the provider forces the range to be split, the result is the same.
#[tokio::test]
async fn result_does_not_depend_on_split_points() {
    let logs: Vec<_> = (0..40).map(|n| sample_log(n, 1_000 + n * 3, n * UNIT)).collect();

    let whole = fetcher(Arc::new(MockLogSource::new(2_000).with_logs(logs.clone())))
        .fetch(1_000, 1_200)
        .await
        .expect("fetch");
    let split = fetcher(Arc::new(
        MockLogSource::new(2_000).with_logs(logs).with_max_results(3),
    ))
    .fetch(1_000, 1_200)
    .await
    .expect("fetch");

    assert_eq!(whole.len(), 40);
    assert_eq!(whole, split);
}

/// Persisting the same event twice keeps one row.
#[test]
fn duplicate_event_is_skipped() {
    let store = test_store();
    let persister = EventPersister::new(&store, 6, 10);

    persister.persist(&[sample_event(1, 100, UNIT)]);
    let again = persister.persist(&[sample_event(1, 100, UNIT)]);

    assert_eq!(again.inserted_count(), 0);
    assert_eq!(again.skipped, 1);
    assert_eq!(store.transaction_count().unwrap(), 1);
}

/// A malformed event discards its whole batch and only its batch.
#[test]
fn malformed_event_rolls_back_its_batch() {
    let store = test_store();
    let mut events: Vec<_> = (1..=4).map(|n| sample_event(n, 100 + n, UNIT)).collect();
    events[1].tx_hash = "0xdeadbeef".to_string();

    let report = EventPersister::new(&store, 6, 2).persist(&events);

    assert_eq!(report.failed_batches(), 1);
    assert!(report.batches[0].is_err());
    assert!(report.batches[1].is_ok());
    assert_eq!(store.transaction_count().unwrap(), 2);
    assert!(store
        .transaction_by_hash(&format!("{}", tx_hash(1)))
        .unwrap()
        .is_none());
}

/// The cursor is stored in the database and survives a reopen.
#[test]
fn cursor_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokenwatch.sqlite");
    let path = path.to_str().unwrap();

    {
        let store = Store::new(path).unwrap();
        store.set_cursor(INGEST_CURSOR, 4_321).unwrap();
    }

    let reopened = Store::new(path).unwrap();
    assert_eq!(reopened.cursor(INGEST_CURSOR).unwrap(), Some(4_321));
}
