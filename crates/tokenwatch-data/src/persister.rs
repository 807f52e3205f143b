//! Batched, idempotent persistence of transfer events.
//!
//! Events are split into fixed-size batches and each batch is written in its
//! own unit of work. A batch is all-or-nothing: one invalid event or storage
//! fault discards the whole batch, and later batches still run. Re-persisting
//! a known `tx_hash` is a no-op.

use alloy::primitives::{Address, B256};

use crate::store::{Store, StoreError};
use crate::types::{scale_amount, NewTransaction, TransferEvent};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("invalid event {tx_hash}: {reason}")]
    Invalid { tx_hash: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// A committed batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchStats {
    pub index: usize,
    pub inserted: usize,
    /// Events whose `tx_hash` was already stored.
    pub skipped: usize,
}

/// A batch whose unit of work was rolled back.
#[derive(Debug)]
pub struct BatchFailure {
    pub index: usize,
    pub events: usize,
    pub error: PersistError,
}

pub type BatchResult = Result<BatchStats, BatchFailure>;

/// Outcome of one [`EventPersister::persist`] call, one entry per batch.
#[derive(Debug, Default)]
pub struct PersistReport {
    pub batches: Vec<BatchResult>,
    /// Rows written by committed batches, in chain order.
    pub inserted: Vec<NewTransaction>,
    pub skipped: usize,
}

impl PersistReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.is_err()).count()
    }

    /// Whether every batch committed.
    pub fn is_complete(&self) -> bool {
        self.failed_batches() == 0
    }
}

pub struct EventPersister<'a> {
    store: &'a Store,
    decimals: u8,
    batch_size: usize,
}

impl<'a> EventPersister<'a> {
    /// `batch_size` of zero is treated as one.
    pub fn new(store: &'a Store, decimals: u8, batch_size: usize) -> Self {
        Self {
            store,
            decimals,
            batch_size: batch_size.max(1),
        }
    }

    /// Writes `events` batch by batch and reports what each batch did.
    pub fn persist(&self, events: &[TransferEvent]) -> PersistReport {
        let report = events
            .chunks(self.batch_size)
            .enumerate()
            .fold(PersistReport::default(), |mut report, (index, batch)| {
                match self.persist_batch(batch) {
                    Ok((inserted, skipped)) => {
                        let stats = BatchStats {
                            index,
                            inserted: inserted.len(),
                            skipped,
                        };
                        tracing::debug!(batch = index, inserted = stats.inserted, skipped, "batch committed");
                        report.skipped += skipped;
                        report.inserted.extend(inserted);
                        report.batches.push(Ok(stats));
                    }
                    Err(error) => {
                        tracing::warn!(batch = index, events = batch.len(), %error, "batch rolled back");
                        report.batches.push(Err(BatchFailure {
                            index,
                            events: batch.len(),
                            error,
                        }));
                    }
                }
                report
            });

        tracing::info!(
            events = events.len(),
            inserted = report.inserted_count(),
            skipped = report.skipped,
            failed_batches = report.failed_batches(),
            "persisted transfer events"
        );
        report
    }

    fn persist_batch(
        &self,
        batch: &[TransferEvent],
    ) -> Result<(Vec<NewTransaction>, usize), PersistError> {
        self.store.unit_of_work(|uow| {
            let mut inserted = Vec::new();
            let mut skipped = 0;
            for event in batch {
                let staged = stage(event, self.decimals)?;
                if uow.insert_if_absent(&staged)? {
                    inserted.push(staged);
                } else {
                    skipped += 1;
                }
            }
            Ok((inserted, skipped))
        })
    }
}

/// Validates `event` and converts it into a row.
pub fn stage(event: &TransferEvent, decimals: u8) -> Result<NewTransaction, PersistError> {
    let invalid = |reason: String| PersistError::Invalid {
        tx_hash: event.tx_hash.clone(),
        reason,
    };

    let tx_hash = event
        .tx_hash
        .parse::<B256>()
        .map_err(|e| invalid(format!("bad transaction hash: {e}")))?;
    let from = event
        .from_address
        .parse::<Address>()
        .map_err(|e| invalid(format!("bad sender address: {e}")))?;
    let to = event
        .to_address
        .parse::<Address>()
        .map_err(|e| invalid(format!("bad recipient address: {e}")))?;

    Ok(NewTransaction {
        tx_hash: format!("{tx_hash}"),
        log_index: event.log_index,
        from_address: format!("{from:#x}"),
        to_address: format!("{to:#x}"),
        raw_amount: event.raw_amount.to_string(),
        amount: scale_amount(event.raw_amount, decimals),
        timestamp: event.block_timestamp,
        block_number: event.block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    fn event(n: u64) -> TransferEvent {
        TransferEvent {
            tx_hash: format!("0x{:064x}", n),
            log_index: n % 3,
            from_address: "0x00000000000000000000000000000000000000aa".to_string(),
            to_address: "0x00000000000000000000000000000000000000bb".to_string(),
            raw_amount: U256::from(n * 1_000_000),
            block_number: 100 + n,
            block_timestamp: 1_700_000_000 + n,
        }
    }

    #[test]
    fn stage_scales_amount_and_normalizes_hex() {
        let mut e = event(2);
        e.tx_hash = e.tx_hash.to_uppercase().replace("0X", "0x");
        let staged = stage(&e, 6).expect("valid event");

        assert_eq!(staged.amount, 2.0);
        assert_eq!(staged.raw_amount, "2000000");
        assert_eq!(staged.tx_hash, format!("0x{:064x}", 2));
        assert_eq!(staged.from_address, "0x00000000000000000000000000000000000000aa");
    }

    #[test]
    fn stage_rejects_malformed_hash() {
        let mut e = event(1);
        e.tx_hash = "0xnothex".to_string();
        assert!(matches!(stage(&e, 6), Err(PersistError::Invalid { .. })));
    }

    #[test]
    fn persist_counts_new_rows_only() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let persister = EventPersister::new(&store, 6, 2);
        let events: Vec<_> = (1..=5).map(event).collect();

        let first = persister.persist(&events);
        assert_eq!(first.inserted_count(), 5);
        assert_eq!(first.batches.len(), 3);

        let second = persister.persist(&events);
        assert_eq!(second.inserted_count(), 0);
        assert_eq!(second.skipped, 5);
        assert_eq!(store.transaction_count().unwrap(), 5);
    }

    #[test]
    fn duplicate_within_one_batch_is_skipped() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let persister = EventPersister::new(&store, 6, 10);

        let report = persister.persist(&[event(1), event(1)]);

        assert_eq!(report.inserted_count(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn failing_batch_is_rolled_back_and_isolated() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let persister = EventPersister::new(&store, 6, 3);

        let mut events: Vec<_> = (1..=9).map(event).collect();
        events[4].to_address = "not-an-address".to_string();

        let report = persister.persist(&events);

        assert!(report.batches[0].is_ok());
        assert!(matches!(
            report.batches[1],
            Err(BatchFailure { index: 1, events: 3, .. })
        ));
        assert!(report.batches[2].is_ok());
        assert!(!report.is_complete());
        assert_eq!(report.inserted_count(), 6);
        // Valid neighbours of the bad event were discarded with it.
        assert!(store
            .transaction_by_hash(&format!("0x{:064x}", 4))
            .unwrap()
            .is_none());
        assert_eq!(store.transaction_count().unwrap(), 6);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let report = EventPersister::new(&store, 6, 0).persist(&[event(1), event(2)]);
        assert_eq!(report.batches.len(), 2);
    }
}
