//! SQLite storage layer for transfer transactions and the ingestion cursor.
//!
//! Uses WAL mode so dashboard reads proceed while ingestion writes. All
//! writes go through [`Store::unit_of_work`], which commits on `Ok` and rolls
//! back on `Err`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Mutex, MutexGuard};

use crate::types::{NewTransaction, ScoreUpdate, Transaction, WindowMetrics};

/// Cursor recording the last block whose events are fully committed.
pub const INGEST_CURSOR: &str = "last_processed_block";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const TRANSACTION_COLUMNS: &str = "id, tx_hash, log_index, from_address, to_address, raw_amount, \
     amount, timestamp, block_number, is_anomaly, anomaly_score";

pub struct Store {
    conn: Mutex<Connection>,
}

/// Writes staged inside one SQLite transaction.
pub struct UnitOfWork<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl UnitOfWork<'_> {
    /// Inserts `t` unless a row with the same `tx_hash` exists.
    ///
    /// Returns `true` if a row was inserted.
    pub fn insert_if_absent(&self, t: &NewTransaction) -> StoreResult<bool> {
        let changed = self.tx.execute(
            "
            INSERT INTO transactions (
                tx_hash, log_index, from_address, to_address, raw_amount,
                amount, timestamp, block_number
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(tx_hash) DO NOTHING
            ",
            params![
                t.tx_hash,
                t.log_index,
                t.from_address,
                t.to_address,
                t.raw_amount,
                t.amount,
                t.timestamp,
                t.block_number,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Sets the score of one row. Returns `false` if the id is unknown.
    pub fn update_score(&self, update: &ScoreUpdate) -> StoreResult<bool> {
        let changed = self.tx.execute(
            "UPDATE transactions SET anomaly_score = ?1, is_anomaly = ?2 WHERE id = ?3",
            params![update.anomaly_score, update.is_anomaly, update.id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_cursor(&self, name: &str, block_number: u64) -> StoreResult<()> {
        self.tx.execute(
            "
            INSERT INTO cursors (name, block_number) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET block_number = excluded.block_number
            ",
            params![name, block_number],
        )?;
        Ok(())
    }
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=30000;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_hash TEXT NOT NULL UNIQUE CHECK (length(tx_hash) = 66),
                log_index INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                raw_amount TEXT NOT NULL,
                amount REAL NOT NULL CHECK (amount >= 0),
                timestamp INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                is_anomaly INTEGER NOT NULL DEFAULT 0,
                anomaly_score REAL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_chain_order
                ON transactions (block_number, log_index);

            CREATE INDEX IF NOT EXISTS idx_transactions_timestamp
                ON transactions (timestamp);

            CREATE TABLE IF NOT EXISTS cursors (
                name TEXT PRIMARY KEY,
                block_number INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Runs `f` inside one SQLite transaction.
    ///
    /// Commits if `f` returns `Ok`; otherwise every write staged by `f` is
    /// rolled back when the transaction is dropped.
    pub fn unit_of_work<T, E>(
        &self,
        f: impl FnOnce(&UnitOfWork<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let uow = UnitOfWork { tx };
        let value = f(&uow)?;
        uow.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Applies all score updates atomically. Returns the number of rows changed.
    pub fn update_scores(&self, updates: &[ScoreUpdate]) -> StoreResult<usize> {
        self.unit_of_work(|uow| {
            let mut changed = 0;
            for update in updates {
                if uow.update_score(update)? {
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    pub fn cursor(&self, name: &str) -> StoreResult<Option<u64>> {
        let value = self
            .conn()?
            .query_row(
                "SELECT block_number FROM cursors WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_cursor(&self, name: &str, block_number: u64) -> StoreResult<()> {
        self.unit_of_work(|uow| uow.set_cursor(name, block_number))
    }

    pub fn transaction_count(&self) -> StoreResult<u64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn transaction_by_hash(&self, tx_hash: &str) -> StoreResult<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tx_hash = ?1");
        let found = self
            .conn()?
            .query_row(&sql, params![tx_hash], row_to_transaction)
            .optional()?;
        Ok(found)
    }

    /// The most recent `limit` transactions in chain order, oldest first.
    ///
    /// Recency is `(block_number, log_index)`; block timestamps follow block
    /// numbers, so this is also the most recent by timestamp.
    pub fn recent_transactions(&self, limit: usize) -> StoreResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             ORDER BY block_number DESC, log_index DESC LIMIT ?1"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(params![limit as i64], row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Transactions with `timestamp >= since`, newest first.
    pub fn transactions_since(
        &self,
        since: u64,
        anomalies_only: bool,
        limit: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE timestamp >= ?1 AND (?2 = 0 OR is_anomaly = 1)
             ORDER BY block_number DESC, log_index DESC LIMIT ?3"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![since, anomalies_only, limit as i64],
                row_to_transaction,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Volume, count and anomaly count of transactions with `timestamp >= since`.
    pub fn window_metrics(&self, since: u64) -> StoreResult<WindowMetrics> {
        let (total_volume, count, anomalies): (f64, i64, i64) = self.conn()?.query_row(
            "
            SELECT COALESCE(SUM(amount), 0.0), COUNT(*), COALESCE(SUM(is_anomaly), 0)
            FROM transactions WHERE timestamp >= ?1
            ",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(WindowMetrics {
            total_volume,
            transaction_count: count.max(0) as u64,
            anomaly_count: anomalies.max(0) as u64,
        })
    }
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        tx_hash: row.get(1)?,
        log_index: row.get(2)?,
        from_address: row.get(3)?,
        to_address: row.get(4)?,
        raw_amount: row.get(5)?,
        amount: row.get(6)?,
        timestamp: row.get(7)?,
        block_number: row.get(8)?,
        is_anomaly: row.get(9)?,
        anomaly_score: row.get(10)?,
    })
}
