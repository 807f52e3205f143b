//! Hand-off of persisted transactions as JSON blobs.
//!
//! Each blob is keyed `transactions/<timestamp>.json`, where the timestamp is
//! that of the first transaction in the batch (`default` when there is none).
//! The directory stands in for an object-store bucket.

use eyre::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Object key for a batch whose first transaction has `first_timestamp`.
pub fn blob_key(first_timestamp: Option<u64>) -> String {
    match first_timestamp {
        Some(ts) => format!("transactions/{ts}.json"),
        None => "transactions/default.json".to_string(),
    }
}

/// Serializes `transactions` under `root` and returns the written path.
///
/// # Errors
/// Returns error if serialization or any file operation fails.
#[tracing::instrument(skip(transactions), fields(count = transactions.len()))]
pub async fn export_batch<T: Serialize>(
    root: &Path,
    first_timestamp: Option<u64>,
    transactions: &[T],
) -> Result<PathBuf> {
    let path = root.join(blob_key(first_timestamp));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .wrap_err_with(|| format!("failed to create export directory: {}", parent.display()))?;
    }

    let body = serde_json::to_vec_pretty(transactions).wrap_err("failed to serialize batch")?;
    let mut file = tokio::fs::File::create(&path)
        .await
        .wrap_err_with(|| format!("failed to create file: {}", path.display()))?;
    file.write_all(&body)
        .await
        .wrap_err("failed to write export blob")?;
    file.flush().await.wrap_err("failed to flush export blob")?;

    tracing::info!(path = %path.display(), bytes = body.len(), "exported transaction batch");
    Ok(path)
}
