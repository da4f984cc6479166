//! Sync-aware local write path.
//!
//! Every mutation of a syncable row runs in one local transaction that
//! applies the change, marks the row unsynced, and cascades the stale mark
//! to its ancestors before committing. The remote store is never touched
//! here, so writes succeed while offline.

use rusqlite::{Transaction, TransactionBehavior};
use tracing::warn;

use crate::cascade::{invalidate_ancestors, mark_stale};
use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::model::RowRef;

/// Run `mutate` inside an immediate transaction, then mark the row it
/// reports as stale together with its ancestors.
///
/// A failed ancestor step does not roll back the mutation: the transaction
/// is still committed and `WriteError::PartialCascade` is returned.
pub(crate) fn sync_write<T>(
    db: &LocalDb,
    mutate: impl FnOnce(&Transaction<'_>) -> Result<(T, RowRef), StoreError>,
) -> Result<T, WriteError> {
    let mut conn = db.lock()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StoreError::from)?;

    // Dropping `tx` on the error paths rolls back.
    let (value, row) = mutate(&tx)?;
    mark_stale(&tx, row).map_err(StoreError::from)?;
    let cascade = invalidate_ancestors(&tx, row);

    tx.commit().map_err(StoreError::from)?;

    match cascade {
        Ok(_) => Ok(value),
        Err(failure) => {
            warn!(
                row = %row,
                failed_at = %failure.failed_at,
                error = %failure.source,
                "Write committed locally but cascade is incomplete"
            );
            Err(WriteError::PartialCascade {
                committed: row,
                failed_at: failure.failed_at,
                source: failure.source,
            })
        }
    }
}

/// Ensure a mutation touched exactly the row it targeted.
pub(crate) fn expect_row(changed: usize, row: RowRef) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound {
            entity: row.entity.label(),
            local_id: row.local_id,
        });
    }
    Ok(())
}
