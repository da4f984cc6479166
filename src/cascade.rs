//! Cascade invalidation.
//!
//! Any mutation to a child row marks every ancestor up to the location as
//! unsynced, strictly bottom-up. Each ancestor update runs in its own
//! savepoint so a failing step leaves the closer ancestors marked. The flag
//! transition is idempotent; `sync_rev` always advances so an in-flight sync
//! cycle can tell the row changed under it.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::model::RowRef;

/// First ancestor that could not be marked stale.
#[derive(Debug)]
pub struct CascadeFailure {
    pub failed_at: RowRef,
    pub source: rusqlite::Error,
}

/// Mark a single row unsynced and advance its revision.
pub(crate) fn mark_stale(conn: &Connection, row: RowRef) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "UPDATE {} SET is_synced = 0, sync_rev = sync_rev + 1 WHERE local_id = ?1",
            row.entity.table()
        ),
        params![row.local_id],
    )
}

/// Resolve the parent row through the entity's foreign-key column.
pub fn parent_of(conn: &Connection, row: RowRef) -> rusqlite::Result<Option<RowRef>> {
    let Some((parent, column)) = row.entity.parent() else {
        return Ok(None);
    };
    let parent_id: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT {column} FROM {} WHERE local_id = ?1",
                row.entity.table()
            ),
            params![row.local_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(parent_id.map(|id| RowRef::new(parent, id)))
}

/// Walk from `row` (exclusive) to the root, marking each ancestor stale.
///
/// Every step is attempted even after a failure; the first failure is
/// returned. Returns the ancestors that were marked, closest first.
pub fn invalidate_ancestors(
    conn: &Connection,
    row: RowRef,
) -> Result<Vec<RowRef>, CascadeFailure> {
    let mut marked = Vec::new();
    let mut first_failure: Option<CascadeFailure> = None;
    let mut current = row;

    loop {
        let parent = match parent_of(conn, current) {
            Ok(Some(parent)) => parent,
            Ok(None) => break,
            Err(source) => {
                warn!(row = %current, error = %source, "Cascade could not resolve parent");
                first_failure.get_or_insert(CascadeFailure {
                    failed_at: current,
                    source,
                });
                break;
            }
        };

        match stale_step(conn, parent) {
            Ok(()) => marked.push(parent),
            Err(source) => {
                warn!(row = %parent, error = %source, "Cascade step failed");
                first_failure.get_or_insert(CascadeFailure {
                    failed_at: parent,
                    source,
                });
            }
        }
        current = parent;
    }

    match first_failure {
        Some(failure) => Err(failure),
        None => {
            debug!(row = %row, ancestors = marked.len(), "Cascade complete");
            Ok(marked)
        }
    }
}

/// One best-effort ancestor update inside its own savepoint.
fn stale_step(conn: &Connection, row: RowRef) -> rusqlite::Result<()> {
    conn.execute_batch("SAVEPOINT cascade_step")?;
    match mark_stale(conn, row) {
        Ok(_) => conn.execute_batch("RELEASE cascade_step"),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO cascade_step; RELEASE cascade_step");
            Err(e)
        }
    }
}

/// Mark `row` and all of its ancestors stale in one local transaction.
///
/// Same commit rule as the write path: a failed ancestor step is reported
/// as `PartialCascade` after the remaining marks are committed.
pub fn invalidate(db: &LocalDb, row: RowRef) -> Result<Vec<RowRef>, WriteError> {
    let mut conn = db.lock()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StoreError::from)?;
    mark_stale(&tx, row).map_err(StoreError::from)?;
    let cascade = invalidate_ancestors(&tx, row);
    tx.commit().map_err(StoreError::from)?;

    cascade.map_err(|f| WriteError::PartialCascade {
        committed: row,
        failed_at: f.failed_at,
        source: f.source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;

    fn seed(db: &LocalDb) -> (i64, i64, i64) {
        let conn = db.lock().unwrap();
        conn.execute_batch(
            "INSERT INTO locations (origin_id, name, remote_id, is_synced, created_at, updated_at)
                 VALUES ('origin-1', 'Boulevard', 1, 1, '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z');
             INSERT INTO cash_sessions (location_id, opened_at, remote_id, is_synced, updated_at)
                 VALUES (1, '2026-01-01T08:00:00.000Z', 2, 1, '2026-01-01T08:00:00.000Z');
             INSERT INTO sales (session_id, total_amount, sold_at, remote_id, is_synced)
                 VALUES (1, 10.0, '2026-01-01T09:00:00.000Z', 3, 1);",
        )
        .unwrap();
        (1, 1, 1)
    }

    fn flags(db: &LocalDb, entity: Entity, id: i64) -> (bool, i64) {
        let conn = db.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT is_synced, sync_rev FROM {} WHERE local_id = ?1",
                entity.table()
            ),
            params![id],
            |r| Ok((r.get::<_, i64>(0)? != 0, r.get(1)?)),
        )
        .unwrap()
    }

    #[test]
    fn test_child_mutation_marks_every_ancestor_stale() {
        let db = LocalDb::open_in_memory().unwrap();
        let (location, session, sale) = seed(&db);

        let marked = invalidate(&db, RowRef::new(Entity::Sale, sale)).unwrap();
        assert_eq!(
            marked,
            vec![
                RowRef::new(Entity::CashSession, session),
                RowRef::new(Entity::Location, location)
            ]
        );
        assert!(!flags(&db, Entity::Sale, sale).0);
        assert!(!flags(&db, Entity::CashSession, session).0);
        assert!(!flags(&db, Entity::Location, location).0);
    }

    #[test]
    fn test_marking_stale_twice_keeps_flag_and_advances_revision() {
        let db = LocalDb::open_in_memory().unwrap();
        let (_, session, sale) = seed(&db);

        invalidate(&db, RowRef::new(Entity::Sale, sale)).unwrap();
        let (synced_once, rev_once) = flags(&db, Entity::CashSession, session);
        invalidate(&db, RowRef::new(Entity::Sale, sale)).unwrap();
        let (synced_twice, rev_twice) = flags(&db, Entity::CashSession, session);

        assert!(!synced_once);
        assert_eq!(synced_once, synced_twice);
        assert!(rev_twice > rev_once);
    }

    #[test]
    fn test_failed_step_keeps_closer_ancestors_and_continues_upward() {
        let db = LocalDb::open_in_memory().unwrap();
        let (location, session, sale) = seed(&db);
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_session_stale BEFORE UPDATE OF is_synced ON cash_sessions
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let err = invalidate(&db, RowRef::new(Entity::Sale, sale)).unwrap_err();
        match err {
            WriteError::PartialCascade {
                committed,
                failed_at,
                ..
            } => {
                assert_eq!(committed, RowRef::new(Entity::Sale, sale));
                assert_eq!(failed_at, RowRef::new(Entity::CashSession, session));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!flags(&db, Entity::Sale, sale).0);
        assert!(flags(&db, Entity::CashSession, session).0);
        // The grandparent is still attempted.
        assert!(!flags(&db, Entity::Location, location).0);
    }

    #[test]
    fn test_failed_row_update_marks_no_ancestor() {
        let db = LocalDb::open_in_memory().unwrap();
        let (location, session, sale) = seed(&db);
        let rev_before = flags(&db, Entity::CashSession, session).1;
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_sale_stale BEFORE UPDATE OF is_synced ON sales
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let err = invalidate(&db, RowRef::new(Entity::Sale, sale)).unwrap_err();
        assert!(matches!(err, WriteError::Store(_)));
        assert_eq!(flags(&db, Entity::CashSession, session), (true, rev_before));
        assert!(flags(&db, Entity::Location, location).0);
    }

    #[test]
    fn test_parent_of_root_is_none() {
        let db = LocalDb::open_in_memory().unwrap();
        let (location, _, _) = seed(&db);
        let conn = db.lock().unwrap();
        assert!(parent_of(&conn, RowRef::new(Entity::Location, location))
            .unwrap()
            .is_none());
    }
}
