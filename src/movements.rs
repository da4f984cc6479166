//! Cash inflows and expenses: drawer adjustments outside of sales.

use rusqlite::{params, Connection};
use tracing::info;

use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::model::{now_ts, CashMovement, MovementKind, RowRef, SyncMeta, META_COLUMNS};
use crate::sessions::load_session;
use crate::write::sync_write;

fn add_movement(
    db: &LocalDb,
    kind: MovementKind,
    session_id: i64,
    amount: f64,
    description: &str,
) -> Result<i64, WriteError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(StoreError::validation("Amount must be greater than zero").into());
    }
    let description = description.trim();
    if description.is_empty() {
        return Err(StoreError::validation("Description is required").into());
    }

    let entity = kind.entity();
    let local_id = sync_write(db, |tx| {
        let session = load_session(tx, session_id)?;
        if !session.is_open() {
            return Err(StoreError::validation(format!(
                "Cash session {session_id} is closed"
            )));
        }
        tx.execute(
            &format!(
                "INSERT INTO {} (session_id, amount, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                entity.table()
            ),
            params![session_id, amount, description, now_ts()],
        )?;
        let id = tx.last_insert_rowid();
        Ok((id, RowRef::new(entity, id)))
    })?;

    info!(
        movement = %RowRef::new(entity, local_id),
        session = session_id,
        amount,
        "Cash movement recorded"
    );
    Ok(local_id)
}

pub fn add_inflow(
    db: &LocalDb,
    session_id: i64,
    amount: f64,
    description: &str,
) -> Result<i64, WriteError> {
    add_movement(db, MovementKind::Inflow, session_id, amount, description)
}

pub fn add_expense(
    db: &LocalDb,
    session_id: i64,
    amount: f64,
    description: &str,
) -> Result<i64, WriteError> {
    add_movement(db, MovementKind::Expense, session_id, amount, description)
}

pub(crate) fn load_movements(
    conn: &Connection,
    kind: MovementKind,
    session_id: i64,
    unsynced_only: bool,
) -> rusqlite::Result<Vec<CashMovement>> {
    let filter = if unsynced_only { " AND is_synced = 0" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {META_COLUMNS}, session_id, amount, description, created_at
         FROM {} WHERE session_id = ?1{filter} ORDER BY local_id",
        kind.entity().table()
    ))?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(CashMovement {
                meta: SyncMeta::from_row(row, 0)?,
                kind,
                session_id: row.get(4)?,
                amount: row.get(5)?,
                description: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_movements(
    db: &LocalDb,
    kind: MovementKind,
    session_id: i64,
) -> Result<Vec<CashMovement>, StoreError> {
    let conn = db.lock()?;
    Ok(load_movements(&conn, kind, session_id, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::create_location;
    use crate::sessions::{close_session, open_session, session_totals, OpenSession};

    fn open(db: &LocalDb) -> i64 {
        let location = create_location(db, "Boulevard", None).unwrap();
        open_session(
            db,
            &OpenSession {
                location_id: location,
                starting_cash: 100.0,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_movements_adjust_expected_cash() {
        let db = LocalDb::open_in_memory().unwrap();
        let session = open(&db);

        add_inflow(&db, session, 20.0, "Change from bank").unwrap();
        add_expense(&db, session, 15.0, "Cleaning supplies").unwrap();

        let totals = session_totals(&db, session).unwrap();
        assert_eq!(totals.inflows, 20.0);
        assert_eq!(totals.expenses, 15.0);
        assert_eq!(totals.expected_cash, 105.0);

        let expenses = list_movements(&db, MovementKind::Expense, session).unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].description, "Cleaning supplies");
        assert!(!expenses[0].meta.is_synced);
    }

    #[test]
    fn test_rejects_invalid_movements() {
        let db = LocalDb::open_in_memory().unwrap();
        let session = open(&db);

        assert!(add_inflow(&db, session, 0.0, "Nothing").is_err());
        assert!(add_expense(&db, session, 5.0, "   ").is_err());

        close_session(&db, session, None).unwrap();
        let err = add_expense(&db, session, 5.0, "Late receipt").unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
