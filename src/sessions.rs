//! Cash sessions: one open/close cycle of a location's cash drawer.
//!
//! A cash session is the root of each replicated aggregate. A location has at
//! most one open session at a time.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::locations::load_location;
use crate::model::{now_ts, CashSession, Entity, RowRef, SyncMeta, META_COLUMNS};
use crate::operators::load_operator;
use crate::write::{expect_row, sync_write};

pub(crate) fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CashSession> {
    Ok(CashSession {
        meta: SyncMeta::from_row(row, 0)?,
        location_id: row.get(4)?,
        operator_id: row.get(5)?,
        opened_at: row.get(6)?,
        closed_at: row.get(7)?,
        starting_cash: row.get(8)?,
        opening_notes: row.get(9)?,
        closing_notes: row.get(10)?,
    })
}

pub(crate) fn session_select() -> String {
    format!(
        "SELECT {META_COLUMNS}, location_id, operator_id, opened_at, closed_at,
                starting_cash, opening_notes, closing_notes
         FROM cash_sessions"
    )
}

/// Parameters for opening a drawer.
#[derive(Debug, Clone, Default)]
pub struct OpenSession {
    pub location_id: i64,
    pub operator_id: Option<i64>,
    pub starting_cash: f64,
    pub opening_notes: Option<String>,
}

/// Drawer totals for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTotals {
    pub starting_cash: f64,
    pub sales: f64,
    pub inflows: f64,
    pub expenses: f64,
    pub expected_cash: f64,
}

fn open_session_id(conn: &Connection, location_id: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT local_id FROM cash_sessions WHERE location_id = ?1 AND closed_at IS NULL LIMIT 1",
        params![location_id],
        |row| row.get(0),
    )
    .optional()
}

/// Open a cash session. Fails if the location already has an open one.
pub fn open_session(db: &LocalDb, request: &OpenSession) -> Result<i64, WriteError> {
    if !request.starting_cash.is_finite() || request.starting_cash < 0.0 {
        return Err(StoreError::validation("Starting cash must be zero or more").into());
    }

    let local_id = sync_write(db, |tx| {
        let location = load_location(tx, request.location_id)?;
        if !location.is_active {
            return Err(StoreError::validation(format!(
                "Location {} is inactive",
                request.location_id
            )));
        }
        if let Some(operator_id) = request.operator_id {
            let operator = load_operator(tx, operator_id)?;
            if operator.location_id != request.location_id || !operator.is_active {
                return Err(StoreError::validation(format!(
                    "Operator {operator_id} cannot open a session at location {}",
                    request.location_id
                )));
            }
        }
        if let Some(existing) = open_session_id(tx, request.location_id)? {
            return Err(StoreError::validation(format!(
                "Location {} already has an open cash session ({existing})",
                request.location_id
            )));
        }

        let now = now_ts();
        tx.execute(
            "INSERT INTO cash_sessions (
                location_id, operator_id, opened_at, starting_cash, opening_notes, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?3)",
            params![
                request.location_id,
                request.operator_id,
                now,
                request.starting_cash,
                request.opening_notes,
            ],
        )?;
        let id = tx.last_insert_rowid();
        Ok((id, RowRef::new(Entity::CashSession, id)))
    })?;

    info!(
        session = local_id,
        location = request.location_id,
        starting_cash = request.starting_cash,
        "Cash session opened"
    );
    Ok(local_id)
}

/// Close an open session, recording the closing time and notes.
pub fn close_session(
    db: &LocalDb,
    local_id: i64,
    closing_notes: Option<&str>,
) -> Result<(), WriteError> {
    let row = RowRef::new(Entity::CashSession, local_id);
    sync_write(db, |tx| {
        let session = load_session(tx, local_id)?;
        if !session.is_open() {
            return Err(StoreError::validation(format!(
                "Cash session {local_id} is already closed"
            )));
        }
        let now = now_ts();
        let changed = tx.execute(
            "UPDATE cash_sessions SET closed_at = ?1, closing_notes = ?2, updated_at = ?1
             WHERE local_id = ?3",
            params![now, closing_notes, local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })?;
    info!(session = local_id, "Cash session closed");
    Ok(())
}

/// Reopen a closed session, provided no other session of its location is open.
pub fn reopen_session(db: &LocalDb, local_id: i64) -> Result<(), WriteError> {
    let row = RowRef::new(Entity::CashSession, local_id);
    sync_write(db, |tx| {
        let session = load_session(tx, local_id)?;
        if session.is_open() {
            return Err(StoreError::validation(format!(
                "Cash session {local_id} is already open"
            )));
        }
        if let Some(existing) = open_session_id(tx, session.location_id)? {
            return Err(StoreError::validation(format!(
                "Location {} already has an open cash session ({existing})",
                session.location_id
            )));
        }
        let changed = tx.execute(
            "UPDATE cash_sessions SET closed_at = NULL, closing_notes = NULL, updated_at = ?1
             WHERE local_id = ?2",
            params![now_ts(), local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })?;
    info!(session = local_id, "Cash session reopened");
    Ok(())
}

pub fn update_session_notes(
    db: &LocalDb,
    local_id: i64,
    opening_notes: Option<&str>,
    closing_notes: Option<&str>,
) -> Result<(), WriteError> {
    let row = RowRef::new(Entity::CashSession, local_id);
    sync_write(db, |tx| {
        let changed = tx.execute(
            "UPDATE cash_sessions SET opening_notes = ?1, closing_notes = ?2, updated_at = ?3
             WHERE local_id = ?4",
            params![opening_notes, closing_notes, now_ts(), local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })
}

pub(crate) fn load_session(conn: &Connection, local_id: i64) -> Result<CashSession, StoreError> {
    conn.query_row(
        &format!("{} WHERE local_id = ?1", session_select()),
        params![local_id],
        session_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: Entity::CashSession.label(),
        local_id,
    })
}

pub fn get_session(db: &LocalDb, local_id: i64) -> Result<CashSession, StoreError> {
    let conn = db.lock()?;
    load_session(&conn, local_id)
}

/// The currently open session of a location, if any.
pub fn open_session_for_location(
    db: &LocalDb,
    location_id: i64,
) -> Result<Option<CashSession>, StoreError> {
    let conn = db.lock()?;
    match open_session_id(&conn, location_id)? {
        Some(id) => Ok(Some(load_session(&conn, id)?)),
        None => Ok(None),
    }
}

/// Expected drawer cash: starting cash + sales + inflows - expenses.
pub fn session_totals(db: &LocalDb, local_id: i64) -> Result<SessionTotals, StoreError> {
    let conn = db.lock()?;
    let session = load_session(&conn, local_id)?;
    let sum = |sql: &str| -> rusqlite::Result<f64> {
        conn.query_row(sql, params![local_id], |row| row.get(0))
    };
    let sales = sum("SELECT COALESCE(SUM(total_amount), 0) FROM sales WHERE session_id = ?1")?;
    let inflows = sum("SELECT COALESCE(SUM(amount), 0) FROM cash_inflows WHERE session_id = ?1")?;
    let expenses = sum("SELECT COALESCE(SUM(amount), 0) FROM cash_expenses WHERE session_id = ?1")?;

    Ok(SessionTotals {
        starting_cash: session.starting_cash,
        sales,
        inflows,
        expenses,
        expected_cash: session.starting_cash + sales + inflows - expenses,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::create_location;
    use crate::model::Role;
    use crate::operators::create_operator;

    fn setup() -> (LocalDb, i64) {
        let db = LocalDb::open_in_memory().unwrap();
        let location = create_location(&db, "Boulevard", None).unwrap();
        (db, location)
    }

    fn open(db: &LocalDb, location_id: i64, starting_cash: f64) -> Result<i64, WriteError> {
        open_session(
            db,
            &OpenSession {
                location_id,
                starting_cash,
                opening_notes: Some("morning".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_open_close_reopen_lifecycle() {
        let (db, location) = setup();
        let id = open(&db, location, 100.0).unwrap();

        let session = get_session(&db, id).unwrap();
        assert!(session.is_open());
        assert_eq!(session.starting_cash, 100.0);
        assert_eq!(
            open_session_for_location(&db, location).unwrap().map(|s| s.meta.local_id),
            Some(id)
        );

        close_session(&db, id, Some("counted")).unwrap();
        let session = get_session(&db, id).unwrap();
        assert!(session.closed_at.is_some());
        assert_eq!(session.closing_notes.as_deref(), Some("counted"));
        assert!(close_session(&db, id, None).is_err());

        reopen_session(&db, id).unwrap();
        assert!(get_session(&db, id).unwrap().is_open());
    }

    #[test]
    fn test_second_open_session_is_rejected() {
        let (db, location) = setup();
        let first = open(&db, location, 50.0).unwrap();
        let err = open(&db, location, 20.0).unwrap_err();
        assert!(err.to_string().contains("already has an open cash session"));

        close_session(&db, first, None).unwrap();
        let second = open(&db, location, 20.0).unwrap();
        assert!(reopen_session(&db, first).is_err());
        assert!(second > first);
    }

    #[test]
    fn test_session_write_marks_location_stale() {
        let (db, location) = setup();
        let id = open(&db, location, 10.0).unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute_batch(
                "UPDATE locations SET remote_id = 1, is_synced = 1;
                 UPDATE cash_sessions SET remote_id = 2, is_synced = 1;",
            )
            .unwrap();
        }

        update_session_notes(&db, id, Some("recount"), None).unwrap();
        let session = get_session(&db, id).unwrap();
        assert!(!session.meta.is_synced);
        assert_eq!(session.meta.remote_id, Some(2));
        let location = crate::locations::get_location(&db, location).unwrap();
        assert!(!location.meta.is_synced);
    }

    #[test]
    fn test_operator_must_belong_to_location() {
        let (db, location) = setup();
        let other = create_location(&db, "PhotoStation", None).unwrap();
        let operator = create_operator(&db, other, "Carlos", "5555", Role::Administrative).unwrap();

        let err = open_session(
            &db,
            &OpenSession {
                location_id: location,
                operator_id: Some(operator),
                starting_cash: 0.0,
                opening_notes: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot open a session"));
        assert!(open(&db, location, -1.0).is_err());
    }
}
