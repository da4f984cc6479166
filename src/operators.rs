//! Operators: cashier/admin identities belonging to a location.
//!
//! PINs are short numeric codes stored as bcrypt hashes.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::locations::load_location;
use crate::model::{now_ts, Entity, Operator, Role, RowRef, SyncMeta, META_COLUMNS};
use crate::write::{expect_row, sync_write};

const PIN_HASH_COST: u32 = if cfg!(test) { 4 } else { bcrypt::DEFAULT_COST };

pub(crate) fn operator_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operator> {
    let raw_role: String = row.get(7)?;
    let role = Role::parse(&raw_role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown role {raw_role}").into(),
        )
    })?;
    Ok(Operator {
        meta: SyncMeta::from_row(row, 0)?,
        location_id: row.get(4)?,
        name: row.get(5)?,
        pin_hash: row.get(6)?,
        role,
        is_active: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

pub(crate) fn operator_select() -> String {
    format!(
        "SELECT {META_COLUMNS}, location_id, name, pin_hash, role, is_active, created_at FROM operators"
    )
}

fn validate_pin(pin: &str) -> Result<(), StoreError> {
    if !(4..=6).contains(&pin.len()) {
        return Err(StoreError::validation("PIN must be 4 to 6 digits"));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(StoreError::validation("PIN must contain only digits"));
    }
    Ok(())
}

pub fn create_operator(
    db: &LocalDb,
    location_id: i64,
    name: &str,
    pin: &str,
    role: Role,
) -> Result<i64, WriteError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("Operator name is required").into());
    }
    validate_pin(pin)?;
    // Hash before taking the connection lock; bcrypt is deliberately slow.
    let pin_hash = bcrypt::hash(pin, PIN_HASH_COST)
        .map_err(|e| StoreError::validation(format!("Failed to hash PIN: {e}")))?;

    let local_id = sync_write(db, |tx| {
        let location = load_location(tx, location_id)?;
        if !location.is_active {
            return Err(StoreError::validation(format!(
                "Location {location_id} is inactive"
            )));
        }
        let now = now_ts();
        tx.execute(
            "INSERT INTO operators (location_id, name, pin_hash, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![location_id, name, pin_hash, role.as_str(), now],
        )?;
        let id = tx.last_insert_rowid();
        Ok((id, RowRef::new(Entity::Operator, id)))
    })?;

    info!(operator = local_id, location = location_id, role = role.as_str(), "Operator created");
    Ok(local_id)
}

pub fn set_operator_active(db: &LocalDb, local_id: i64, active: bool) -> Result<(), WriteError> {
    let row = RowRef::new(Entity::Operator, local_id);
    sync_write(db, |tx| {
        let changed = tx.execute(
            "UPDATE operators SET is_active = ?1, updated_at = ?2 WHERE local_id = ?3",
            params![active as i64, now_ts(), local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })
}

pub(crate) fn load_operator(conn: &Connection, local_id: i64) -> Result<Operator, StoreError> {
    conn.query_row(
        &format!("{} WHERE local_id = ?1", operator_select()),
        params![local_id],
        operator_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: Entity::Operator.label(),
        local_id,
    })
}

pub fn get_operator(db: &LocalDb, local_id: i64) -> Result<Operator, StoreError> {
    let conn = db.lock()?;
    load_operator(&conn, local_id)
}

pub fn list_operators(db: &LocalDb, location_id: i64) -> Result<Vec<Operator>, StoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE location_id = ?1 ORDER BY local_id",
        operator_select()
    ))?;
    let operators = stmt
        .query_map(params![location_id], operator_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(operators)
}

/// Find the active operator of a location whose PIN matches. Read-only.
pub fn verify_operator_pin(
    db: &LocalDb,
    location_id: i64,
    pin: &str,
) -> Result<Option<Operator>, StoreError> {
    validate_pin(pin)?;
    let candidates: Vec<Operator> = list_operators(db, location_id)?
        .into_iter()
        .filter(|op| op.is_active)
        .collect();

    for operator in candidates {
        match bcrypt::verify(pin, &operator.pin_hash) {
            Ok(true) => return Ok(Some(operator)),
            Ok(false) => {}
            Err(e) => warn!(
                operator = operator.meta.local_id,
                error = %e,
                "Stored PIN hash is invalid"
            ),
        }
    }
    Ok(None)
}
