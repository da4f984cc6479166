//! Locations: the root of the entity hierarchy, one per physical store.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::model::{now_ts, Entity, Location, RowRef, SyncMeta, META_COLUMNS};
use crate::write::{expect_row, sync_write};

pub(crate) fn location_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        meta: SyncMeta::from_row(row, 0)?,
        origin_id: row.get(4)?,
        name: row.get(5)?,
        address: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

pub(crate) fn location_select() -> String {
    format!(
        "SELECT {META_COLUMNS}, origin_id, name, address, is_active, created_at FROM locations"
    )
}

/// Register a location. A fresh origin id is generated; it prefixes the
/// idempotency key of every row replicated from this location.
pub fn create_location(
    db: &LocalDb,
    name: &str,
    address: Option<&str>,
) -> Result<i64, WriteError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("Location name is required").into());
    }

    let origin_id = Uuid::new_v4().to_string();
    let local_id = sync_write(db, |tx| {
        let now = now_ts();
        tx.execute(
            "INSERT INTO locations (origin_id, name, address, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![origin_id, name, address, now],
        )?;
        let id = tx.last_insert_rowid();
        Ok((id, RowRef::new(Entity::Location, id)))
    })?;

    info!(location = local_id, origin = %origin_id, "Location created");
    Ok(local_id)
}

pub fn update_location(
    db: &LocalDb,
    local_id: i64,
    name: &str,
    address: Option<&str>,
) -> Result<(), WriteError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("Location name is required").into());
    }
    let row = RowRef::new(Entity::Location, local_id);
    sync_write(db, |tx| {
        let changed = tx.execute(
            "UPDATE locations SET name = ?1, address = ?2, updated_at = ?3 WHERE local_id = ?4",
            params![name, address, now_ts(), local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })
}

pub fn set_location_active(db: &LocalDb, local_id: i64, active: bool) -> Result<(), WriteError> {
    let row = RowRef::new(Entity::Location, local_id);
    sync_write(db, |tx| {
        let changed = tx.execute(
            "UPDATE locations SET is_active = ?1, updated_at = ?2 WHERE local_id = ?3",
            params![active as i64, now_ts(), local_id],
        )?;
        expect_row(changed, row)?;
        Ok(((), row))
    })?;
    info!(location = local_id, active, "Location active flag changed");
    Ok(())
}

pub(crate) fn load_location(conn: &Connection, local_id: i64) -> Result<Location, StoreError> {
    conn.query_row(
        &format!("{} WHERE local_id = ?1", location_select()),
        params![local_id],
        location_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: Entity::Location.label(),
        local_id,
    })
}

pub fn get_location(db: &LocalDb, local_id: i64) -> Result<Location, StoreError> {
    let conn = db.lock()?;
    load_location(&conn, local_id)
}
