//! Sales and their line items.
//!
//! Line items snapshot the product name and unit price at sale time, so later
//! catalog changes never alter a recorded sale.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tracing::info;

use crate::catalog::load_product;
use crate::db::LocalDb;
use crate::error::{StoreError, WriteError};
use crate::model::{now_ts, Entity, RowRef, Sale, SaleLineItem, SyncMeta, META_COLUMNS};
use crate::sessions::load_session;
use crate::write::sync_write;

/// Tolerance when comparing a given total against the line sum.
const TOTAL_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSale {
    /// Required for sales without lines; checked against the lines otherwise.
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub items: Vec<NewSaleLine>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSaleLine {
    pub product_id: String,
    pub quantity: f64,
}

fn line_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SaleLineItem> {
    Ok(SaleLineItem {
        meta: SyncMeta::from_row(row, 0)?,
        sale_id: row.get(4)?,
        product_id: row.get(5)?,
        product_name: row.get(6)?,
        quantity: row.get(7)?,
        unit_price: row.get(8)?,
    })
}

fn sale_header_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        meta: SyncMeta::from_row(row, 0)?,
        session_id: row.get(4)?,
        total_amount: row.get(5)?,
        sold_at: row.get(6)?,
        items: Vec::new(),
    })
}

fn load_lines(conn: &Connection, sale_id: i64) -> rusqlite::Result<Vec<SaleLineItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {META_COLUMNS}, sale_id, product_id, product_name, quantity, unit_price
         FROM sale_line_items WHERE sale_id = ?1 ORDER BY local_id"
    ))?;
    let lines = stmt
        .query_map(params![sale_id], line_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

/// Sales of a session with their lines, in creation order.
///
/// With `unsynced_only`, returns only sales that are stale themselves or
/// carry a stale line.
pub(crate) fn load_sales_for_session(
    conn: &Connection,
    session_id: i64,
    unsynced_only: bool,
) -> rusqlite::Result<Vec<Sale>> {
    let filter = if unsynced_only {
        " AND (s.is_synced = 0 OR EXISTS (
               SELECT 1 FROM sale_line_items li WHERE li.sale_id = s.local_id AND li.is_synced = 0))"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT s.local_id, s.remote_id, s.is_synced, s.sync_rev, s.session_id, s.total_amount, s.sold_at
         FROM sales s WHERE s.session_id = ?1{filter} ORDER BY s.local_id"
    ))?;
    let mut sales = stmt
        .query_map(params![session_id], sale_header_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for sale in &mut sales {
        sale.items = load_lines(conn, sale.meta.local_id)?;
    }
    Ok(sales)
}

/// Record a sale under an open session.
pub fn create_sale(db: &LocalDb, session_id: i64, sale: &NewSale) -> Result<i64, WriteError> {
    for line in &sale.items {
        if !line.quantity.is_finite() || line.quantity <= 0.0 {
            return Err(StoreError::validation(format!(
                "Quantity for product {} must be positive",
                line.product_id
            ))
            .into());
        }
    }

    let (local_id, total) = sync_write(db, |tx| {
        let session = load_session(tx, session_id)?;
        if !session.is_open() {
            return Err(StoreError::validation(format!(
                "Cash session {session_id} is closed"
            )));
        }

        let mut snapshots = Vec::with_capacity(sale.items.len());
        for line in &sale.items {
            let product = load_product(tx, &line.product_id)?
                .filter(|p| p.is_active)
                .ok_or_else(|| {
                    StoreError::validation(format!(
                        "Product {} is not available",
                        line.product_id
                    ))
                })?;
            snapshots.push((product, line.quantity));
        }

        let line_total: f64 = snapshots.iter().map(|(p, qty)| p.price * qty).sum();
        let total = match (sale.total_amount, snapshots.is_empty()) {
            (Some(given), true) => given,
            (None, true) => {
                return Err(StoreError::validation(
                    "A sale without items needs an explicit total",
                ))
            }
            (Some(given), false) if (given - line_total).abs() > TOTAL_EPSILON => {
                return Err(StoreError::validation(format!(
                    "Sale total {given:.2} does not match line items ({line_total:.2})"
                )))
            }
            (_, false) => line_total,
        };
        if !total.is_finite() || total < 0.0 {
            return Err(StoreError::validation("Sale total must be zero or more"));
        }

        tx.execute(
            "INSERT INTO sales (session_id, total_amount, sold_at) VALUES (?1, ?2, ?3)",
            params![session_id, total, now_ts()],
        )?;
        let id = tx.last_insert_rowid();

        let mut insert_line = tx.prepare(
            "INSERT INTO sale_line_items (sale_id, product_id, product_name, quantity, unit_price)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (product, quantity) in &snapshots {
            insert_line.execute(params![id, product.id, product.name, quantity, product.price])?;
        }

        Ok(((id, total), RowRef::new(Entity::Sale, id)))
    })?;

    info!(
        sale = local_id,
        session = session_id,
        total,
        lines = sale.items.len(),
        "Sale recorded"
    );
    Ok(local_id)
}

pub fn get_sale(db: &LocalDb, local_id: i64) -> Result<Sale, StoreError> {
    let conn = db.lock()?;
    let mut sale = conn
        .query_row(
            &format!(
                "SELECT {META_COLUMNS}, session_id, total_amount, sold_at FROM sales WHERE local_id = ?1"
            ),
            params![local_id],
            sale_header_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: Entity::Sale.label(),
            local_id,
        })?;
    sale.items = load_lines(&conn, local_id)?;
    Ok(sale)
}

pub fn list_sales(db: &LocalDb, session_id: i64) -> Result<Vec<Sale>, StoreError> {
    let conn = db.lock()?;
    Ok(load_sales_for_session(&conn, session_id, false)?)
}
