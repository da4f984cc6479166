//! Central store kept in a SQLite database.
//!
//! Same tables as the local store minus the sync-tracking columns; every row
//! carries a UNIQUE `origin_key` instead. Used for single-site deployments,
//! integration runs, and tests.

use async_trait::async_trait;
use rusqlite::{
    params, params_from_iter, types::ToSql, Connection, OptionalExtension, Transaction,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::RemoteStore;
use crate::error::RemoteError;
use crate::model::{
    AggregatePayload, RemoteCashMovement, RemoteLocation, RemoteOperator, ReplicationReceipt,
};

pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

const REMOTE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS locations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        address TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS operators (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        location_id INTEGER NOT NULL REFERENCES locations(id),
        name TEXT NOT NULL,
        pin_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS cash_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        location_id INTEGER NOT NULL REFERENCES locations(id),
        operator_id INTEGER REFERENCES operators(id),
        opened_at TEXT NOT NULL,
        closed_at TEXT,
        starting_cash REAL NOT NULL DEFAULT 0,
        opening_notes TEXT,
        closing_notes TEXT
    );

    CREATE TABLE IF NOT EXISTS sales (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        session_id INTEGER NOT NULL REFERENCES cash_sessions(id),
        total_amount REAL NOT NULL,
        sold_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sale_line_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        sale_id INTEGER NOT NULL REFERENCES sales(id),
        product_id TEXT NOT NULL,
        product_name TEXT NOT NULL,
        quantity REAL NOT NULL CHECK (quantity > 0),
        unit_price REAL NOT NULL CHECK (unit_price >= 0)
    );

    CREATE TABLE IF NOT EXISTS cash_inflows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        session_id INTEGER NOT NULL REFERENCES cash_sessions(id),
        amount REAL NOT NULL CHECK (amount > 0),
        description TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cash_expenses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_key TEXT NOT NULL UNIQUE,
        session_id INTEGER NOT NULL REFERENCES cash_sessions(id),
        amount REAL NOT NULL CHECK (amount > 0),
        description TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_remote_sales_session ON sales(session_id);
    CREATE INDEX IF NOT EXISTS idx_remote_lines_sale ON sale_line_items(sale_id);
";

impl SqliteRemoteStore {
    pub fn open(path: &Path) -> Result<Self, RemoteError> {
        let conn = Connection::open(path).map_err(|e| {
            RemoteError::Unreachable(format!("open {}: {e}", path.display()))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_schema(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, RemoteError> {
        let conn = Connection::open_in_memory()?;
        Self::with_schema(conn, PathBuf::from(":memory:"))
    }

    fn with_schema(conn: Connection, path: PathBuf) -> Result<Self, RemoteError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(REMOTE_SCHEMA)?;
        info!(path = %path.display(), "Central SQLite store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RemoteError> {
        self.conn
            .lock()
            .map_err(|_| RemoteError::Transaction("central store lock poisoned".into()))
    }

    /// Number of rows in a central table.
    pub fn count(&self, table: &str) -> Result<i64, RemoteError> {
        let conn = self.lock()?;
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?)
    }

    /// Run `f` against the raw connection (fault injection in tests).
    #[cfg(test)]
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().expect("central store lock");
        f(&conn)
    }
}

/// Find the central row for a payload row: known remote id first, then the
/// origin key.
fn resolve(
    tx: &Transaction<'_>,
    table: &str,
    remote_id: Option<i64>,
    origin_key: &str,
) -> rusqlite::Result<Option<i64>> {
    if let Some(id) = remote_id {
        let found: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    tx.query_row(
        &format!("SELECT id FROM {table} WHERE origin_key = ?1"),
        params![origin_key],
        |row| row.get(0),
    )
    .optional()
}

/// Update the resolved row, or insert a new one. Returns the central id.
fn upsert_row(
    tx: &Transaction<'_>,
    table: &str,
    remote_id: Option<i64>,
    origin_key: &str,
    columns: &[&str],
    values: &[&dyn ToSql],
) -> rusqlite::Result<i64> {
    match resolve(tx, table, remote_id, origin_key)? {
        Some(id) => {
            let assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c} = ?{}", i + 1))
                .collect();
            let sql = format!(
                "UPDATE {table} SET {}, origin_key = ?{} WHERE id = ?{}",
                assignments.join(", "),
                columns.len() + 1,
                columns.len() + 2
            );
            let mut bound: Vec<&dyn ToSql> = values.to_vec();
            bound.push(&origin_key);
            bound.push(&id);
            tx.execute(&sql, params_from_iter(bound))?;
            Ok(id)
        }
        None => {
            let placeholders: Vec<String> =
                (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {table} ({}, origin_key) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut bound: Vec<&dyn ToSql> = values.to_vec();
            bound.push(&origin_key);
            tx.execute(&sql, params_from_iter(bound))?;
            Ok(tx.last_insert_rowid())
        }
    }
}

fn upsert_movement(
    tx: &Transaction<'_>,
    table: &str,
    session_id: i64,
    movement: &RemoteCashMovement,
) -> rusqlite::Result<i64> {
    upsert_row(
        tx,
        table,
        movement.remote_id,
        &movement.origin_key,
        &["session_id", "amount", "description", "created_at"],
        params![session_id, movement.amount, movement.description, movement.created_at],
    )
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn ping(&self) -> Result<(), RemoteError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn upsert_location(&self, location: &RemoteLocation) -> Result<i64, RemoteError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let id = upsert_row(
            &tx,
            "locations",
            location.remote_id,
            &location.origin_key,
            &["name", "address", "is_active"],
            params![location.name, location.address, location.is_active],
        )?;
        tx.commit()?;
        Ok(id)
    }

    async fn upsert_operator(&self, operator: &RemoteOperator) -> Result<i64, RemoteError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let role = operator.role.as_str();
        let id = upsert_row(
            &tx,
            "operators",
            operator.remote_id,
            &operator.origin_key,
            &["location_id", "name", "pin_hash", "role", "is_active"],
            params![
                operator.location_id,
                operator.name,
                operator.pin_hash,
                role,
                operator.is_active,
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    async fn replicate_aggregate(
        &self,
        payload: &AggregatePayload,
    ) -> Result<ReplicationReceipt, RemoteError> {
        let mut conn = self.lock()?;
        // Dropping the transaction on any error rolls back the whole subtree.
        let tx = conn.transaction()?;
        let session = &payload.session;
        let mut receipt = ReplicationReceipt::default();

        let root_id = upsert_row(
            &tx,
            "cash_sessions",
            session.remote_id,
            &session.origin_key,
            &[
                "location_id",
                "operator_id",
                "opened_at",
                "closed_at",
                "starting_cash",
                "opening_notes",
                "closing_notes",
            ],
            params![
                session.location_id,
                session.operator_id,
                session.opened_at,
                session.closed_at,
                session.starting_cash,
                session.opening_notes,
                session.closing_notes,
            ],
        )?;
        receipt.root_id = root_id;
        receipt.assigned.insert(session.origin_key.clone(), root_id);

        for sale in &payload.sales {
            let sale_id = upsert_row(
                &tx,
                "sales",
                sale.remote_id,
                &sale.origin_key,
                &["session_id", "total_amount", "sold_at"],
                params![root_id, sale.total_amount, sale.sold_at],
            )?;
            receipt.assigned.insert(sale.origin_key.clone(), sale_id);

            for line in &sale.items {
                let line_id = upsert_row(
                    &tx,
                    "sale_line_items",
                    line.remote_id,
                    &line.origin_key,
                    &["sale_id", "product_id", "product_name", "quantity", "unit_price"],
                    params![
                        sale_id,
                        line.product_id,
                        line.product_name,
                        line.quantity,
                        line.unit_price,
                    ],
                )?;
                receipt.assigned.insert(line.origin_key.clone(), line_id);
            }
        }

        for inflow in &payload.inflows {
            let id = upsert_movement(&tx, "cash_inflows", root_id, inflow)?;
            receipt.assigned.insert(inflow.origin_key.clone(), id);
        }
        for expense in &payload.expenses {
            let id = upsert_movement(&tx, "cash_expenses", root_id, expense)?;
            receipt.assigned.insert(expense.origin_key.clone(), id);
        }

        tx.commit().map_err(|e| {
            warn!(session = %session.origin_key, error = %e, "Central commit failed");
            RemoteError::Transaction(e.to_string())
        })?;
        debug!(
            session = %session.origin_key,
            rows = receipt.assigned.len(),
            "Aggregate applied to central store"
        );
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RemoteCashSession, RemoteSale, RemoteSaleLine, Role};

    fn location(key: &str) -> RemoteLocation {
        RemoteLocation {
            remote_id: None,
            origin_key: key.into(),
            name: "Boulevard".into(),
            address: None,
            is_active: true,
        }
    }

    fn payload(location_id: i64) -> AggregatePayload {
        AggregatePayload {
            session: RemoteCashSession {
                remote_id: None,
                origin_key: "o:cash_session:1".into(),
                location_id,
                operator_id: None,
                opened_at: "2026-01-01T08:00:00.000Z".into(),
                closed_at: None,
                starting_cash: 100.0,
                opening_notes: None,
                closing_notes: None,
            },
            sales: vec![RemoteSale {
                remote_id: None,
                origin_key: "o:sale:1".into(),
                total_amount: 5.0,
                sold_at: "2026-01-01T09:00:00.000Z".into(),
                items: vec![RemoteSaleLine {
                    remote_id: None,
                    origin_key: "o:sale_line_item:1".into(),
                    product_id: "p1".into(),
                    product_name: "Frame".into(),
                    quantity: 1.0,
                    unit_price: 5.0,
                }],
            }],
            inflows: vec![],
            expenses: vec![RemoteCashMovement {
                remote_id: None,
                origin_key: "o:cash_expense:1".into(),
                amount: 2.0,
                description: "Tape".into(),
                created_at: "2026-01-01T10:00:00.000Z".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_resend_by_origin_key_does_not_duplicate() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let location_id = store.upsert_location(&location("o:location:1")).await.unwrap();
        assert_eq!(
            store.upsert_location(&location("o:location:1")).await.unwrap(),
            location_id
        );

        let first = store.replicate_aggregate(&payload(location_id)).await.unwrap();
        let second = store.replicate_aggregate(&payload(location_id)).await.unwrap();
        assert_eq!(first.root_id, second.root_id);
        assert_eq!(first.assigned, second.assigned);
        assert_eq!(store.count("cash_sessions").unwrap(), 1);
        assert_eq!(store.count("sale_line_items").unwrap(), 1);
        assert_eq!(store.count("cash_expenses").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_child_rolls_back_whole_aggregate() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let location_id = store.upsert_location(&location("o:location:1")).await.unwrap();
        store.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_lines BEFORE INSERT ON sale_line_items
                 BEGIN SELECT RAISE(ABORT, 'line rejected'); END;",
            )
            .unwrap()
        });

        let err = store.replicate_aggregate(&payload(location_id)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transaction(_)));
        assert_eq!(store.count("cash_sessions").unwrap(), 0);
        assert_eq!(store.count("sales").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_known_remote_id_updates_in_place() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let location_id = store.upsert_location(&location("o:location:1")).await.unwrap();
        let mut operator = RemoteOperator {
            remote_id: None,
            origin_key: "o:operator:1".into(),
            location_id,
            name: "Maria".into(),
            pin_hash: "$2b$04$hash".into(),
            role: Role::Cashier,
            is_active: true,
        };
        let id = store.upsert_operator(&operator).await.unwrap();

        operator.remote_id = Some(id);
        operator.is_active = false;
        assert_eq!(store.upsert_operator(&operator).await.unwrap(), id);
        let active: bool = store.with_connection(|conn| {
            conn.query_row("SELECT is_active FROM operators WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .unwrap()
        });
        assert!(!active);
    }

    #[tokio::test]
    async fn test_unknown_location_is_rejected() {
        let store = SqliteRemoteStore::open_in_memory().unwrap();
        let err = store.replicate_aggregate(&payload(999)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transaction(_)));
    }
}
