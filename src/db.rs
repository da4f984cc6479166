//! Local SQLite store for one POS location.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared handle used by the write path and both daemons.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::StoreError;

/// Shared handle to the local database.
pub struct LocalDb {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

impl LocalDb {
    /// Open `{data_dir}/pos.db`, creating the directory if needed.
    ///
    /// On open failure the file is deleted and the open retried once, but
    /// only when it is missing or zero-length. Any file with content is kept
    /// and the open error returned, even if it cannot be inspected.
    pub fn init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("pos.db");
        info!("Opening local database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) if is_disposable(&db_path) => {
                warn!(
                    "Database open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)?
            }
            Err(e) => {
                error!(
                    "Database open failed ({}); keeping {} untouched",
                    e,
                    db_path.display()
                );
                return Err(e);
            }
        };

        run_migrations(&conn)?;
        info!("Local database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store with the full schema, for tests and tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Open the database file and apply pragmas. The busy timeout goes first so
/// the WAL switch waits out a lock held by another process.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// A database file may only be replaced when it holds nothing: the file and
/// its WAL are each missing or zero-length. Unreadable metadata counts as
/// "keep".
fn is_disposable(path: &Path) -> bool {
    let empty = |p: &Path| match fs::metadata(p) {
        Ok(meta) => meta.len() == 0,
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    };
    empty(path) && empty(&path.with_extension("db-wal"))
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| StoreError::Migration(format!("create schema_version: {e}")))?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the product catalog.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- catalog (owned centrally, cached here for sale snapshots)
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL CHECK (price >= 0),
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);
        CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::Migration(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: syncable entity hierarchy.
///
/// Every table carries `local_id` (AUTOINCREMENT, never reused), `remote_id`,
/// `is_synced`, and the local-only `sync_rev` counter. A row may only be
/// synced once it has a remote id.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS locations (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            origin_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            address TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS operators (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            location_id INTEGER NOT NULL REFERENCES locations(local_id),
            name TEXT NOT NULL,
            pin_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('cashier', 'administrative', 'sub_management', 'management')),
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS cash_sessions (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            location_id INTEGER NOT NULL REFERENCES locations(local_id),
            operator_id INTEGER REFERENCES operators(local_id) ON DELETE SET NULL,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            starting_cash REAL NOT NULL DEFAULT 0,
            opening_notes TEXT,
            closing_notes TEXT,
            updated_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS sales (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            session_id INTEGER NOT NULL REFERENCES cash_sessions(local_id) ON DELETE CASCADE,
            total_amount REAL NOT NULL,
            sold_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS sale_line_items (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            sale_id INTEGER NOT NULL REFERENCES sales(local_id) ON DELETE CASCADE,
            product_id TEXT NOT NULL,
            product_name TEXT NOT NULL,
            quantity REAL NOT NULL CHECK (quantity > 0),
            unit_price REAL NOT NULL CHECK (unit_price >= 0),
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS cash_inflows (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            session_id INTEGER NOT NULL REFERENCES cash_sessions(local_id) ON DELETE CASCADE,
            amount REAL NOT NULL CHECK (amount > 0),
            description TEXT NOT NULL,
            created_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS cash_expenses (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            remote_id INTEGER,
            is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
            sync_rev INTEGER NOT NULL DEFAULT 1,
            session_id INTEGER NOT NULL REFERENCES cash_sessions(local_id) ON DELETE CASCADE,
            amount REAL NOT NULL CHECK (amount > 0),
            description TEXT NOT NULL,
            created_at TEXT NOT NULL,
            CHECK (is_synced = 0 OR remote_id IS NOT NULL)
        );

        -- At most one open session per location.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_sessions_one_open
            ON cash_sessions(location_id) WHERE closed_at IS NULL;

        CREATE INDEX IF NOT EXISTS idx_locations_sync ON locations(is_synced, local_id);
        CREATE INDEX IF NOT EXISTS idx_operators_sync ON operators(is_synced, local_id);
        CREATE INDEX IF NOT EXISTS idx_cash_sessions_sync ON cash_sessions(is_synced, local_id);
        CREATE INDEX IF NOT EXISTS idx_sales_session ON sales(session_id, is_synced);
        CREATE INDEX IF NOT EXISTS idx_sales_sold_at ON sales(sold_at);
        CREATE INDEX IF NOT EXISTS idx_sale_line_items_sale ON sale_line_items(sale_id, is_synced);
        CREATE INDEX IF NOT EXISTS idx_cash_inflows_session ON cash_inflows(session_id, is_synced);
        CREATE INDEX IF NOT EXISTS idx_cash_expenses_session ON cash_expenses(session_id, is_synced);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::Migration(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (sync tables)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn insert_location(conn: &Connection) -> i64 {
        conn.execute(
            "INSERT INTO locations (origin_id, name, created_at, updated_at)
             VALUES ('origin-1', 'Boulevard', datetime('now'), datetime('now'))",
            [],
        )
        .expect("insert location");
        conn.last_insert_rowid()
    }

    #[test]
    fn test_migrations_create_sync_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for table in [
            "local_settings",
            "categories",
            "products",
            "locations",
            "operators",
            "cash_sessions",
            "sales",
            "sale_line_items",
            "cash_inflows",
            "cash_expenses",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        // Running again is a no-op.
        run_migrations(&conn).expect("idempotent migrations");
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_synced_row_requires_remote_id() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        let location_id = insert_location(&conn);

        let bad = conn.execute(
            "UPDATE locations SET is_synced = 1 WHERE local_id = ?1",
            params![location_id],
        );
        assert!(bad.is_err(), "synced without remote_id should be rejected");

        conn.execute(
            "UPDATE locations SET is_synced = 1, remote_id = 40 WHERE local_id = ?1",
            params![location_id],
        )
        .expect("synced with remote_id");
    }

    #[test]
    fn test_local_ids_are_not_reused_after_delete() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        let location_id = insert_location(&conn);

        let open_session = |conn: &Connection| {
            conn.execute(
                "INSERT INTO cash_sessions (location_id, opened_at, closed_at, updated_at)
                 VALUES (?1, datetime('now'), datetime('now'), datetime('now'))",
                params![location_id],
            )
            .unwrap();
            conn.last_insert_rowid()
        };

        let first = open_session(&conn);
        conn.execute("DELETE FROM cash_sessions WHERE local_id = ?1", params![first])
            .unwrap();
        let second = open_session(&conn);
        assert!(second > first);
    }

    #[test]
    fn test_only_one_open_session_per_location() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        let location_id = insert_location(&conn);

        let insert_open = |conn: &Connection| {
            conn.execute(
                "INSERT INTO cash_sessions (location_id, opened_at, updated_at)
                 VALUES (?1, datetime('now'), datetime('now'))",
                params![location_id],
            )
        };
        insert_open(&conn).expect("first open session");
        assert!(insert_open(&conn).is_err(), "second open session should be rejected");
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "sync", "interval_secs", "30").expect("set");
        assert_eq!(
            get_setting(&conn, "sync", "interval_secs"),
            Some("30".to_string())
        );

        set_setting(&conn, "sync", "interval_secs", "45").expect("update");
        assert_eq!(
            get_setting(&conn, "sync", "interval_secs"),
            Some("45".to_string())
        );

        delete_all_settings(&conn, "sync").expect("delete");
        assert!(get_setting(&conn, "sync", "interval_secs").is_none());
    }

    fn temp_data_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pos-sync-db-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn test_init_keeps_locked_database_with_sales() {
        let dir = temp_data_dir();
        let db_path = dir.join("pos.db");
        {
            let conn = Connection::open(&db_path).expect("create file");
            conn.execute_batch(
                "CREATE TABLE sales (local_id INTEGER PRIMARY KEY, total_amount REAL);
                 INSERT INTO sales (total_amount) VALUES (50.0), (30.0);",
            )
            .expect("seed sales");
        }

        let holder = Connection::open(&db_path).expect("second connection");
        holder.execute_batch("BEGIN EXCLUSIVE").expect("exclusive lock");

        assert!(LocalDb::init(&dir).is_err(), "locked file must not be replaced");

        holder.execute_batch("COMMIT").expect("release lock");
        drop(holder);

        let conn = Connection::open(&db_path).expect("reopen");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales", [], |r| r.get(0))
            .expect("sales survive");
        assert_eq!(count, 2);

        drop(conn);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_init_keeps_unreadable_file() {
        let dir = temp_data_dir();
        let db_path = dir.join("pos.db");
        let garbage = b"this is not a sqlite database, but it is somebody's data".repeat(20);
        fs::write(&db_path, &garbage).expect("write file");

        assert!(LocalDb::init(&dir).is_err());
        assert_eq!(fs::read(&db_path).expect("file kept"), garbage);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_init_creates_fresh_database() {
        let dir = temp_data_dir();
        fs::write(dir.join("pos.db"), b"").expect("empty file");

        let db = LocalDb::init(&dir).expect("init");
        let tables = table_names(&db.lock().expect("lock"));
        assert!(tables.contains(&"sales".to_string()));

        drop(db);
        fs::remove_dir_all(&dir).ok();
    }
}
