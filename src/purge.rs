//! Purge daemon cycle.
//!
//! Deletes local rows that are synced and older than the retention window.
//! Each entity type is purged by its own statement; a failing type is logged
//! and the others still run. Unsynced rows are never deleted, whatever their
//! age. Cash sessions go last and only once no child row remains, so a
//! session delete never cascades into rows that were kept.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::db::LocalDb;
use crate::model::{format_ts, Entity};

/// Rows removed by one purge cycle, per entity type.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub cutoff: String,
    pub sales: usize,
    pub inflows: usize,
    pub expenses: usize,
    pub sessions: usize,
    pub failures: Vec<String>,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.sales + self.inflows + self.expenses + self.sessions
    }
}

const PURGE_SALES: &str = "
    DELETE FROM sales
    WHERE is_synced = 1
      AND sold_at < ?1
      AND session_id IN (SELECT local_id FROM cash_sessions WHERE closed_at IS NOT NULL)
      AND NOT EXISTS (
          SELECT 1 FROM sale_line_items li WHERE li.sale_id = sales.local_id AND li.is_synced = 0
      )";

fn purge_movements_sql(entity: Entity) -> String {
    format!(
        "DELETE FROM {table}
         WHERE is_synced = 1
           AND created_at < ?1
           AND session_id IN (SELECT local_id FROM cash_sessions WHERE closed_at IS NOT NULL)",
        table = entity.table()
    )
}

const PURGE_SESSIONS: &str = "
    DELETE FROM cash_sessions
    WHERE is_synced = 1
      AND closed_at IS NOT NULL
      AND opened_at < ?1
      AND NOT EXISTS (SELECT 1 FROM sales s WHERE s.session_id = cash_sessions.local_id)
      AND NOT EXISTS (SELECT 1 FROM cash_inflows i WHERE i.session_id = cash_sessions.local_id)
      AND NOT EXISTS (SELECT 1 FROM cash_expenses e WHERE e.session_id = cash_sessions.local_id)";

/// Purge everything synced before `now - retention`. A retention that puts
/// the cutoff outside the representable date range purges nothing.
pub fn run_purge(db: &LocalDb, retention: chrono::Duration) -> PurgeReport {
    let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
        error!(
            retention_days = retention.num_days(),
            "Purge skipped: retention out of range"
        );
        return PurgeReport {
            failures: vec!["retention out of range".to_string()],
            ..Default::default()
        };
    };
    run_purge_before(db, &format_ts(cutoff))
}

/// Purge everything synced with a natural timestamp before `cutoff`.
pub fn run_purge_before(db: &LocalDb, cutoff: &str) -> PurgeReport {
    let mut report = PurgeReport {
        cutoff: cutoff.to_string(),
        ..Default::default()
    };
    debug!(cutoff, "Purge cycle started");

    let conn = match db.lock() {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "Purge skipped: local store unavailable");
            report.failures.push(e.to_string());
            return report;
        }
    };

    let inflow_sql = purge_movements_sql(Entity::CashInflow);
    let expense_sql = purge_movements_sql(Entity::CashExpense);
    let steps: [(Entity, &str); 4] = [
        (Entity::Sale, PURGE_SALES),
        (Entity::CashInflow, &inflow_sql),
        (Entity::CashExpense, &expense_sql),
        (Entity::CashSession, PURGE_SESSIONS),
    ];

    for (entity, sql) in steps {
        match conn.execute(sql, params![cutoff]) {
            Ok(deleted) => {
                match entity {
                    Entity::Sale => report.sales = deleted,
                    Entity::CashInflow => report.inflows = deleted,
                    Entity::CashExpense => report.expenses = deleted,
                    _ => report.sessions = deleted,
                }
                if deleted > 0 {
                    info!(entity = entity.label(), deleted, "Purged synced rows");
                }
            }
            Err(e) => {
                error!(entity = entity.label(), error = %e, "Purge failed");
                report.failures.push(format!("{}: {e}", entity.table()));
            }
        }
    }

    debug!(total = report.total(), "Purge cycle finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "2026-01-01T08:00:00.000Z";
    const CUTOFF: &str = "2026-01-02T08:00:00.000Z";
    const RECENT: &str = "2026-01-03T08:00:00.000Z";

    fn seed_session(db: &LocalDb, synced: bool, opened_at: &str) -> i64 {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO locations (local_id, origin_id, name, created_at, updated_at)
             VALUES (1, 'origin-1', 'Boulevard', ?1, ?1)",
            params![OLD],
        )
        .unwrap();
        let remote_id: Option<i64> = synced.then_some(100);
        conn.execute(
            "INSERT INTO cash_sessions (location_id, opened_at, closed_at, starting_cash,
                                        remote_id, is_synced, updated_at)
             VALUES (1, ?1, ?1, 100.0, ?2, ?3, ?1)",
            params![opened_at, remote_id, synced as i64],
        )
        .unwrap();
        let session = conn.last_insert_rowid();
        for total in [50.0, 30.0] {
            conn.execute(
                "INSERT INTO sales (session_id, total_amount, sold_at, remote_id, is_synced)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session, total, opened_at, remote_id, synced as i64],
            )
            .unwrap();
            let sale = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO sale_line_items (sale_id, product_id, product_name, quantity,
                                              unit_price, remote_id, is_synced)
                 VALUES (?1, 'p1', 'Frame', 1, ?2, ?3, ?4)",
                params![sale, total, remote_id, synced as i64],
            )
            .unwrap();
        }
        session
    }

    fn count(db: &LocalDb, table: &str) -> i64 {
        db.lock()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_old_synced_session_is_purged_and_unsynced_kept() {
        let db = LocalDb::open_in_memory().unwrap();
        seed_session(&db, true, OLD);
        let kept = seed_session(&db, false, OLD);

        let report = run_purge_before(&db, CUTOFF);
        assert!(report.failures.is_empty());
        assert_eq!(report.sessions, 1);
        assert_eq!(report.sales, 2);

        assert_eq!(count(&db, "cash_sessions"), 1);
        assert_eq!(count(&db, "sales"), 2);
        assert_eq!(count(&db, "sale_line_items"), 2);
        let remaining: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT local_id FROM cash_sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, kept);
    }

    #[test]
    fn test_recent_rows_and_open_sessions_are_kept() {
        let db = LocalDb::open_in_memory().unwrap();
        seed_session(&db, true, RECENT);
        let open = seed_session(&db, true, OLD);
        db.lock()
            .unwrap()
            .execute(
                "UPDATE cash_sessions SET closed_at = NULL WHERE local_id = ?1",
                params![open],
            )
            .unwrap();

        let report = run_purge_before(&db, CUTOFF);
        assert_eq!(report.total(), 0);
        assert_eq!(count(&db, "cash_sessions"), 2);
        assert_eq!(count(&db, "sales"), 4);
    }

    #[test]
    fn test_session_with_pending_line_item_is_kept() {
        let db = LocalDb::open_in_memory().unwrap();
        let session = seed_session(&db, true, OLD);
        db.lock()
            .unwrap()
            .execute(
                "UPDATE sale_line_items SET is_synced = 0
                 WHERE sale_id = (SELECT MIN(local_id) FROM sales WHERE session_id = ?1)",
                params![session],
            )
            .unwrap();

        let report = run_purge_before(&db, CUTOFF);
        assert_eq!(report.sales, 1);
        assert_eq!(report.sessions, 0);
        assert_eq!(count(&db, "sale_line_items"), 1);
    }

    #[test]
    fn test_out_of_range_retention_purges_nothing() {
        let db = LocalDb::open_in_memory().unwrap();
        seed_session(&db, true, OLD);

        let report = run_purge(&db, chrono::Duration::days(1_000_000_000));
        assert_eq!(report.total(), 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(count(&db, "cash_sessions"), 1);

        let report = run_purge(&db, chrono::Duration::days(2));
        assert_eq!(report.sessions, 1);
    }

    #[test]
    fn test_failing_entity_type_does_not_stop_others() {
        let db = LocalDb::open_in_memory().unwrap();
        seed_session(&db, true, OLD);
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_sale_purge BEFORE DELETE ON sales
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;
                 INSERT INTO cash_expenses (session_id, amount, description, created_at, remote_id, is_synced)
                 VALUES (1, 5.0, 'Tape', '2026-01-01T09:00:00.000Z', 9, 1);",
            )
            .unwrap();

        let report = run_purge_before(&db, CUTOFF);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("sales"));
        assert_eq!(report.expenses, 1);
        assert_eq!(report.sessions, 0);
        assert_eq!(count(&db, "cash_sessions"), 1);
    }
}
