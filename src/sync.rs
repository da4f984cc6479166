//! Sync daemon cycle.
//!
//! One cycle moves through `Idle -> Selecting -> Sending -> Committing -> Idle`:
//! 1. Select unsynced cash sessions in ascending `local_id` order, bounded by
//!    the batch size.
//! 2. Upsert stale locations and operators (reference data) so aggregates can
//!    point at their remote ids.
//! 3. For each session, ship its unsynced subtree in one remote transaction.
//! 4. Record the remote ids locally. A row is marked synced only if its
//!    `sync_rev` still matches the revision that was sent; anything written
//!    while the payload was in flight stays unsynced for the next cycle.
//!
//! A failed aggregate never aborts the batch. Remote failures leave rows
//! unsynced and are retried every cycle.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error, info, warn};

use crate::db::LocalDb;
use crate::error::{RemoteError, StoreError};
use crate::locations::{load_location, location_from_row, location_select};
use crate::model::{
    format_ts, AggregatePayload, Entity, Location, MovementKind, Operator, RowRef,
};
use crate::movements::load_movements;
use crate::operators::{load_operator, operator_from_row, operator_select};
use crate::remote::RemoteStore;
use crate::sales::load_sales_for_session;
use crate::sessions::load_session;

// ---------------------------------------------------------------------------
// Phase tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Selecting,
    Sending,
    Committing,
}

/// Current phase of the running cycle, readable from any thread.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn set(&self, phase: SyncPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> SyncPhase {
        match self.0.load(Ordering::SeqCst) {
            1 => SyncPhase::Selecting,
            2 => SyncPhase::Sending,
            3 => SyncPhase::Committing,
            _ => SyncPhase::Idle,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: String,
    /// Another cycle held the single-flight guard.
    pub skipped: bool,
    /// Pending work was found but the remote store was absent or unreachable.
    pub offline: bool,
    pub sessions_selected: usize,
    pub sessions_synced: usize,
    pub sessions_failed: usize,
    pub locations_sent: usize,
    pub operators_sent: usize,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: format_ts(Utc::now()),
            ..Default::default()
        }
    }

    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::new()
        }
    }

    fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }
}

/// Rows still waiting for replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    pub sessions: i64,
    pub operators: i64,
    pub locations: i64,
}

fn count_unsynced(conn: &Connection, entity: Entity) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE is_synced = 0", entity.table()),
        [],
        |row| row.get(0),
    )
}

pub fn pending_counts(db: &LocalDb) -> Result<PendingCounts, StoreError> {
    let conn = db.lock()?;
    Ok(PendingCounts {
        sessions: count_unsynced(&conn, Entity::CashSession)?,
        operators: count_unsynced(&conn, Entity::Operator)?,
        locations: count_unsynced(&conn, Entity::Location)?,
    })
}

// ---------------------------------------------------------------------------
// Selecting
// ---------------------------------------------------------------------------

fn select_pending_sessions(conn: &Connection, batch_size: usize) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT local_id FROM cash_sessions WHERE is_synced = 0 ORDER BY local_id LIMIT ?1",
    )?;
    let ids = stmt
        .query_map(params![batch_size as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn stale_locations(conn: &Connection) -> rusqlite::Result<Vec<Location>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE is_synced = 0 ORDER BY local_id",
        location_select()
    ))?;
    let rows = stmt
        .query_map([], location_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn stale_operators(conn: &Connection) -> rusqlite::Result<Vec<Operator>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE is_synced = 0 ORDER BY local_id",
        operator_select()
    ))?;
    let rows = stmt
        .query_map([], operator_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Payload preparation
// ---------------------------------------------------------------------------

/// A row included in a payload, with the revision that was read.
#[derive(Debug, Clone)]
pub(crate) struct SentRow {
    pub row: RowRef,
    pub rev: i64,
    pub origin_key: String,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedAggregate {
    pub session_id: i64,
    pub payload: AggregatePayload,
    pub rows: Vec<SentRow>,
}

fn not_replicated(row: RowRef) -> StoreError {
    StoreError::validation(format!("{row} has no remote id yet"))
}

/// Load a session's unsynced subtree and convert it to the remote variant.
pub(crate) fn prepare_aggregate(
    conn: &Connection,
    session_id: i64,
) -> Result<PreparedAggregate, StoreError> {
    let session = load_session(conn, session_id)?;
    let location = load_location(conn, session.location_id)?;
    let location_remote = location
        .meta
        .remote_id
        .ok_or_else(|| not_replicated(RowRef::new(Entity::Location, location.meta.local_id)))?;
    let operator_remote = match session.operator_id {
        Some(operator_id) => Some(
            load_operator(conn, operator_id)?
                .meta
                .remote_id
                .ok_or_else(|| not_replicated(RowRef::new(Entity::Operator, operator_id)))?,
        ),
        None => None,
    };
    let origin = location.origin_id.as_str();

    let remote_session = session.to_remote(origin, location_remote, operator_remote);
    let mut rows = vec![SentRow {
        row: RowRef::new(Entity::CashSession, session_id),
        rev: session.meta.sync_rev,
        origin_key: remote_session.origin_key.clone(),
    }];

    let sales = load_sales_for_session(conn, session_id, true)?;
    let mut remote_sales = Vec::with_capacity(sales.len());
    for sale in &sales {
        let remote = sale.to_remote(origin);
        rows.push(SentRow {
            row: RowRef::new(Entity::Sale, sale.meta.local_id),
            rev: sale.meta.sync_rev,
            origin_key: remote.origin_key.clone(),
        });
        for (item, remote_item) in sale
            .items
            .iter()
            .filter(|item| !item.meta.is_synced)
            .zip(&remote.items)
        {
            rows.push(SentRow {
                row: RowRef::new(Entity::SaleLineItem, item.meta.local_id),
                rev: item.meta.sync_rev,
                origin_key: remote_item.origin_key.clone(),
            });
        }
        remote_sales.push(remote);
    }

    let mut movements = |kind: MovementKind| -> Result<Vec<_>, StoreError> {
        let local = load_movements(conn, kind, session_id, true)?;
        Ok(local
            .iter()
            .map(|m| {
                let remote = m.to_remote(origin);
                rows.push(SentRow {
                    row: RowRef::new(kind.entity(), m.meta.local_id),
                    rev: m.meta.sync_rev,
                    origin_key: remote.origin_key.clone(),
                });
                remote
            })
            .collect())
    };
    let inflows = movements(MovementKind::Inflow)?;
    let expenses = movements(MovementKind::Expense)?;

    Ok(PreparedAggregate {
        session_id,
        payload: AggregatePayload {
            session: remote_session,
            sales: remote_sales,
            inflows,
            expenses,
        },
        rows,
    })
}

// ---------------------------------------------------------------------------
// Committing
// ---------------------------------------------------------------------------

/// Store the remote id and mark the row synced if it is unchanged since
/// `sent_rev`. Returns whether the row ended up synced.
fn record_replicated(
    conn: &Connection,
    row: RowRef,
    remote_id: i64,
    sent_rev: i64,
) -> rusqlite::Result<bool> {
    let table = row.entity.table();
    conn.execute(
        &format!(
            "UPDATE {table} SET remote_id = ?1,
                is_synced = CASE WHEN sync_rev = ?2 THEN 1 ELSE 0 END
             WHERE local_id = ?3"
        ),
        params![remote_id, sent_rev, row.local_id],
    )?;
    let synced: i64 = conn.query_row(
        &format!("SELECT is_synced FROM {table} WHERE local_id = ?1"),
        params![row.local_id],
        |r| r.get(0),
    )?;
    Ok(synced != 0)
}

/// Apply a remote receipt to the aggregate's local rows in one transaction.
/// Returns whether the session itself is now synced.
pub(crate) fn commit_aggregate(
    conn: &mut Connection,
    prepared: &PreparedAggregate,
    assigned: &HashMap<String, i64>,
) -> Result<bool, StoreError> {
    let tx = conn.transaction()?;
    let mut session_synced = false;
    for sent in &prepared.rows {
        let remote_id = *assigned.get(&sent.origin_key).ok_or_else(|| {
            StoreError::validation(format!("receipt is missing {}", sent.origin_key))
        })?;
        let synced = record_replicated(&tx, sent.row, remote_id, sent.rev)?;
        if sent.row.entity == Entity::CashSession {
            session_synced = synced;
        }
        if !synced {
            debug!(row = %sent.row, "Row changed while in flight; left unsynced");
        }
    }
    tx.commit()?;
    debug!(
        session = prepared.session_id,
        rows = prepared.rows.len(),
        "Aggregate committed locally"
    );
    Ok(session_synced)
}

/// Mark a location synced once it is replicated, unchanged since `sent_rev`,
/// and no operator or session below it is still pending.
fn settle_location(conn: &Connection, local_id: i64, sent_rev: i64) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE locations SET is_synced = 1
         WHERE local_id = ?1 AND sync_rev = ?2 AND remote_id IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM operators WHERE location_id = ?1 AND is_synced = 0)
           AND NOT EXISTS (SELECT 1 FROM cash_sessions WHERE location_id = ?1 AND is_synced = 0)",
        params![local_id, sent_rev],
    )?;
    Ok(changed > 0)
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Replicate stale locations and operators. Returns the revisions of the
/// locations that were sent, for settling at the end of the cycle.
async fn send_reference_data(
    db: &LocalDb,
    remote: &dyn RemoteStore,
    report: &mut CycleReport,
) -> Result<Vec<(i64, i64)>, StoreError> {
    let locations = {
        let conn = db.lock()?;
        stale_locations(&conn)?
    };

    let mut sent = Vec::with_capacity(locations.len());
    let mut origins: HashMap<i64, (String, Option<i64>)> = HashMap::new();
    for location in &locations {
        let local_id = location.meta.local_id;
        match remote.upsert_location(&location.to_remote()).await {
            Ok(remote_id) => {
                let conn = db.lock()?;
                conn.execute(
                    "UPDATE locations SET remote_id = ?1 WHERE local_id = ?2",
                    params![remote_id, local_id],
                )?;
                sent.push((local_id, location.meta.sync_rev));
                report.locations_sent += 1;
                origins.insert(local_id, (location.origin_id.clone(), Some(remote_id)));
            }
            Err(e) => {
                warn!(location = local_id, error = %e, "Location replication failed");
                report.record_error(format!("location {local_id}: {e}"));
            }
        }
    }

    let operators = {
        let conn = db.lock()?;
        let operators = stale_operators(&conn)?;
        for operator in &operators {
            if !origins.contains_key(&operator.location_id) {
                let location = load_location(&conn, operator.location_id)?;
                origins.insert(
                    operator.location_id,
                    (location.origin_id, location.meta.remote_id),
                );
            }
        }
        operators
    };

    for operator in &operators {
        let local_id = operator.meta.local_id;
        let Some((origin, Some(location_remote))) = origins.get(&operator.location_id) else {
            report.record_error(format!("operator {local_id}: location not replicated yet"));
            continue;
        };
        match remote
            .upsert_operator(&operator.to_remote(origin, *location_remote))
            .await
        {
            Ok(remote_id) => {
                let conn = db.lock()?;
                record_replicated(
                    &conn,
                    RowRef::new(Entity::Operator, local_id),
                    remote_id,
                    operator.meta.sync_rev,
                )?;
                report.operators_sent += 1;
            }
            Err(e) => {
                warn!(operator = local_id, error = %e, "Operator replication failed");
                report.record_error(format!("operator {local_id}: {e}"));
            }
        }
    }

    Ok(sent)
}

/// Send one aggregate and commit the receipt locally.
async fn sync_aggregate(
    db: &LocalDb,
    remote: &dyn RemoteStore,
    phase: &PhaseCell,
    session_id: i64,
) -> Result<bool, AggregateError> {
    let prepared = {
        let conn = db.lock()?;
        prepare_aggregate(&conn, session_id)?
    };

    phase.set(SyncPhase::Sending);
    let receipt = remote.replicate_aggregate(&prepared.payload).await?;

    phase.set(SyncPhase::Committing);
    let mut conn = db.lock()?;
    Ok(commit_aggregate(&mut conn, &prepared, &receipt.assigned)?)
}

#[derive(Debug, thiserror::Error)]
enum AggregateError {
    #[error(transparent)]
    Local(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Run one full cycle. Never returns an error: every failure is logged and
/// recorded in the report, and the affected rows stay unsynced.
pub async fn run_cycle(
    db: &LocalDb,
    remote: Option<&dyn RemoteStore>,
    batch_size: usize,
    phase: &PhaseCell,
) -> CycleReport {
    let mut report = CycleReport::new();
    debug!("Sync cycle started");

    phase.set(SyncPhase::Selecting);
    let selected = match db.lock().and_then(|conn| {
        let sessions = select_pending_sessions(&conn, batch_size)?;
        let reference =
            count_unsynced(&conn, Entity::Location)? + count_unsynced(&conn, Entity::Operator)?;
        Ok((sessions, reference))
    }) {
        Ok(selected) => selected,
        Err(e) => {
            error!(error = %e, "Sync selection failed");
            report.record_error(e.to_string());
            phase.set(SyncPhase::Idle);
            return report;
        }
    };
    let (sessions, pending_reference) = selected;
    report.sessions_selected = sessions.len();

    if sessions.is_empty() && pending_reference == 0 {
        phase.set(SyncPhase::Idle);
        debug!("Sync cycle finished: nothing pending");
        return report;
    }

    let Some(remote) = remote else {
        info!(
            sessions = sessions.len(),
            reference = pending_reference,
            "Remote store offline; keeping rows pending"
        );
        report.offline = true;
        report.record_error(RemoteError::Offline.to_string());
        phase.set(SyncPhase::Idle);
        return report;
    };

    phase.set(SyncPhase::Sending);
    if let Err(e) = remote.ping().await {
        warn!(driver = remote.name(), error = %e, "Remote store unreachable; deferring sync");
        report.offline = true;
        report.record_error(e.to_string());
        phase.set(SyncPhase::Idle);
        return report;
    }

    let sent_locations = match send_reference_data(db, remote, &mut report).await {
        Ok(sent) => sent,
        Err(e) => {
            error!(error = %e, "Local failure while replicating reference data");
            report.record_error(e.to_string());
            Vec::new()
        }
    };

    for session_id in sessions {
        phase.set(SyncPhase::Selecting);
        match sync_aggregate(db, remote, phase, session_id).await {
            Ok(true) => {
                report.sessions_synced += 1;
                info!(session = session_id, "Cash session replicated");
            }
            Ok(false) => {
                report.sessions_synced += 1;
                info!(
                    session = session_id,
                    "Cash session replicated; newer local changes remain pending"
                );
            }
            Err(AggregateError::Remote(e)) => {
                report.sessions_failed += 1;
                warn!(session = session_id, error = %e, "Cash session replication failed");
                report.record_error(format!("cash_session {session_id}: {e}"));
            }
            Err(AggregateError::Local(e)) => {
                report.sessions_failed += 1;
                error!(session = session_id, error = %e, "Cash session sync failed locally");
                report.record_error(format!("cash_session {session_id}: {e}"));
            }
        }
    }

    phase.set(SyncPhase::Committing);
    match db.lock() {
        Ok(conn) => {
            for (local_id, rev) in sent_locations {
                match settle_location(&conn, local_id, rev) {
                    Ok(true) => debug!(location = local_id, "Location settled"),
                    Ok(false) => {}
                    Err(e) => {
                        error!(location = local_id, error = %e, "Failed to settle location");
                        report.record_error(format!("location {local_id}: {e}"));
                    }
                }
            }
        }
        Err(e) => report.record_error(e.to_string()),
    }

    phase.set(SyncPhase::Idle);
    debug!(
        synced = report.sessions_synced,
        failed = report.sessions_failed,
        "Sync cycle finished"
    );
    report
}

// ===========================================================================
// Tests
// ===========================================================================
