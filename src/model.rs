//! Entity hierarchy and the two schema variants.
//!
//! Local rows carry sync-tracking metadata (`SyncMeta`). Remote rows never
//! do: they carry the remote primary key (when already known) and an
//! `origin_key` idempotency token instead. The `to_remote` functions below are
//! the only place one variant turns into the other.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

/// Every syncable table in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Location,
    Operator,
    CashSession,
    Sale,
    SaleLineItem,
    CashInflow,
    CashExpense,
}

impl Entity {
    pub const fn table(self) -> &'static str {
        match self {
            Entity::Location => "locations",
            Entity::Operator => "operators",
            Entity::CashSession => "cash_sessions",
            Entity::Sale => "sales",
            Entity::SaleLineItem => "sale_line_items",
            Entity::CashInflow => "cash_inflows",
            Entity::CashExpense => "cash_expenses",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Entity::Location => "location",
            Entity::Operator => "operator",
            Entity::CashSession => "cash_session",
            Entity::Sale => "sale",
            Entity::SaleLineItem => "sale_line_item",
            Entity::CashInflow => "cash_inflow",
            Entity::CashExpense => "cash_expense",
        }
    }

    /// Parent entity and the foreign-key column pointing at it.
    pub const fn parent(self) -> Option<(Entity, &'static str)> {
        match self {
            Entity::Location => None,
            Entity::Operator => Some((Entity::Location, "location_id")),
            Entity::CashSession => Some((Entity::Location, "location_id")),
            Entity::Sale => Some((Entity::CashSession, "session_id")),
            Entity::SaleLineItem => Some((Entity::Sale, "sale_id")),
            Entity::CashInflow => Some((Entity::CashSession, "session_id")),
            Entity::CashExpense => Some((Entity::CashSession, "session_id")),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A reference to one local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRef {
    pub entity: Entity,
    pub local_id: i64,
}

impl RowRef {
    pub const fn new(entity: Entity, local_id: i64) -> Self {
        Self { entity, local_id }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity, self.local_id)
    }
}

/// Deterministic idempotency token for a replicated row:
/// `<location origin uuid>:<entity>:<local_id>`.
pub fn origin_key(origin: &str, entity: Entity, local_id: i64) -> String {
    format!("{origin}:{}:{local_id}", entity.label())
}

/// Timestamp format used for every stored time. Fixed width and UTC, so
/// string comparison in SQL matches chronological order.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

// ---------------------------------------------------------------------------
// Operator roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cashier,
    Administrative,
    SubManagement,
    Management,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Cashier => "cashier",
            Role::Administrative => "administrative",
            Role::SubManagement => "sub_management",
            Role::Management => "management",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cashier" => Some(Role::Cashier),
            "administrative" => Some(Role::Administrative),
            "sub_management" => Some(Role::SubManagement),
            "management" => Some(Role::Management),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Local variant
// ---------------------------------------------------------------------------

/// Sync-tracking columns shared by every local row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMeta {
    pub local_id: i64,
    pub remote_id: Option<i64>,
    pub is_synced: bool,
    /// Local-only revision, bumped by every mutation and cascade step.
    pub sync_rev: i64,
}

impl SyncMeta {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(offset)?,
            remote_id: row.get(offset + 1)?,
            is_synced: row.get::<_, i64>(offset + 2)? != 0,
            sync_rev: row.get(offset + 3)?,
        })
    }
}

/// Column list matching `SyncMeta::from_row`.
pub(crate) const META_COLUMNS: &str = "local_id, remote_id, is_synced, sync_rev";

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub meta: SyncMeta,
    pub origin_id: String,
    pub name: String,
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub meta: SyncMeta,
    pub location_id: i64,
    pub name: String,
    pub pin_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashSession {
    pub meta: SyncMeta,
    pub location_id: i64,
    pub operator_id: Option<i64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub starting_cash: f64,
    pub opening_notes: Option<String>,
    pub closing_notes: Option<String>,
}

impl CashSession {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sale {
    pub meta: SyncMeta,
    pub session_id: i64,
    pub total_amount: f64,
    pub sold_at: String,
    pub items: Vec<SaleLineItem>,
}

/// Quantity and unit price are captured when the sale is made and never
/// follow later catalog price changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleLineItem {
    pub meta: SyncMeta,
    pub sale_id: i64,
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Inflow,
    Expense,
}

impl MovementKind {
    pub const fn entity(self) -> Entity {
        match self {
            MovementKind::Inflow => Entity::CashInflow,
            MovementKind::Expense => Entity::CashExpense,
        }
    }
}

/// A cash inflow or expense adjusting the drawer outside of sales.
#[derive(Debug, Clone, PartialEq)]
pub struct CashMovement {
    pub meta: SyncMeta,
    pub kind: MovementKind,
    pub session_id: i64,
    pub amount: f64,
    pub description: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Remote variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub name: String,
    pub address: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperator {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub location_id: i64,
    pub name: String,
    pub pin_hash: String,
    pub role: Role,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCashSession {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub location_id: i64,
    pub operator_id: Option<i64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub starting_cash: f64,
    pub opening_notes: Option<String>,
    pub closing_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSale {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub total_amount: f64,
    pub sold_at: String,
    pub items: Vec<RemoteSaleLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSaleLine {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCashMovement {
    pub remote_id: Option<i64>,
    pub origin_key: String,
    pub amount: f64,
    pub description: String,
    pub created_at: String,
}

/// One cash session and its unsynced subtree, replicated atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatePayload {
    pub session: RemoteCashSession,
    pub sales: Vec<RemoteSale>,
    pub inflows: Vec<RemoteCashMovement>,
    pub expenses: Vec<RemoteCashMovement>,
}

impl AggregatePayload {
    pub fn row_count(&self) -> usize {
        1 + self.sales.iter().map(|s| 1 + s.items.len()).sum::<usize>()
            + self.inflows.len()
            + self.expenses.len()
    }
}

/// Remote primary keys assigned by a committed remote transaction, keyed by
/// `origin_key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationReceipt {
    pub root_id: i64,
    pub assigned: HashMap<String, i64>,
}

impl Location {
    pub fn to_remote(&self) -> RemoteLocation {
        RemoteLocation {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(&self.origin_id, Entity::Location, self.meta.local_id),
            name: self.name.clone(),
            address: self.address.clone(),
            is_active: self.is_active,
        }
    }
}

impl Operator {
    pub fn to_remote(&self, origin: &str, location_remote_id: i64) -> RemoteOperator {
        RemoteOperator {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(origin, Entity::Operator, self.meta.local_id),
            location_id: location_remote_id,
            name: self.name.clone(),
            pin_hash: self.pin_hash.clone(),
            role: self.role,
            is_active: self.is_active,
        }
    }
}

impl CashSession {
    pub fn to_remote(
        &self,
        origin: &str,
        location_remote_id: i64,
        operator_remote_id: Option<i64>,
    ) -> RemoteCashSession {
        RemoteCashSession {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(origin, Entity::CashSession, self.meta.local_id),
            location_id: location_remote_id,
            operator_id: operator_remote_id,
            opened_at: self.opened_at.clone(),
            closed_at: self.closed_at.clone(),
            starting_cash: self.starting_cash,
            opening_notes: self.opening_notes.clone(),
            closing_notes: self.closing_notes.clone(),
        }
    }
}

impl Sale {
    /// Only unsynced line items travel with the sale.
    pub fn to_remote(&self, origin: &str) -> RemoteSale {
        RemoteSale {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(origin, Entity::Sale, self.meta.local_id),
            total_amount: self.total_amount,
            sold_at: self.sold_at.clone(),
            items: self
                .items
                .iter()
                .filter(|item| !item.meta.is_synced)
                .map(|item| item.to_remote(origin))
                .collect(),
        }
    }
}

impl SaleLineItem {
    pub fn to_remote(&self, origin: &str) -> RemoteSaleLine {
        RemoteSaleLine {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(origin, Entity::SaleLineItem, self.meta.local_id),
            product_id: self.product_id.clone(),
            product_name: self.product_name.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
        }
    }
}

impl CashMovement {
    pub fn to_remote(&self, origin: &str) -> RemoteCashMovement {
        RemoteCashMovement {
            remote_id: self.meta.remote_id,
            origin_key: origin_key(origin, self.kind.entity(), self.meta.local_id),
            amount: self.amount,
            description: self.description.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(local_id: i64, synced: bool) -> SyncMeta {
        SyncMeta {
            local_id,
            remote_id: synced.then_some(local_id + 100),
            is_synced: synced,
            sync_rev: 1,
        }
    }

    #[test]
    fn test_parent_chain_reaches_location() {
        let mut chain = Vec::new();
        let mut current = Entity::SaleLineItem;
        while let Some((parent, _)) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        assert_eq!(
            chain,
            vec![Entity::Sale, Entity::CashSession, Entity::Location]
        );
        assert_eq!(Entity::Operator.parent(), Some((Entity::Location, "location_id")));
    }

    #[test]
    fn test_role_parse_accepts_hyphenated_and_case() {
        assert_eq!(Role::parse("Sub-Management"), Some(Role::SubManagement));
        assert_eq!(Role::parse(" cashier "), Some(Role::Cashier));
        assert_eq!(Role::parse("owner"), None);
        assert_eq!(Role::Management.as_str(), "management");
    }

    #[test]
    fn test_sale_to_remote_strips_local_columns_and_synced_lines() {
        let sale = Sale {
            meta: meta(4, false),
            session_id: 1,
            total_amount: 12.5,
            sold_at: "2026-01-01T10:00:00.000Z".into(),
            items: vec![
                SaleLineItem {
                    meta: meta(9, true),
                    sale_id: 4,
                    product_id: "p-1".into(),
                    product_name: "Print 10x15".into(),
                    quantity: 1.0,
                    unit_price: 2.5,
                },
                SaleLineItem {
                    meta: meta(10, false),
                    sale_id: 4,
                    product_id: "p-2".into(),
                    product_name: "Frame".into(),
                    quantity: 2.0,
                    unit_price: 5.0,
                },
            ],
        };

        let remote = sale.to_remote("origin-a");
        assert_eq!(remote.origin_key, "origin-a:sale:4");
        assert_eq!(remote.remote_id, None);
        assert_eq!(remote.items.len(), 1);
        assert_eq!(remote.items[0].origin_key, "origin-a:sale_line_item:10");

        let json = serde_json::to_value(&remote).unwrap();
        assert!(json.get("local_id").is_none());
        assert!(json.get("is_synced").is_none());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let earlier = format_ts(Utc::now() - chrono::Duration::days(3));
        let later = now_ts();
        assert!(earlier < later);
        assert!(later.ends_with('Z'));
    }
}
