//! Product catalog cache.
//!
//! Categories and products are owned centrally; this store keeps a copy so
//! sales can snapshot names and prices while offline. Catalog rows are not
//! replicated by the sync engine.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::LocalDb;
use crate::error::StoreError;
use crate::model::now_ts;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub category_id: Option<String>,
    pub name: String,
    pub price: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

pub fn upsert_category(db: &LocalDb, id: &str, name: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() || name.trim().is_empty() {
        return Err(StoreError::validation("Category id and name are required"));
    }
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO categories (id, name, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        params![id, name.trim(), now_ts()],
    )?;
    debug!(category = id, "Category cached");
    Ok(())
}

/// Insert or replace a cached product. Existing sale lines keep the name and
/// price they were sold at.
pub fn upsert_product(db: &LocalDb, product: &Product) -> Result<(), StoreError> {
    if product.id.trim().is_empty() || product.name.trim().is_empty() {
        return Err(StoreError::validation("Product id and name are required"));
    }
    if !product.price.is_finite() || product.price < 0.0 {
        return Err(StoreError::validation(format!(
            "Product {} has an invalid price",
            product.id
        )));
    }
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO products (id, category_id, name, price, is_active, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            category_id = excluded.category_id,
            name = excluded.name,
            price = excluded.price,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
        params![
            product.id,
            product.category_id,
            product.name.trim(),
            product.price,
            product.is_active as i64,
            now_ts(),
        ],
    )?;
    debug!(product = %product.id, price = product.price, "Product cached");
    Ok(())
}

pub(crate) fn load_product(
    conn: &rusqlite::Connection,
    id: &str,
) -> Result<Option<Product>, StoreError> {
    let product = conn
        .query_row(
            "SELECT id, category_id, name, price, is_active FROM products WHERE id = ?1",
            params![id],
            |row| {
                Ok(Product {
                    id: row.get(0)?,
                    category_id: row.get(1)?,
                    name: row.get(2)?,
                    price: row.get(3)?,
                    is_active: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()?;
    Ok(product)
}

pub fn get_product(db: &LocalDb, id: &str) -> Result<Option<Product>, StoreError> {
    let conn = db.lock()?;
    load_product(&conn, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(price: f64) -> Product {
        Product {
            id: "prod-frame".into(),
            category_id: Some("cat-frames".into()),
            name: "Frame 20x30".into(),
            price,
            is_active: true,
        }
    }

    #[test]
    fn test_upsert_product_replaces_price() {
        let db = LocalDb::open_in_memory().unwrap();
        upsert_category(&db, "cat-frames", "Frames").unwrap();
        upsert_product(&db, &frame(12.0)).unwrap();
        upsert_product(&db, &frame(15.5)).unwrap();

        let product = get_product(&db, "prod-frame").unwrap().unwrap();
        assert_eq!(product.price, 15.5);
        assert!(get_product(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_rejects_negative_price() {
        let db = LocalDb::open_in_memory().unwrap();
        upsert_category(&db, "cat-frames", "Frames").unwrap();
        assert!(upsert_product(&db, &frame(-1.0)).is_err());
        assert!(upsert_category(&db, "", "Nameless").is_err());
    }

    #[test]
    fn test_product_deserializes_with_default_active() {
        let product: Product = serde_json::from_str(
            r#"{"id":"p1","categoryId":null,"name":"Print 10x15","price":0.5}"#,
        )
        .unwrap();
        assert!(product.is_active);
    }
}
