//! Durable cache of served orders.
//!
//! The order list stops returning terminal orders after a while, so every
//! order confirmed served is written here and merged back into the served
//! bucket. Rows are scoped to one outlet and kept in memory as well; the
//! SQLite table is written through on every change and read once on open.

use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::BoardError;
use crate::model::{Order, OrderStatus};

pub struct ServedCache {
    db: Arc<DbState>,
    outlet_id: String,
    entries: BTreeMap<String, Order>,
}

impl ServedCache {
    /// Load the cache for `outlet_id`. Rows whose payload no longer decodes
    /// are dropped from the table.
    pub fn open(db: Arc<DbState>, outlet_id: &str) -> Result<Self, BoardError> {
        let mut entries = BTreeMap::new();
        let mut unreadable = Vec::new();
        {
            let conn = db
                .conn
                .lock()
                .map_err(|e| BoardError::Storage(e.to_string()))?;
            let mut stmt =
                conn.prepare("SELECT order_id, payload FROM served_orders WHERE outlet_id = ?1")?;
            let rows = stmt.query_map(params![outlet_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (order_id, payload) = row?;
                match serde_json::from_str::<Order>(&payload) {
                    Ok(order) => {
                        entries.insert(order_id, order);
                    }
                    Err(e) => {
                        warn!(order_id = %order_id, "dropping unreadable served cache row: {e}");
                        unreadable.push(order_id);
                    }
                }
            }
            for order_id in &unreadable {
                conn.execute(
                    "DELETE FROM served_orders WHERE outlet_id = ?1 AND order_id = ?2",
                    params![outlet_id, order_id],
                )?;
            }
        }

        info!(outlet_id, cached = entries.len(), "served cache loaded");
        Ok(Self {
            db,
            outlet_id: outlet_id.to_string(),
            entries,
        })
    }

    /// A cache that starts empty, for when the stored rows cannot be read.
    pub fn empty(db: Arc<DbState>, outlet_id: &str) -> Self {
        Self {
            db,
            outlet_id: outlet_id.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn outlet_id(&self) -> &str {
        &self.outlet_id
    }

    /// Store `order` as served, replacing any previous value. Unchanged
    /// records are not rewritten. The in-memory copy is kept even when the
    /// database write fails.
    pub fn put(&mut self, order: &Order) -> Result<(), BoardError> {
        let mut order = order.clone();
        if order.status != OrderStatus::Served || !order.all_lines_served() {
            order = order.moved_to(OrderStatus::Served);
        }
        if self.entries.get(&order.order_id) == Some(&order) {
            return Ok(());
        }

        let written = self.write(&order);
        self.entries.insert(order.order_id.clone(), order);
        written
    }

    fn write(&self, order: &Order) -> Result<(), BoardError> {
        let payload = serde_json::to_string(order)?;
        let order_time = order
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| BoardError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO served_orders (outlet_id, order_id, payload, order_time, cached_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(outlet_id, order_id) DO UPDATE SET
                payload = excluded.payload,
                order_time = excluded.order_time,
                cached_at = excluded.cached_at",
            params![self.outlet_id, order.order_id, payload, order_time],
        )?;
        debug!(order_id = %order.order_id, "served order cached");
        Ok(())
    }

    /// Delete the cached order. Returns whether it was present.
    pub fn remove(&mut self, order_id: &str) -> Result<bool, BoardError> {
        let present = self.entries.remove(order_id).is_some();
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| BoardError::Storage(e.to_string()))?;
        conn.execute(
            "DELETE FROM served_orders WHERE outlet_id = ?1 AND order_id = ?2",
            params![self.outlet_id, order_id],
        )?;
        Ok(present)
    }

    pub fn all_values(&self) -> Vec<Order> {
        self.entries.values().cloned().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &Order> {
        self.entries.values()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.entries.contains_key(order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::test_support::{order, test_db};

    fn row_count(db: &DbState) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM served_orders", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn put_overwrites_and_survives_reopen() {
        let db = test_db();
        let mut cache = ServedCache::open(db.clone(), "7").unwrap();
        let mut o5 = order("o5", OrderStatus::Served, &["a"]);
        cache.put(&o5).unwrap();
        o5.order_number = "renumbered".into();
        cache.put(&o5).unwrap();
        assert_eq!(row_count(&db), 1);

        let reopened = ServedCache::open(db, "7").unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.all_values()[0].order_number, "renumbered");
    }

    #[test]
    fn put_normalizes_to_served() {
        let db = test_db();
        let mut cache = ServedCache::open(db, "7").unwrap();
        cache.put(&order("o1", OrderStatus::Cooking, &["a", "b"])).unwrap();
        let stored = &cache.all_values()[0];
        assert_eq!(stored.status, OrderStatus::Served);
        assert!(stored.all_lines_served());
    }

    #[test]
    fn remove_deletes_row() {
        let db = test_db();
        let mut cache = ServedCache::open(db.clone(), "7").unwrap();
        cache.put(&order("o1", OrderStatus::Served, &["a"])).unwrap();
        assert!(cache.remove("o1").unwrap());
        assert!(!cache.remove("o1").unwrap());
        assert!(!ServedCache::empty(db.clone(), "7").contains("o1"));
        assert!(cache.is_empty());
        assert_eq!(row_count(&db), 0);
    }

    #[test]
    fn outlets_do_not_share_entries() {
        let db = test_db();
        let mut first = ServedCache::open(db.clone(), "7").unwrap();
        first.put(&order("o1", OrderStatus::Served, &["a"])).unwrap();
        let second = ServedCache::open(db, "8").unwrap();
        assert!(second.is_empty());
        assert!(!second.contains("o1"));
    }

    #[test]
    fn unreadable_rows_are_dropped_on_open() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO served_orders (outlet_id, order_id, payload) VALUES ('7', 'bad', '{not json')",
                [],
            )
            .unwrap();
        }
        let cache = ServedCache::open(db.clone(), "7").unwrap();
        assert!(cache.is_empty());
        assert_eq!(row_count(&db), 0);
    }

    #[test]
    fn survives_process_restart_on_disk() {
        let dir = std::env::temp_dir().join(format!("kds-cache-test-{}", uuid::Uuid::new_v4()));
        {
            let state = Arc::new(db::init(&dir).unwrap());
            let mut cache = ServedCache::open(state, "7").unwrap();
            cache.put(&order("o5", OrderStatus::Served, &["a"])).unwrap();
        }
        let state = Arc::new(db::init(&dir).unwrap());
        let cache = ServedCache::open(state, "7").unwrap();
        assert!(cache.contains("o5"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
