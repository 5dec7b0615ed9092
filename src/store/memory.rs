use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{
    value_eq, ChangeEvent, CollectionStore, FeedHub, FeedSubscription, Filter, OrderBy,
};
use crate::AppResult;

/// Schemaless in-memory store. Rows live as JSON objects in per-collection
/// vectors; identifiers are assigned from a per-collection counter. Observable
/// behavior matches the SQLite backend.
///
/// Writes publish their change event while still holding the table lock, so
/// feed delivery order always matches commit order. `FeedHub::publish` is a
/// synchronous `try_send` and never blocks inside the critical section.
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Table>>,
    hub: FeedHub,
}

struct Table {
    rows: Vec<Map<String, Value>>,
    next_id: i64,
}

impl Table {
    fn new() -> Self {
        Table {
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            collections: Mutex::new(HashMap::new()),
            hub: FeedHub::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filters(row: &Map<String, Value>, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| {
        let cell = row.get(&filter.column).unwrap_or(&Value::Null);
        value_eq(cell, &filter.value)
    })
}

/// Column comparison with SQLite's affinity quirks flattened to what the
/// rosters rely on: numbers by value, strings lexicographic, NULL first.
fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (x, y) {
            (Value::Number(nx), Value::Number(ny)) => nx
                .as_f64()
                .partial_cmp(&ny.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(sx), Value::String(sy)) => sx.cmp(sy),
            (Value::Bool(bx), Value::Bool(by)) => bx.cmp(by),
            _ => Ordering::Equal,
        },
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> AppResult<Vec<Value>> {
        let tables = self.collections.lock().unwrap_or_else(|p| p.into_inner());
        let mut rows: Vec<Map<String, Value>> = tables
            .get(collection)
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter(|row| matches_filters(row, filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(order) = order {
            rows.sort_by(|ra, rb| {
                let cmp = compare_cells(ra.get(&order.column), rb.get(&order.column));
                if order.descending {
                    cmp.reverse()
                } else {
                    cmp
                }
            });
        }
        Ok(rows.into_iter().map(Value::Object).collect())
    }

    async fn insert(&self, collection: &str, mut row: Map<String, Value>) -> AppResult<Value> {
        let mut tables = self.collections.lock().unwrap_or_else(|p| p.into_inner());
        let table = tables
            .entry(collection.to_string())
            .or_insert_with(Table::new);
        row.remove("id");
        let id = table.next_id;
        table.next_id += 1;
        row.insert("id".into(), Value::from(id));
        table.rows.push(row.clone());
        let created = Value::Object(row);
        self.hub
            .publish(&ChangeEvent::inserted(collection, created.clone()));
        Ok(created)
    }

    async fn update(
        &self,
        collection: &str,
        id: i64,
        mut patch: Map<String, Value>,
    ) -> AppResult<Option<Value>> {
        patch.remove("id");
        let mut tables = self.collections.lock().unwrap_or_else(|p| p.into_inner());
        if patch.is_empty() {
            // Nothing to write; report the current row without an event.
            let row = tables.get(collection).and_then(|table| {
                table
                    .rows
                    .iter()
                    .find(|row| row.get("id").and_then(Value::as_i64) == Some(id))
                    .cloned()
            });
            return Ok(row.map(Value::Object));
        }
        let Some(table) = tables.get_mut(collection) else {
            return Ok(None);
        };
        let Some(row) = table
            .rows
            .iter_mut()
            .find(|row| row.get("id").and_then(Value::as_i64) == Some(id))
        else {
            return Ok(None);
        };
        for (key, value) in patch {
            row.insert(key, value);
        }
        let updated = Value::Object(row.clone());
        self.hub
            .publish(&ChangeEvent::updated(collection, updated.clone(), id));
        Ok(Some(updated))
    }

    async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        let mut tables = self.collections.lock().unwrap_or_else(|p| p.into_inner());
        let Some(table) = tables.get_mut(collection) else {
            return Ok(());
        };
        let Some(position) = table
            .rows
            .iter()
            .position(|row| row.get("id").and_then(Value::as_i64) == Some(id))
        else {
            return Ok(());
        };
        let removed = table.rows.remove(position);
        self.hub
            .publish(&ChangeEvent::deleted(collection, Value::Object(removed)));
        Ok(())
    }

    fn subscribe(&self, collection: &str, filter: Option<Filter>) -> FeedSubscription {
        self.hub.subscribe(collection, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CLIENTES;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn insert_ignores_caller_supplied_id() {
        let store = MemoryStore::new();
        let created = store
            .insert(CLIENTES, obj(json!({ "id": 999, "estatus": "Pendiente" })))
            .await
            .unwrap();
        assert_eq!(created.get("id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn select_orders_nulls_first_ascending() {
        let store = MemoryStore::new();
        store
            .insert(CLIENTES, obj(json!({ "monto": 50.0 })))
            .await
            .unwrap();
        store.insert(CLIENTES, obj(json!({}))).await.unwrap();
        store
            .insert(CLIENTES, obj(json!({ "monto": 10.0 })))
            .await
            .unwrap();

        let rows = store
            .select(CLIENTES, &[], Some(&OrderBy::asc("monto")))
            .await
            .unwrap();
        let montos: Vec<Option<f64>> = rows
            .iter()
            .map(|r| r.get("monto").and_then(Value::as_f64))
            .collect();
        assert_eq!(montos, vec![None, Some(10.0), Some(50.0)]);
    }
}
