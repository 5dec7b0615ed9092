use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Column, Row, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use super::{
    ensure_collection, ChangeEvent, CollectionStore, FeedHub, FeedSubscription, Filter, OrderBy,
};
use crate::model::STORE_INVALID_COLUMN;
use crate::{AppError, AppResult};

static COLUMN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid column pattern"));

/// SQLite-backed store. Collections map to tables; writes run in a
/// transaction and publish their change event only after commit.
pub struct SqliteStore {
    pool: SqlitePool,
    hub: FeedHub,
    /// Held across commit and publish so feed delivery order matches commit
    /// order when writers race. A writer reaching the gate already holds the
    /// database write lock.
    write_gate: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteStore {
            pool,
            hub: FeedHub::new(),
            write_gate: Mutex::new(()),
        }
    }
}

fn ensure_column(column: &str) -> AppResult<()> {
    if COLUMN_RE.is_match(column) {
        Ok(())
    } else {
        Err(
            AppError::new(STORE_INVALID_COLUMN, "Column name is not a valid identifier")
                .with_context("column", column),
        )
    }
}

fn wrap(err: sqlx::Error, operation: &str, collection: &str) -> AppError {
    AppError::from(err)
        .with_context("operation", operation)
        .with_context("collection", collection)
}

fn decode_row(row: SqliteRow) -> Value {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let value = match row.try_get_raw(idx) {
            Ok(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get::<i64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(col.name().to_string(), value);
    }
    Value::Object(map)
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    v: &Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        _ => q.bind(v.to_string()),
    }
}

#[async_trait]
impl CollectionStore for SqliteStore {
    async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> AppResult<Vec<Value>> {
        ensure_collection(collection)?;
        let mut sql = format!("SELECT * FROM {collection}");
        if !filters.is_empty() {
            for filter in filters {
                ensure_column(&filter.column)?;
            }
            let clauses: Vec<String> = filters
                .iter()
                .map(|filter| format!("{} = ?", filter.column))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = order {
            ensure_column(&order.column)?;
            sql.push_str(&format!(
                " ORDER BY {} {}",
                order.column,
                if order.descending { "DESC" } else { "ASC" }
            ));
        }

        let mut query = sqlx::query(&sql);
        for filter in filters {
            query = bind_value(query, &filter.value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| wrap(e, "select", collection))?;
        Ok(rows.into_iter().map(decode_row).collect())
    }

    async fn insert(&self, collection: &str, mut row: Map<String, Value>) -> AppResult<Value> {
        ensure_collection(collection)?;
        row.remove("id");
        for col in row.keys() {
            ensure_column(col)?;
        }

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let inserted_id = if row.is_empty() {
            sqlx::query(&format!("INSERT INTO {collection} DEFAULT VALUES"))
                .execute(&mut *tx)
                .await
                .map_err(|e| wrap(e, "insert", collection))?
                .last_insert_rowid()
        } else {
            let cols: Vec<String> = row.keys().cloned().collect();
            let placeholders = vec!["?"; cols.len()].join(",");
            let sql = format!(
                "INSERT INTO {collection} ({}) VALUES ({placeholders})",
                cols.join(",")
            );
            let mut query = sqlx::query(&sql);
            for col in &cols {
                query = bind_value(query, row.get(col).unwrap_or(&Value::Null));
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| wrap(e, "insert", collection))?
                .last_insert_rowid()
        };

        let created_row = sqlx::query(&format!("SELECT * FROM {collection} WHERE id = ?"))
            .bind(inserted_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| wrap(e, "insert", collection))?;

        let gate = self.write_gate.lock().await;
        tx.commit().await.map_err(AppError::from)?;
        let created = decode_row(created_row);
        self.hub
            .publish(&ChangeEvent::inserted(collection, created.clone()));
        drop(gate);
        Ok(created)
    }

    async fn update(
        &self,
        collection: &str,
        id: i64,
        mut patch: Map<String, Value>,
    ) -> AppResult<Option<Value>> {
        ensure_collection(collection)?;
        patch.remove("id");
        for col in patch.keys() {
            ensure_column(col)?;
        }
        if patch.is_empty() {
            // Nothing to write; report the current row without an event.
            let row = sqlx::query(&format!("SELECT * FROM {collection} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| wrap(e, "update", collection))?;
            return Ok(row.map(decode_row));
        }

        let cols: Vec<String> = patch.keys().cloned().collect();
        let set_clause: Vec<String> = cols.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "UPDATE {collection} SET {} WHERE id = ?",
            set_clause.join(",")
        );

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let mut query = sqlx::query(&sql);
        for col in &cols {
            query = bind_value(query, patch.get(col).unwrap_or(&Value::Null));
        }
        let result = query
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| wrap(e, "update", collection))?;
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(None);
        }

        let row = sqlx::query(&format!("SELECT * FROM {collection} WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| wrap(e, "update", collection))?;

        let gate = self.write_gate.lock().await;
        tx.commit().await.map_err(AppError::from)?;
        let updated = decode_row(row);
        self.hub
            .publish(&ChangeEvent::updated(collection, updated.clone(), id));
        drop(gate);
        Ok(Some(updated))
    }

    async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        ensure_collection(collection)?;
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let row = sqlx::query(&format!("SELECT * FROM {collection} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| wrap(e, "delete", collection))?;
        let Some(row) = row else {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(());
        };
        sqlx::query(&format!("DELETE FROM {collection} WHERE id = ?"))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| wrap(e, "delete", collection))?;

        let gate = self.write_gate.lock().await;
        tx.commit().await.map_err(AppError::from)?;
        self.hub
            .publish(&ChangeEvent::deleted(collection, decode_row(row)));
        drop(gate);
        Ok(())
    }

    fn subscribe(&self, collection: &str, filter: Option<Filter>) -> FeedSubscription {
        self.hub.subscribe(collection, filter)
    }
}
