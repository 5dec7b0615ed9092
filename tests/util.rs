#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use cartera::{migrate, StoreHandle};
use serde_json::{Map, Value};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    migrate::apply_migrations(&pool)
        .await
        .expect("apply migrations");
    pool
}

pub async fn sqlite_store() -> StoreHandle {
    StoreHandle::sqlite(temp_pool().await)
}

pub fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
