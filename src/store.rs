//! Persistence-and-notification contract the rosters are built on.
//!
//! A `CollectionStore` offers equality-filtered, ordered reads over named
//! collections, row creation/update/delete by primary key, and a per-collection
//! change stream that reports every committed write, including writes made by
//! this same process. Rows cross the boundary as JSON objects. Two reference
//! implementations ship with the crate: `sqlite::SqliteStore` and
//! `memory::MemoryStore`.

pub mod memory;
pub mod sqlite;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::model::{COLLECTIONS, STORE_UNKNOWN_COLLECTION};
use crate::{AppError, AppResult};

/// Equality predicate on a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Result ordering by a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level notification for one committed write.
///
/// `new` carries the full row for inserts and updates; `old` carries the full
/// prior row for deletes and at least the identifier for updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn inserted(collection: impl Into<String>, row: Value) -> Self {
        ChangeEvent {
            collection: collection.into(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn updated(collection: impl Into<String>, row: Value, id: i64) -> Self {
        ChangeEvent {
            collection: collection.into(),
            kind: ChangeKind::Update,
            new: Some(row),
            old: Some(json!({ "id": id })),
        }
    }

    pub fn deleted(collection: impl Into<String>, row: Value) -> Self {
        ChangeEvent {
            collection: collection.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(row),
        }
    }
}

/// Identifier of the row an event describes, if the payload carries one.
pub(crate) fn row_id(row: &Value) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}

/// Equality over JSON scalars that treats `1000` and `1000.0` as the same
/// number, the way the backends compare column values.
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// One subscriber's inbox. Events queue here in commit order until the owner
/// drains them; dropping the subscription releases the registration.
pub struct FeedSubscription {
    collection: String,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl FeedSubscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next queued event, if any, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next event; `None` once the store is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

const FEED_BUFFER: usize = 256;

struct FeedTap {
    collection: String,
    filter: Option<Filter>,
    tx: mpsc::Sender<ChangeEvent>,
}

/// Fan-out registry shared by the store implementations.
pub(crate) struct FeedHub {
    taps: Mutex<Vec<FeedTap>>,
}

impl FeedHub {
    pub fn new() -> Self {
        FeedHub {
            taps: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, collection: &str, filter: Option<Filter>) -> FeedSubscription {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut taps = self.taps.lock().unwrap_or_else(|p| p.into_inner());
        taps.push(FeedTap {
            collection: collection.to_string(),
            filter,
            tx,
        });
        FeedSubscription {
            collection: collection.to_string(),
            rx,
        }
    }

    pub fn publish(&self, event: &ChangeEvent) {
        let mut taps = self.taps.lock().unwrap_or_else(|p| p.into_inner());
        taps.retain(|tap| !tap.tx.is_closed());
        for tap in taps.iter() {
            if tap.collection != event.collection {
                continue;
            }
            if let Some(filter) = &tap.filter {
                if !event_matches(event, filter) {
                    continue;
                }
            }
            match tap.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        target: "cartera",
                        event = "feed_overflow",
                        collection = %event.collection
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

fn event_matches(event: &ChangeEvent, filter: &Filter) -> bool {
    let row = event.new.as_ref().or(event.old.as_ref());
    match row.and_then(|r| r.get(&filter.column)) {
        Some(found) => value_eq(found, &filter.value),
        None => false,
    }
}

/// The store surface the rosters depend on. Object-safe so they can be
/// handed any implementation, real or fake.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Point-in-time read with equality filters and optional ordering.
    async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> AppResult<Vec<Value>>;

    /// Creates a row and returns it as persisted, generated identifier
    /// included. A caller-supplied `id` is ignored.
    async fn insert(&self, collection: &str, row: Map<String, Value>) -> AppResult<Value>;

    /// Patches the row with the given identifier. Returns the updated row, or
    /// `None` when no row matched (not an error).
    async fn update(
        &self,
        collection: &str,
        id: i64,
        patch: Map<String, Value>,
    ) -> AppResult<Option<Value>>;

    /// Deletes by identifier. Deleting an absent row is a no-op.
    async fn delete(&self, collection: &str, id: i64) -> AppResult<()>;

    /// Opens a change stream for the collection, optionally narrowed by one
    /// equality predicate. Events arrive in commit order.
    fn subscribe(&self, collection: &str, filter: Option<Filter>) -> FeedSubscription;
}

fn ensure_collection(collection: &str) -> AppResult<()> {
    if COLLECTIONS.contains(&collection) {
        Ok(())
    } else {
        Err(
            AppError::new(STORE_UNKNOWN_COLLECTION, "Unknown collection")
                .with_context("collection", collection),
        )
    }
}

/// Cloneable handle through which the rosters reach their store. Enforces the
/// collection allowlist before delegating.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn CollectionStore>,
}

impl StoreHandle {
    /// SQLite-backed store over an opened pool.
    pub fn sqlite(pool: sqlx::SqlitePool) -> Self {
        StoreHandle {
            inner: Arc::new(sqlite::SqliteStore::new(pool)),
        }
    }

    /// In-memory store, the test fixture and embeddable default.
    pub fn in_memory() -> Self {
        StoreHandle {
            inner: Arc::new(memory::MemoryStore::new()),
        }
    }

    /// Any other implementation of the contract.
    pub fn custom(store: Arc<dyn CollectionStore>) -> Self {
        StoreHandle { inner: store }
    }

    pub async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> AppResult<Vec<Value>> {
        ensure_collection(collection)?;
        self.inner.select(collection, filters, order).await
    }

    pub async fn insert(&self, collection: &str, row: Map<String, Value>) -> AppResult<Value> {
        ensure_collection(collection)?;
        self.inner.insert(collection, row).await
    }

    pub async fn update(
        &self,
        collection: &str,
        id: i64,
        patch: Map<String, Value>,
    ) -> AppResult<Option<Value>> {
        ensure_collection(collection)?;
        self.inner.update(collection, id, patch).await
    }

    pub async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        ensure_collection(collection)?;
        self.inner.delete(collection, id).await
    }

    /// Subscribing to a collection outside the allowlist yields a stream that
    /// never delivers.
    pub fn subscribe(&self, collection: &str, filter: Option<Filter>) -> FeedSubscription {
        self.inner.subscribe(collection, filter)
    }
}
