//! Client roster: a period-scoped mirror of `clientes` with write-through
//! mutations and change-feed reconciliation.
//!
//! The mirror is owned by the `ClientRoster` value; every mutation takes
//! `&mut self`, so two operations can never race on it. Feed events queue in
//! the subscription inbox until `drain_feed` folds them in. Mutations patch
//! the mirror optimistically from the row the store returns, and the
//! reconciler applies the feed's echo of the same write as an idempotent
//! no-op.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::model::{
    Client, CLIENTES, CLIENTS_DECODE_ERROR, CLIENTS_IMMUTABLE_FIELD, ESTATUS_TERMINAL,
    FIXED_CLIENT_FIELDS, PRODUCTO_NOMINA,
};
use crate::period::Period;
use crate::store::{row_id, ChangeEvent, ChangeKind, FeedSubscription, Filter, OrderBy, StoreHandle};
use crate::time::today_ymd;
use crate::{AppError, AppResult};

/// Who the roster is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerScope {
    /// Administrators see every record in the period.
    All,
    /// A sales agent sees only records whose `ejecutivo` equals their name.
    Executive(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientScope {
    pub period: Period,
    pub owner: OwnerScope,
}

impl ClientScope {
    pub fn admin(period: Period) -> Self {
        ClientScope {
            period,
            owner: OwnerScope::All,
        }
    }

    pub fn executive(period: Period, nombre: impl Into<String>) -> Self {
        ClientScope {
            period,
            owner: OwnerScope::Executive(nombre.into()),
        }
    }
}

pub struct ClientRoster {
    store: StoreHandle,
    scope: ClientScope,
    /// Bumped on every scope change; a completed fetch is installed only if
    /// its epoch still matches.
    epoch: u64,
    mirror: Vec<Client>,
    loading: bool,
    last_error: Option<AppError>,
    feed: Option<FeedSubscription>,
}

impl ClientRoster {
    /// Builds the roster and opens its change-feed subscription. The mirror
    /// stays empty until the first `refresh`.
    pub fn new(store: StoreHandle, scope: ClientScope) -> Self {
        let mut roster = ClientRoster {
            store,
            scope,
            epoch: 0,
            mirror: Vec::new(),
            loading: true,
            last_error: None,
            feed: None,
        };
        roster.resubscribe();
        roster
    }

    /// `new` plus the initial fetch.
    pub async fn open(store: StoreHandle, scope: ClientScope) -> AppResult<Self> {
        let mut roster = ClientRoster::new(store, scope);
        roster.refresh().await?;
        Ok(roster)
    }

    pub fn scope(&self) -> &ClientScope {
        &self.scope
    }

    /// Current mirror, newest first.
    pub fn clients(&self) -> &[Client] {
        &self.mirror
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats::compute(&self.mirror)
    }

    /// Replaces the mirror with a fresh scoped read, newest first. A failed
    /// read keeps the previous mirror.
    pub async fn refresh(&mut self) -> AppResult<()> {
        self.loading = true;
        let epoch = self.epoch;
        let store = self.store.clone();

        let mut filters = vec![
            Filter::eq("mes_registro", self.scope.period.month),
            Filter::eq("anio_registro", self.scope.period.year),
        ];
        if let OwnerScope::Executive(nombre) = &self.scope.owner {
            filters.push(Filter::eq("ejecutivo", nombre.clone()));
        }

        let read = store
            .select(CLIENTES, &filters, Some(&OrderBy::desc("id")))
            .await;
        self.loading = false;
        match read {
            Ok(rows) => {
                self.install_snapshot(epoch, rows);
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "cartera",
                    event = "clients_fetch_failed",
                    period = %self.scope.period,
                    error = %err
                );
                Err(self.fail(err))
            }
        }
    }

    /// Installs a completed read unless the scope moved on while it was in
    /// flight.
    fn install_snapshot(&mut self, epoch: u64, rows: Vec<Value>) {
        if epoch != self.epoch {
            info!(
                target: "cartera",
                event = "stale_fetch_discarded",
                collection = CLIENTES,
                fetch_epoch = epoch,
                current_epoch = self.epoch
            );
            return;
        }
        self.mirror = rows.into_iter().filter_map(decode_client_lossy).collect();
    }

    /// Installs a new scope and refetches. The subscription is re-opened only
    /// when the period changed; the old one is dropped first, so events
    /// queued for the old period are discarded rather than replayed.
    pub async fn set_scope(&mut self, scope: ClientScope) -> AppResult<()> {
        let period_changed = scope.period != self.scope.period;
        self.scope = scope;
        self.epoch += 1;
        if period_changed {
            self.resubscribe();
        }
        self.refresh().await
    }

    fn resubscribe(&mut self) {
        // Old channel gone before the new one exists.
        self.feed = None;
        let filter = Filter::eq("anio_registro", self.scope.period.year);
        self.feed = Some(self.store.subscribe(CLIENTES, Some(filter)));
    }

    /// Creates a record in the active period. `mes_registro` and
    /// `anio_registro` always come from the scope, whatever the payload says;
    /// an absent or blank `fecha_inicio` defaults to today. Returns the row
    /// as persisted, identifier included.
    pub async fn add(&mut self, data: Map<String, Value>) -> AppResult<Client> {
        let store = self.store.clone();
        let mut row = data;
        row.insert("mes_registro".into(), Value::from(self.scope.period.month));
        row.insert("anio_registro".into(), Value::from(self.scope.period.year));
        let fecha_supplied = row.get("fecha_inicio").map_or(false, |v| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        });
        if !fecha_supplied {
            row.insert("fecha_inicio".into(), Value::from(today_ymd()));
        }

        let created = match store.insert(CLIENTES, row).await {
            Ok(value) => value,
            Err(err) => return Err(self.fail(err)),
        };
        let client = match decode_client(created) {
            Ok(client) => client,
            Err(err) => return Err(self.fail(err)),
        };
        self.apply_insert(client.clone());
        Ok(client)
    }

    /// Write-through of one field. The identifier and the period fields are
    /// fixed at creation and refused here.
    pub async fn update_field(&mut self, id: i64, field: &str, value: Value) -> AppResult<()> {
        if FIXED_CLIENT_FIELDS.contains(&field) {
            let err = AppError::new(
                CLIENTS_IMMUTABLE_FIELD,
                "Field is fixed at creation and cannot be updated",
            )
            .with_context("field", field);
            return Err(self.fail(err));
        }
        let mut patch = Map::new();
        patch.insert(field.to_string(), value);
        self.write_through(id, patch).await.map(|_| ())
    }

    /// Writes `estatus` and its accompanying note. Reaching a terminal status
    /// also stamps `fecha_final` with today's date; any other transition
    /// leaves `fecha_final` as it was.
    pub async fn update_status(
        &mut self,
        id: i64,
        estatus: &str,
        actualizacion: &str,
    ) -> AppResult<()> {
        let mut patch = Map::new();
        patch.insert("estatus".into(), Value::from(estatus));
        patch.insert("actualizacion".into(), Value::from(actualizacion));
        if ESTATUS_TERMINAL.contains(&estatus) {
            patch.insert("fecha_final".into(), Value::from(today_ymd()));
        }
        self.write_through(id, patch).await.map(|_| ())
    }

    /// Deletes on the server and splices the mirror immediately. The feed's
    /// echo of the same delete lands as a no-op.
    pub async fn delete(&mut self, id: i64) -> AppResult<()> {
        let store = self.store.clone();
        match store.delete(CLIENTES, id).await {
            Ok(()) => {
                self.remove_local(id);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn write_through(
        &mut self,
        id: i64,
        patch: Map<String, Value>,
    ) -> AppResult<Option<Client>> {
        let store = self.store.clone();
        match store.update(CLIENTES, id, patch).await {
            Ok(Some(row)) => match decode_client_lossy(row) {
                Some(client) => {
                    self.apply_update(client.clone());
                    Ok(Some(client))
                }
                None => Ok(None),
            },
            // No row with that id on the server; nothing to patch.
            Ok(None) => Ok(None),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Drains the subscription inbox, folding each event into the mirror.
    /// Returns how many events changed it.
    pub fn drain_feed(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.feed.as_mut().and_then(FeedSubscription::try_next) {
            if self.apply_event(event) {
                applied += 1;
            }
        }
        applied
    }

    /// Folds one change event into the mirror. Insert, update, and delete are
    /// all idempotent against the optimistic patches the mutations apply.
    /// Returns whether the mirror changed.
    pub fn apply_event(&mut self, event: ChangeEvent) -> bool {
        if event.collection != CLIENTES {
            return false;
        }
        match event.kind {
            ChangeKind::Insert => {
                let Some(client) = event.new.and_then(decode_client_lossy) else {
                    return false;
                };
                // The subscription filters by year; the month check is ours.
                if client.mes_registro != self.scope.period.month {
                    debug!(
                        target: "cartera",
                        event = "feed_insert_ignored",
                        mes = client.mes_registro,
                        active = self.scope.period.month
                    );
                    return false;
                }
                self.apply_insert(client);
                true
            }
            ChangeKind::Update => {
                let Some(client) = event.new.and_then(decode_client_lossy) else {
                    return false;
                };
                self.apply_update(client)
            }
            ChangeKind::Delete => {
                let Some(id) = event.old.as_ref().and_then(row_id) else {
                    return false;
                };
                self.remove_local(id)
            }
        }
    }

    /// Prepend, or replace in place when the identifier is already mirrored.
    fn apply_insert(&mut self, client: Client) {
        if let Some(slot) = self.mirror.iter_mut().find(|c| c.id == client.id) {
            *slot = client;
        } else {
            self.mirror.insert(0, client);
        }
    }

    /// Replace in place; an update for an unmirrored identifier never
    /// inserts.
    fn apply_update(&mut self, client: Client) -> bool {
        if let Some(slot) = self.mirror.iter_mut().find(|c| c.id == client.id) {
            *slot = client;
            true
        } else {
            false
        }
    }

    fn remove_local(&mut self, id: i64) -> bool {
        let before = self.mirror.len();
        self.mirror.retain(|c| c.id != id);
        self.mirror.len() != before
    }

    fn fail(&mut self, err: AppError) -> AppError {
        self.last_error = Some(err.clone());
        err
    }
}

fn decode_client(row: Value) -> AppResult<Client> {
    serde_json::from_value(row).map_err(|err| {
        AppError::new(CLIENTS_DECODE_ERROR, "Stored client row failed to decode")
            .with_cause(AppError::from(err))
    })
}

fn decode_client_lossy(row: Value) -> Option<Client> {
    match decode_client(row) {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(target: "cartera", event = "client_decode_failed", error = %err);
            None
        }
    }
}

/// Derived figures the dashboard shows next to the roster. Pure function of
/// the mirror, recomputed on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStats {
    pub total_clientes: usize,
    /// Records whose status is not yet terminal.
    pub en_pipeline: usize,
    /// The records dispersed this period.
    pub dispersiones: Vec<Client>,
    /// Pesos dispersed on payroll credit.
    pub total_monto_nomina: f64,
    /// Units (not pesos) dispersed on anything that is not payroll credit.
    pub motos_vendidas: usize,
}

impl ClientStats {
    pub fn compute(clients: &[Client]) -> Self {
        let dispersiones: Vec<Client> = clients
            .iter()
            .filter(|c| c.is_dispersado())
            .cloned()
            .collect();
        let en_pipeline = clients.iter().filter(|c| !c.is_terminal()).count();
        let total_monto_nomina = clients
            .iter()
            .filter(|c| c.producto.as_deref() == Some(PRODUCTO_NOMINA) && c.is_dispersado())
            .map(|c| c.monto.unwrap_or(0.0))
            .sum();
        let motos_vendidas = clients
            .iter()
            .filter(|c| c.producto.as_deref() != Some(PRODUCTO_NOMINA) && c.is_dispersado())
            .count();
        ClientStats {
            total_clientes: clients.len(),
            en_pipeline,
            dispersiones,
            total_monto_nomina,
            motos_vendidas,
        }
    }
}
