//! Executive roster: the period's sales agents with their quotas.
//!
//! Reads are period-scoped like the client roster, but identifiers here are
//! only unique within a period; the same agent gets a fresh record (and
//! identifier) every month, created by hand or by the rollover. `nombre` is
//! the identity that survives across periods, so the linked-accounts join
//! runs on names. There is no change-feed subscription for executives; the
//! mirror converges through write-through patches and full refreshes.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::model::{Executive, Profile, EJECUTIVOS, EXECUTIVES_NO_PRIOR_DATA, PERFILES};
use crate::period::Period;
use crate::store::{row_id, Filter, OrderBy, StoreHandle};
use crate::{AppError, AppResult};

/// Which records a refresh keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RosterPolicy {
    /// Only executives whose name was ever linked to an account profile, in
    /// any period. No linked profiles at all forces the roster empty.
    #[default]
    LinkedAccounts,
    /// Every record in the period.
    AllRecords,
}

pub struct ExecutiveRoster {
    store: StoreHandle,
    period: Period,
    policy: RosterPolicy,
    epoch: u64,
    mirror: Vec<Executive>,
    loading: bool,
    last_error: Option<AppError>,
}

impl ExecutiveRoster {
    pub fn new(store: StoreHandle, period: Period) -> Self {
        ExecutiveRoster::with_policy(store, period, RosterPolicy::default())
    }

    pub fn with_policy(store: StoreHandle, period: Period, policy: RosterPolicy) -> Self {
        ExecutiveRoster {
            store,
            period,
            policy,
            epoch: 0,
            mirror: Vec::new(),
            loading: true,
            last_error: None,
        }
    }

    /// `new` plus the initial fetch.
    pub async fn open(store: StoreHandle, period: Period) -> AppResult<Self> {
        let mut roster = ExecutiveRoster::new(store, period);
        roster.refresh().await?;
        Ok(roster)
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn policy(&self) -> RosterPolicy {
        self.policy
    }

    /// Current mirror, ordered by identifier ascending.
    pub fn executives(&self) -> &[Executive] {
        &self.mirror
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    /// The payroll-credit partition.
    pub fn nomina(&self) -> Vec<&Executive> {
        self.mirror.iter().filter(|ex| ex.is_nomina()).collect()
    }

    /// The motorcycle partition.
    pub fn motos(&self) -> Vec<&Executive> {
        self.mirror.iter().filter(|ex| ex.is_motos()).collect()
    }

    /// Replaces the mirror with a fresh period read under the active policy.
    /// A failed read keeps the previous mirror.
    pub async fn refresh(&mut self) -> AppResult<()> {
        self.loading = true;
        let epoch = self.epoch;
        let store = self.store.clone();
        let result = read_roster(&store, self.period, self.policy).await;
        self.loading = false;
        match result {
            Ok(roster) => {
                self.install_snapshot(epoch, roster);
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "cartera",
                    event = "executives_fetch_failed",
                    period = %self.period,
                    error = %err
                );
                Err(self.fail(err))
            }
        }
    }

    fn install_snapshot(&mut self, epoch: u64, roster: Vec<Executive>) {
        if epoch != self.epoch {
            info!(
                target: "cartera",
                event = "stale_fetch_discarded",
                collection = EJECUTIVOS,
                fetch_epoch = epoch,
                current_epoch = self.epoch
            );
            return;
        }
        self.mirror = roster;
    }

    /// Installs a new period and refetches.
    pub async fn set_period(&mut self, period: Period) -> AppResult<()> {
        self.period = period;
        self.epoch += 1;
        self.refresh().await
    }

    /// Write-through of `meta`; the mirror entry is patched immediately.
    pub async fn update_meta(&mut self, id: i64, meta: f64) -> AppResult<()> {
        let store = self.store.clone();
        let mut patch = Map::new();
        patch.insert("meta".into(), Value::from(meta));
        match store.update(EJECUTIVOS, id, patch).await {
            Ok(_) => {
                if let Some(ex) = self.mirror.iter_mut().find(|ex| ex.id == id) {
                    ex.meta = Some(meta);
                }
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Write-through of `activo`; the mirror entry is patched immediately.
    pub async fn toggle_activo(&mut self, id: i64, activo: bool) -> AppResult<()> {
        let store = self.store.clone();
        let mut patch = Map::new();
        patch.insert("activo".into(), Value::from(activo));
        match store.update(EJECUTIVOS, id, patch).await {
            Ok(_) => {
                if let Some(ex) = self.mirror.iter_mut().find(|ex| ex.id == id) {
                    ex.activo = activo;
                }
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Seeds the current period from the previous one: every prior record is
    /// recreated with a fresh identifier and the current `mes`/`anio`, all
    /// other fields copied verbatim. Fails with `EXECUTIVES/NO_PRIOR_DATA`
    /// when the prior period is empty. Ends with a full refresh and returns
    /// how many records were copied.
    pub async fn copy_from_previous_month(&mut self) -> AppResult<usize> {
        let store = self.store.clone();
        let prev = self.period.previous();
        let filters = [
            Filter::eq("mes", prev.month),
            Filter::eq("anio", prev.year),
        ];
        let rows = match store.select(EJECUTIVOS, &filters, None).await {
            Ok(rows) => rows,
            Err(err) => return Err(self.fail(err)),
        };
        if rows.is_empty() {
            let err = AppError::new(EXECUTIVES_NO_PRIOR_DATA, "No hay datos del mes anterior")
                .with_context("mes", prev.month.to_string())
                .with_context("anio", prev.year.to_string());
            return Err(self.fail(err));
        }

        let mut copied = 0usize;
        for row in rows {
            let Value::Object(mut record) = row else {
                continue;
            };
            record.remove("id");
            record.insert("mes".into(), Value::from(self.period.month));
            record.insert("anio".into(), Value::from(self.period.year));
            if let Err(err) = store.insert(EJECUTIVOS, record).await {
                return Err(self.fail(err));
            }
            copied += 1;
        }
        info!(
            target: "cartera",
            event = "roster_rollover",
            copied,
            period = %self.period
        );
        self.refresh().await?;
        Ok(copied)
    }

    fn fail(&mut self, err: AppError) -> AppError {
        self.last_error = Some(err.clone());
        err
    }
}

async fn read_roster(
    store: &StoreHandle,
    period: Period,
    policy: RosterPolicy,
) -> AppResult<Vec<Executive>> {
    let filters = [
        Filter::eq("mes", period.month),
        Filter::eq("anio", period.year),
    ];
    let rows = store
        .select(EJECUTIVOS, &filters, Some(&OrderBy::asc("id")))
        .await?;
    let mut roster: Vec<Executive> = rows.into_iter().filter_map(decode_executive_lossy).collect();
    if policy == RosterPolicy::LinkedAccounts {
        match linked_names(store).await? {
            Some(names) => roster.retain(|ex| names.contains(&ex.nombre)),
            // No account was ever linked; the roster fails closed.
            None => roster.clear(),
        }
    }
    Ok(roster)
}

/// Names of executives that have ever had an account profile linked, across
/// all periods. `None` when no profile links an executive at all.
async fn linked_names(store: &StoreHandle) -> AppResult<Option<HashSet<String>>> {
    let profiles = store.select(PERFILES, &[], None).await?;
    let linked_ids: HashSet<i64> = profiles
        .into_iter()
        .filter_map(decode_profile_lossy)
        .filter_map(|profile| profile.ejecutivo_id)
        .collect();
    if linked_ids.is_empty() {
        return Ok(None);
    }

    let all = store.select(EJECUTIVOS, &[], None).await?;
    let names = all
        .iter()
        .filter_map(|row| {
            let id = row_id(row)?;
            if !linked_ids.contains(&id) {
                return None;
            }
            row.get("nombre").and_then(Value::as_str).map(str::to_owned)
        })
        .collect();
    Ok(Some(names))
}

fn decode_executive_lossy(row: Value) -> Option<Executive> {
    match serde_json::from_value(row) {
        Ok(ex) => Some(ex),
        Err(err) => {
            warn!(target: "cartera", event = "executive_decode_failed", error = %err);
            None
        }
    }
}

fn decode_profile_lossy(row: Value) -> Option<Profile> {
    match serde_json::from_value(row) {
        Ok(profile) => Some(profile),
        Err(err) => {
            warn!(target: "cartera", event = "profile_decode_failed", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ex(value: Value) -> Executive {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn partitions_split_by_tipo() {
        let mut roster =
            ExecutiveRoster::new(StoreHandle::in_memory(), Period::new(7, 2025).unwrap());
        roster.mirror = vec![
            ex(json!({ "id": 1, "mes": 7, "anio": 2025, "nombre": "Ana", "tipo": "nómina" })),
            ex(json!({ "id": 2, "mes": 7, "anio": 2025, "nombre": "Luz", "tipo": "nomina" })),
            ex(json!({ "id": 3, "mes": 7, "anio": 2025, "nombre": "Sol", "tipo": "motos" })),
            ex(json!({ "id": 4, "mes": 7, "anio": 2025, "nombre": "Rex" })),
        ];
        assert_eq!(roster.nomina().len(), 2);
        assert_eq!(roster.motos().len(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_is_discarded() {
        let mut roster =
            ExecutiveRoster::new(StoreHandle::in_memory(), Period::new(7, 2025).unwrap());
        let stale = roster.epoch;
        roster.epoch += 1;
        roster.install_snapshot(
            stale,
            vec![ex(json!({ "id": 1, "mes": 7, "anio": 2025, "nombre": "Ana" }))],
        );
        assert!(roster.mirror.is_empty());
    }
}
