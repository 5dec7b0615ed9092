//! Period-scoped data access for a small lending dashboard.
//!
//! Two roster managers mirror the rows of one (month, year) period from a
//! pluggable collection store: [`ClientRoster`] for loan applications and
//! [`ExecutiveRoster`] for sales agents and their quotas. Mutations write
//! through to the store and patch the mirror optimistically; the client
//! roster additionally folds a per-collection change feed back into its
//! mirror, so writes made elsewhere converge too. The store is an injected
//! collaborator behind [`CollectionStore`]; SQLite and in-memory
//! implementations ship in [`store`].

pub mod clients;
pub mod db;
mod error;
pub mod executives;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod period;
pub mod store;
mod time;

pub use clients::{ClientRoster, ClientScope, ClientStats, OwnerScope};
pub use error::{AppError, AppResult};
pub use executives::{ExecutiveRoster, RosterPolicy};
pub use model::{Client, Executive, Profile};
pub use period::{Period, PeriodError};
pub use store::{
    ChangeEvent, ChangeKind, CollectionStore, FeedSubscription, Filter, OrderBy, StoreHandle,
};
pub use time::{now_ms, today_ymd};
