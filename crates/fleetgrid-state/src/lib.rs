//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for targets, distributions, rollouts, rollout groups, actions and
//! per-rollout scheduler leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Index tables with composite keys (`{group}/{action}`, `{rollout}/{target}`)
//! are kept in the same write transaction as the records they index, so
//! counts can be computed with one prefix scan.
//!
//! Every mutation runs inside [`StateStore::write`]: the closure receives a
//! [`StoreTxn`] and its writes are committed only if it returns `Ok`. redb
//! serializes write transactions, which gives the engine its atomic
//! conditional bulk update: a status switch re-checks each row's current
//! status inside the transaction, so a racing device report either commits
//! before it (and the row no longer matches) or after it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use txn::{ActionScope, ActionSelector, StoreTxn};
pub use types::*;
