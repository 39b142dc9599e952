//! qscale-state — entity store, secret store and change feed for qscale.
//!
//! The control loop talks to its collaborators through two traits:
//!
//! - [`EntityStore`]: workloads, instances and broker configs, plus a change
//!   feed of [`StoreEvent`]s.
//! - [`SecretStore`]: opaque secret values addressed by `(namespace, name, key)`.
//!
//! [`StateStore`] implements both on top of [redb](https://docs.rs/redb).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{name}`, `{namespace}/{workload}:{instance}`)
//! enable prefix scans for a workload's instances.
//!
//! Workload status writes carry the version token read with the workload;
//! a stale token yields [`StateError::Conflict`] and the caller re-reads.

pub mod api;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use api::{EntityStore, SecretStore};
pub use error::{SecretError, StateError, StateResult};
pub use store::StateStore;
pub use types::*;
