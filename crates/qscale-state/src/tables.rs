//! redb table definitions for the qscale store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{namespace}/{name}` or `{namespace}/{workload}:{instance}`.

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Workloads (spec + status + version) keyed by `{namespace}/{name}`.
pub const WORKLOADS: JsonTable = TableDefinition::new("workloads");

/// Instances keyed by `{namespace}/{workload}:{instance}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Broker configs keyed by `{namespace}/{name}`.
pub const BROKER_CONFIGS: JsonTable = TableDefinition::new("broker_configs");

/// Secrets keyed by `{namespace}/{name}`.
pub const SECRETS: JsonTable = TableDefinition::new("secrets");
