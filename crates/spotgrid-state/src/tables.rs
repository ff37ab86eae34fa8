//! redb table definitions for the spotgrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Ids are rendered zero-padded to 20 digits so key order matches
//! numeric order; event keys are `{owner_id}:{sequence}` for prefix scans.

use redb::TableDefinition;

/// Shape shared by every JSON record table.
pub(crate) type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Jobs keyed by `{job_id}`.
pub const JOBS: RecordTable = TableDefinition::new("jobs");

/// Resources keyed by `{resource_id}`.
pub const RESOURCES: RecordTable = TableDefinition::new("resources");

/// Append-only job status events keyed by `{job_id}:{sequence}`.
pub const JOB_EVENTS: RecordTable = TableDefinition::new("job_events");

/// Append-only resource status events keyed by `{resource_id}:{sequence}`.
pub const RESOURCE_EVENTS: RecordTable = TableDefinition::new("resource_events");

/// Users and their cloud accounts keyed by `{user_id}`.
pub const USERS: RecordTable = TableDefinition::new("users");

/// Id and sequence counters keyed by counter name.
pub const COUNTERS: TableDefinition<'static, &'static str, u64> = TableDefinition::new("counters");

/// Free-form settings (framework identity) keyed by setting name.
pub const SETTINGS: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("settings");

pub(crate) fn id_key(id: u64) -> String {
    format!("{id:020}")
}

pub(crate) fn event_key(owner: u64, sequence: u64) -> String {
    format!("{owner:020}:{sequence:020}")
}

pub(crate) fn event_prefix(owner: u64) -> String {
    format!("{owner:020}:")
}
