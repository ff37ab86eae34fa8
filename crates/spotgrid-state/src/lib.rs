//! spotgrid-state: embedded state store for spotgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds jobs, resources, their
//! append-only status event logs, users with their cloud accounts, and the
//! cluster-manager framework identity.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Arc<redb::Database> + Clock)
//!   ├── jobs         set_job_status ── lifecycle::apply_job_transition
//!   ├── resources    set_resource_status ── lifecycle::apply_resource_transition
//!   ├── assignments  assign_job / unassign_job (bind + capacity in one txn)
//!   ├── users        cloud account wiring per region / zone
//!   └── settings     framework id
//! ```
//!
//! Every mutation runs in a single redb write transaction: the record
//! update and its event append commit together or not at all. All domain
//! types are JSON-serialized into `&[u8]` value columns.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod assignments;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod payload;
pub mod resources;
pub mod store;
pub mod tables;
pub mod types;

pub use assignments::AssignTarget;
pub use error::{StateError, StateResult};
pub use lifecycle::{MAX_RETRIES, TransitionError};
pub use payload::{StatusMessage, decode_job, decode_status_message, encode_job, encode_status_message};
pub use store::StateStore;
pub use types::*;
