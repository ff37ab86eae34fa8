//! spotgrid-provisioner: owns the resource lifecycle.
//!
//! Four loops share one shutdown signal and one deprovision queue:
//!
//! ```text
//! provision loop     NEW → PROVISIONING → … → RUNNING  (spawned per resource)
//! deprovision loop   single consumer of DeprovisionQueue; claims DEPROVISIONING,
//!                    spawns teardown, always finalizes DEPROVISIONED
//! health loop        PROVISIONED/RUNNING instance checks + idle reclamation
//! reconcile loop     store inventory vs tagged cloud instances, per user
//! ```
//!
//! Every failure is routed to the deprovision queue or logged; nothing
//! propagates out of a loop.

pub mod error;
pub mod health;
pub mod provisioner;
pub mod queue;
pub mod reconcile;

pub use error::{ProvisionError, ProvisionResult};
pub use health::Health;
pub use provisioner::Provisioner;
pub use queue::{DeprovisionQueue, DeprovisionRequest};
