//! spotgrid-cloud: the cloud provider boundary.
//!
//! The orchestrator only ever talks to capacity through [`CloudProvider`]
//! (spot requests, instances, prices) and [`AgentInstaller`] (bootstrapping
//! the execution agent on a fresh instance). Real SDK bindings live outside
//! this workspace; [`SimulatedCloud`] backs standalone runs and tests.
//!
//! # Architecture
//!
//! ```text
//! provider   CloudProvider / AgentInstaller traits + wire types
//! wait       bounded poll-with-timeout helpers over a provider
//! simulated  in-memory provider with programmable markets
//! ```

pub mod error;
pub mod provider;
pub mod simulated;
pub mod wait;

pub use error::{CloudError, CloudResult};
pub use provider::{
    AgentInstaller, AgentTarget, CloudProvider, Instance, InstanceState, SpotBid, SpotPrice,
    SpotRequest, SpotStatus,
};
pub use simulated::SimulatedCloud;
pub use wait::PollConfig;
