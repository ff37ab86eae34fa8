//! spotgrid-core: shared vocabulary for the spotgrid orchestrator.
//!
//! Market identifiers ([`Zone`], [`Region`], [`InstanceType`]), the
//! injectable [`Clock`] used wherever wall time matters, human duration
//! strings, per-user [`CloudAccount`] wiring, and the TOML daemon
//! configuration.

pub mod account;
pub mod clock;
pub mod config;
pub mod duration;
pub mod market;

pub use account::CloudAccount;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    ConfigError, MarketConfig, ProvisionerConfig, SchedulerConfig, SpotgridConfig, StoreConfig,
};
pub use duration::{format_duration, parse_duration};
pub use market::{InstanceType, Region, Zone};
