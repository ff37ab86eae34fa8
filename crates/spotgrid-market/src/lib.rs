//! spotgrid-market: where capacity is bought and what it costs.
//!
//! # Architecture
//!
//! ```text
//! MarketCatalog (immutable, loaded once)
//!   ├── regions → zones
//!   ├── instance type → capacity
//!   └── region → spot-biddable instance types
//!
//! MarketCache      static unsupported set + TTL'd unavailable markets
//! MatchingEngine   cheapest legal market for a request, buffered bid
//!   └── cost       piecewise-constant price integration per resource
//! ```

pub mod availability;
pub mod catalog;
pub mod cost;
pub mod engine;
pub mod error;

pub use availability::{MarketCache, MarketSet};
pub use catalog::{InstanceSpec, MarketCatalog};
pub use cost::integrate_price_history;
pub use engine::{MarketMatch, MatchRequest, MatchingEngine};
pub use error::{MarketError, MarketResult};
