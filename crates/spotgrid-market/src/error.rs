//! Market error types.

use thiserror::Error;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    /// Nothing fits the request, every market is excluded, or no price came back.
    #[error("no candidate market: {0}")]
    NoCandidateMarket(String),

    #[error("cheapest bid {bid:.4} exceeds the {ceiling:.2}/hr ceiling")]
    PriceCeiling { bid: f64, ceiling: f64 },

    #[error("invalid market catalog: {0}")]
    Catalog(String),

    #[error("state store error: {0}")]
    State(#[from] spotgrid_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] spotgrid_cloud::CloudError),
}

impl MarketError {
    /// Scheduling failures leave the job STAGING for a later cycle.
    pub fn is_no_market(&self) -> bool {
        matches!(
            self,
            MarketError::NoCandidateMarket(_) | MarketError::PriceCeiling { .. }
        )
    }
}
