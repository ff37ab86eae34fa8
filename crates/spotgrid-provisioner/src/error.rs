//! Provisioner error types.

use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("state store error: {0}")]
    State(#[from] spotgrid_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] spotgrid_cloud::CloudError),

    /// The owner's account is missing wiring the resource needs.
    #[error("account error: {0}")]
    Account(String),

    #[error("agent setup failed: {0}")]
    Agent(String),
}
