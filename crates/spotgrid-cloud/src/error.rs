//! Cloud provider error types.

use std::time::Duration;

use thiserror::Error;

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud api error: {0}")]
    Api(String),

    /// The provider throttled the call. Callers treat this as "unknown".
    #[error("request limit exceeded: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("spot request {request_id} failed with {code}: {message}")]
    SpotRequestFailed {
        request_id: String,
        code: String,
        message: String,
    },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// The instance could not be reached yet (agent bootstrap).
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("account not configured: {0}")]
    Account(String),
}

impl CloudError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CloudError::RateLimited(_))
    }
}
