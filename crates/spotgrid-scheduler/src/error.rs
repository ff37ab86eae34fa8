//! Scheduler error types.

use thiserror::Error;

/// Failures reported by the cluster manager boundary.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not connected to the cluster manager")]
    Disconnected,

    #[error("cluster manager rejected the call: {0}")]
    Rejected(String),

    #[error("unknown offer: {0}")]
    UnknownOffer(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised while handling a scheduler event.
///
/// None of these escape the event loop; they are logged and the event is
/// dropped.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] spotgrid_state::StateError),

    #[error("market error: {0}")]
    Market(#[from] spotgrid_market::MarketError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("event queue closed")]
    QueueClosed,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
