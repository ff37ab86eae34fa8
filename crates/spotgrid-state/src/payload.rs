//! Task payloads exchanged with the execution agent.
//!
//! A launched task carries the serialized [`Job`]; status updates coming
//! back carry a [`StatusMessage`]. Both are JSON so the job's identity,
//! binding, and retry count survive the round trip.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::types::Job;

/// Metadata the execution agent attaches to a status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub job: Job,
    #[serde(default)]
    pub message: String,
}

pub fn encode_job(job: &Job) -> StateResult<Vec<u8>> {
    serde_json::to_vec(job).map_err(map_err!(Serialize))
}

pub fn decode_job(data: &[u8]) -> StateResult<Job> {
    serde_json::from_slice(data).map_err(map_err!(Deserialize))
}

pub fn encode_status_message(message: &StatusMessage) -> StateResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(map_err!(Serialize))
}

pub fn decode_status_message(data: &[u8]) -> StateResult<StatusMessage> {
    if data.is_empty() {
        return Err(StateError::Deserialize("empty status payload".into()));
    }
    serde_json::from_slice(data).map_err(map_err!(Deserialize))
}
