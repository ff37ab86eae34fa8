//! The cluster manager boundary.
//!
//! Tasks are named after the job they run: the task id is the job id in
//! decimal. The driver is the outbound half; inbound callbacks arrive as
//! [`SchedulerEvent`](crate::SchedulerEvent)s.

use std::time::Duration;

use async_trait::async_trait;
use spotgrid_state::{JobId, JobStatus};

use crate::error::ClusterResult;

/// Task states as reported by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// The job status this report moves a job to.
    ///
    /// `Staging` is the manager acknowledging a launch the job already
    /// recorded, so it maps to nothing.
    pub fn job_status(self) -> Option<JobStatus> {
        match self {
            TaskState::Staging => None,
            TaskState::Starting => Some(JobStatus::Starting),
            TaskState::Running => Some(JobStatus::Running),
            TaskState::Finished => Some(JobStatus::Finished),
            TaskState::Failed => Some(JobStatus::Failed),
            TaskState::Killed => Some(JobStatus::Killed),
            TaskState::Lost => Some(JobStatus::Lost),
            TaskState::Error => Some(JobStatus::Error),
        }
    }

    /// The state to replay for a job during task reconciliation.
    pub fn from_job_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Staging | JobStatus::Launched => TaskState::Staging,
            JobStatus::Starting => TaskState::Starting,
            JobStatus::Running => TaskState::Running,
            JobStatus::Finished => TaskState::Finished,
            JobStatus::Failed => TaskState::Failed,
            JobStatus::Killed => TaskState::Killed,
            JobStatus::Lost => TaskState::Lost,
            JobStatus::Error => TaskState::Error,
        }
    }
}

/// A task to run on an accepted offer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub name: String,
    pub agent_id: String,
    pub cpus: f64,
    pub mem: f64,
    pub gpus: f64,
    pub command: String,
    pub image: String,
    /// Serialized job handed to the execution agent.
    pub data: Vec<u8>,
}

/// A task status update, inbound or replayed for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub agent_id: String,
    pub message: String,
    /// Opaque executor payload, normally an encoded `StatusMessage`.
    pub data: Vec<u8>,
}

pub fn task_id(job_id: JobId) -> String {
    job_id.to_string()
}

pub fn job_id_from_task(task_id: &str) -> Option<JobId> {
    task_id.parse().ok()
}

/// Calls the scheduler makes into the cluster manager.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn launch_tasks(&self, offer_ids: &[String], tasks: Vec<TaskInfo>) -> ClusterResult<()>;

    async fn kill_task(&self, task_id: &str) -> ClusterResult<()>;

    async fn decline_offer(&self, offer_id: &str, refuse_for: Duration) -> ClusterResult<()>;

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> ClusterResult<()>;
}
