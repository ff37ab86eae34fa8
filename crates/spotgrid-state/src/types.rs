//! Domain types persisted in the spotgrid state store.
//!
//! All types derive `Serialize` + `Deserialize` for JSON storage in redb.

use std::fmt;

use serde::{Deserialize, Serialize};
pub use spotgrid_core::CloudAccount;
use spotgrid_core::{InstanceType, Region, Zone};

pub type JobId = u64;
pub type ResourceId = u64;
pub type UserId = u64;

/// Maximum length of a resource event message.
pub const MAX_EVENT_MESSAGE_LEN: usize = 1024;

// ── Jobs ───────────────────────────────────────────────────────

/// Job lifecycle status. Names match the cluster manager's task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Staging,
    Launched,
    Starting,
    Running,
    Finished,
    Error,
    Lost,
    Killed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Staging,
        JobStatus::Launched,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Error,
        JobStatus::Lost,
        JobStatus::Killed,
        JobStatus::Failed,
    ];

    /// FINISHED, FAILED, or KILLED. A terminal job never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Killed)
    }

    /// LAUNCHED, STARTING, or RUNNING.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Launched | JobStatus::Starting | JobStatus::Running
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Staging => "STAGING",
            JobStatus::Launched => "LAUNCHED",
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
            JobStatus::Lost => "LOST",
            JobStatus::Killed => "KILLED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested (or provided) compute shape.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceShape {
    pub cpu: f64,
    pub memory_mb: u64,
    pub gpu: u32,
    pub disk_gb: f64,
}

/// A unit of work submitted by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: UserId,
    pub name: String,
    pub command: String,
    pub image: String,
    pub shape: ResourceShape,
    pub status: JobStatus,
    /// Bound resource, 0 when unbound.
    pub resource_id: ResourceId,
    pub retry_count: u32,
    pub user_terminated: bool,
    /// Handle the execution agent reported when the task started.
    pub agent_handle: String,
    pub start_time: u64,
    pub end_time: u64,
    pub total_cost: f64,
    pub created_at: u64,
}

impl Job {
    pub fn is_bound(&self) -> bool {
        self.resource_id != 0
    }
}

/// Submission payload for [`crate::StateStore::create_job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub owner_id: UserId,
    pub name: String,
    pub command: String,
    pub image: String,
    pub shape: ResourceShape,
}

/// Immutable audit record appended on every job transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub time: u64,
    pub resource_id: ResourceId,
    pub status: JobStatus,
    pub attempt: u32,
    pub message: String,
}

// ── Resources ──────────────────────────────────────────────────

/// Resource lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    New,
    Provisioning,
    SpotBidding,
    SpotBidAccepted,
    Provisioned,
    Running,
    Deprovisioning,
    Deprovisioned,
}

impl ResourceStatus {
    pub const ALL: [ResourceStatus; 8] = [
        ResourceStatus::New,
        ResourceStatus::Provisioning,
        ResourceStatus::SpotBidding,
        ResourceStatus::SpotBidAccepted,
        ResourceStatus::Provisioned,
        ResourceStatus::Running,
        ResourceStatus::Deprovisioning,
        ResourceStatus::Deprovisioned,
    ];

    /// DEPROVISIONING or DEPROVISIONED.
    pub fn is_winding_down(self) -> bool {
        matches!(
            self,
            ResourceStatus::Deprovisioning | ResourceStatus::Deprovisioned
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::New => "new",
            ResourceStatus::Provisioning => "provisioning",
            ResourceStatus::SpotBidding => "spot-bidding",
            ResourceStatus::SpotBidAccepted => "spot-bid-accepted",
            ResourceStatus::Provisioned => "provisioned",
            ResourceStatus::Running => "running",
            ResourceStatus::Deprovisioning => "deprovisioning",
            ResourceStatus::Deprovisioned => "deprovisioned",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cloud instance bought on the spot market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub owner_id: UserId,
    pub cpu_total: f64,
    pub cpu_used: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub gpu_total: u32,
    pub gpu_used: u32,
    pub status: ResourceStatus,
    pub zone: Zone,
    pub instance_type: InstanceType,
    pub bid_price: f64,
    pub spot_request_id: String,
    pub cloud_instance_id: String,
    pub address: String,
    pub agent_id: String,
    pub launch_time: u64,
    pub user_terminated: bool,
    pub created_at: u64,
}

impl Resource {
    /// A fresh, unsaved resource in NEW with nothing used.
    pub fn planned(
        owner_id: UserId,
        zone: Zone,
        instance_type: InstanceType,
        bid_price: f64,
        capacity: ResourceShape,
    ) -> Self {
        Self {
            id: 0,
            owner_id,
            cpu_total: capacity.cpu,
            cpu_used: 0.0,
            memory_total_mb: capacity.memory_mb,
            memory_used_mb: 0,
            gpu_total: capacity.gpu,
            gpu_used: 0,
            status: ResourceStatus::New,
            zone,
            instance_type,
            bid_price,
            spot_request_id: String::new(),
            cloud_instance_id: String::new(),
            address: String::new(),
            agent_id: String::new(),
            launch_time: 0,
            user_terminated: false,
            created_at: 0,
        }
    }

    pub fn region(&self) -> Region {
        self.zone.region()
    }

    /// Capacity not yet claimed by bound jobs.
    pub fn free(&self) -> ResourceShape {
        ResourceShape {
            cpu: (self.cpu_total - self.cpu_used).max(0.0),
            memory_mb: self.memory_total_mb.saturating_sub(self.memory_used_mb),
            gpu: self.gpu_total.saturating_sub(self.gpu_used),
            disk_gb: 0.0,
        }
    }
}

/// Immutable audit record appended on every resource transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub resource_id: ResourceId,
    pub time: u64,
    pub status: ResourceStatus,
    pub message: String,
}

// ── Users ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub account: CloudAccount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Staging).unwrap(),
            "\"STAGING\""
        );
        assert_eq!(
            serde_json::to_string(&ResourceStatus::SpotBidAccepted).unwrap(),
            "\"spot-bid-accepted\""
        );
        for status in ResourceStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
        for status in JobStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn terminal_and_active_sets_are_disjoint() {
        for status in JobStatus::ALL {
            assert!(!(status.is_terminal() && status.is_active()), "{status}");
        }
    }

    #[test]
    fn free_capacity_saturates() {
        let mut r = Resource::planned(
            1,
            Zone::from("us-west-1a"),
            InstanceType::from("m4.large"),
            0.1,
            ResourceShape {
                cpu: 2.0,
                memory_mb: 8192,
                gpu: 0,
                disk_gb: 0.0,
            },
        );
        r.cpu_used = 1.5;
        r.memory_used_mb = 9000;
        let free = r.free();
        assert_eq!(free.cpu, 0.5);
        assert_eq!(free.memory_mb, 0);
        assert_eq!(free.gpu, 0);
    }
}
