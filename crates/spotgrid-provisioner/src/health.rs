//! Periodic resource health checks and idle reclamation.

use spotgrid_cloud::{CloudError, InstanceState, SpotStatus};
use spotgrid_state::{Resource, ResourceStatus};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::provisioner::Provisioner;

pub const IDLE_REASON: &str = "No jobs running on resource";

/// Outcome of checking one resource against the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Provisioner {
    /// Check every PROVISIONED or RUNNING resource, one task each.
    ///
    /// Unhealthy resources mark their market unavailable and are queued for
    /// deprovisioning. Healthy RUNNING resources with no active job are
    /// queued as idle.
    pub async fn check_health(&self) -> Vec<JoinHandle<()>> {
        let resources = match self
            .store
            .resources_with_status(&[ResourceStatus::Provisioned, ResourceStatus::Running])
        {
            Ok(resources) => resources,
            Err(e) => {
                error!(error = %e, "failed listing resources for health check");
                return Vec::new();
            }
        };

        resources
            .into_iter()
            .map(|resource| {
                let this = self.clone();
                tokio::spawn(async move { this.check_resource(resource).await })
            })
            .collect()
    }

    async fn check_resource(&self, resource: Resource) {
        let id = resource.id;
        if let Health::Unhealthy(reason) = self.resource_health(&resource).await {
            warn!(resource_id = id, %reason, "resource unhealthy");
            self.cache
                .mark_unavailable(&resource.zone, &resource.instance_type)
                .await;
            self.queue.enqueue(id, reason).await;
            return;
        }

        if resource.status != ResourceStatus::Running {
            return;
        }
        match self.store.active_jobs_on_resource(id) {
            Ok(jobs) if jobs.is_empty() => {
                debug!(resource_id = id, "resource idle");
                self.queue.enqueue(id, IDLE_REASON).await;
            }
            Ok(_) => {}
            Err(e) => error!(resource_id = id, error = %e, "failed listing jobs on resource"),
        }
    }

    /// Ask the cloud whether a resource's instance is still usable.
    ///
    /// Throttled or otherwise inconclusive calls count as healthy; only a
    /// definite answer takes a resource out of service.
    pub async fn resource_health(&self, resource: &Resource) -> Health {
        if resource.cloud_instance_id.is_empty() {
            return Health::Healthy;
        }
        let user = match self.store.require_user(resource.owner_id) {
            Ok(user) => user,
            Err(e) => {
                error!(resource_id = resource.id, error = %e, "failed loading resource owner");
                return Health::Healthy;
            }
        };
        let region = resource.region();
        let instance_id = &resource.cloud_instance_id;

        match self.cloud.get_instance(&user.account, &region, instance_id).await {
            Ok(instance) if instance.state == InstanceState::Running => {}
            Ok(instance) => {
                return Health::Unhealthy(format!(
                    "Instance {instance_id} is {:?}",
                    instance.state
                ));
            }
            Err(CloudError::NotFound(_)) => {
                return Health::Unhealthy(format!("Instance {instance_id} not found"));
            }
            Err(e) => {
                debug!(resource_id = resource.id, error = %e, "instance check inconclusive");
                return Health::Healthy;
            }
        }

        match self
            .cloud
            .spot_request_for_instance(&user.account, &region, instance_id)
            .await
        {
            Ok(request) if request.status() == SpotStatus::MarkedForTermination => {
                Health::Unhealthy(format!(
                    "Spot instance {instance_id} marked for termination: {}",
                    request.status_code
                ))
            }
            Ok(_) => Health::Healthy,
            Err(e) => {
                debug!(resource_id = resource.id, error = %e, "spot request check inconclusive");
                Health::Healthy
            }
        }
    }
}
