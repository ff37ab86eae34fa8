//! Drift correction between the store and the cloud's tagged inventory.

use std::collections::HashSet;

use spotgrid_core::Region;
use spotgrid_state::{ResourceStatus, User};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::provisioner::Provisioner;

impl Provisioner {
    /// Reconcile every user in every catalog region, then sweep resources
    /// their owners asked to tear down.
    pub async fn reconcile(&self) -> Vec<JoinHandle<()>> {
        let users = match self.store.list_users() {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "failed listing users for reconciliation");
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for user in users {
            for region in self.catalog.regions() {
                let this = self.clone();
                let user = user.clone();
                let region = region.clone();
                handles.push(tokio::spawn(async move {
                    this.reconcile_region(&user, &region).await
                }));
            }
        }

        match self.store.running_user_terminated_resources() {
            Ok(resources) => {
                for resource in resources {
                    debug!(resource_id = resource.id, "sweeping user-terminated resource");
                    self.queue.enqueue(resource.id, "Terminated by user").await;
                }
            }
            Err(e) => error!(error = %e, "failed listing user-terminated resources"),
        }
        handles
    }

    async fn reconcile_region(&self, user: &User, region: &Region) {
        let live = match self
            .cloud
            .active_tagged_instances(&user.account, region, &self.config.instance_tag)
            .await
        {
            Ok(live) => live,
            Err(e) => {
                warn!(user_id = user.id, %region, error = %e, "inventory lookup failed");
                return;
            }
        };
        let resources = match self.store.list_resources() {
            Ok(all) => all
                .into_iter()
                .filter(|r| r.owner_id == user.id && &r.region() == region)
                .collect::<Vec<_>>(),
            Err(e) => {
                error!(user_id = user.id, error = %e, "failed listing resources for reconciliation");
                return;
            }
        };

        let live_ids: HashSet<&str> = live.iter().map(|i| i.id.as_str()).collect();
        for resource in resources.iter().filter(|r| {
            matches!(
                r.status,
                ResourceStatus::Provisioned | ResourceStatus::Running
            )
        }) {
            if !live_ids.contains(resource.cloud_instance_id.as_str()) {
                info!(
                    resource_id = resource.id,
                    instance_id = %resource.cloud_instance_id,
                    "resource has no live instance"
                );
                self.queue
                    .enqueue(resource.id, "Instance missing from cloud inventory")
                    .await;
            }
        }

        // Any live resource, even one mid-provisioning, vouches for its
        // instance. A DEPROVISIONED one whose teardown failed does not.
        let known: HashSet<&str> = resources
            .iter()
            .filter(|r| r.status != ResourceStatus::Deprovisioned && !r.cloud_instance_id.is_empty())
            .map(|r| r.cloud_instance_id.as_str())
            .collect();
        let now = self.store.clock().now_millis();
        let grace = self.config.unknown_instance_grace.as_millis() as u64;
        for instance in live.iter().filter(|i| !known.contains(i.id.as_str())) {
            let age = now.saturating_sub(instance.launch_time);
            if age <= grace {
                debug!(instance_id = %instance.id, age_ms = age, "unknown instance inside grace window");
                continue;
            }
            warn!(user_id = user.id, instance_id = %instance.id, age_ms = age, "terminating unknown instance");
            if let Err(e) = self
                .cloud
                .terminate_instance(&user.account, region, &instance.id)
                .await
            {
                error!(instance_id = %instance.id, error = %e, "failed terminating unknown instance");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provisioner::tests::{fixture, join_all, provisioned};
    use spotgrid_cloud::{Instance, InstanceState};
    use spotgrid_core::{InstanceType, Zone};

    fn stray(id: &str, launch_time: u64) -> Instance {
        Instance {
            id: id.into(),
            zone: Zone::from("us-west-2b"),
            instance_type: InstanceType::from("c4.large"),
            state: InstanceState::Running,
            public_ip: Some("10.9.9.9".into()),
            launch_time,
            tags: vec!["spotgrid".into()],
        }
    }

    #[tokio::test]
    async fn consistent_inventory_is_untouched() {
        let f = fixture();
        provisioned(&f).await;

        join_all(f.provisioner.reconcile().await).await;
        assert!(f.provisioner.drain_deprovision_queue().await.is_empty());
        assert!(f.cloud.terminate_calls().await.is_empty());
    }

    #[tokio::test]
    async fn resource_without_live_instance_is_deprovisioned() {
        let f = fixture();
        let resource = provisioned(&f).await;
        f.cloud
            .set_instance_state(&resource.cloud_instance_id, InstanceState::Terminated)
            .await;

        join_all(f.provisioner.reconcile().await).await;
        join_all(f.provisioner.drain_deprovision_queue().await).await;
        assert_eq!(
            f.store.require_resource(resource.id).unwrap().status,
            ResourceStatus::Deprovisioned
        );
    }

    #[tokio::test]
    async fn unknown_instances_respect_grace_window() {
        let f = fixture();
        f.clock.advance(Duration::from_secs(3600));
        let now = f.store.clock().now_millis();
        f.cloud.insert_instance(stray("i-old", now - 11 * 60 * 1000)).await;
        f.cloud.insert_instance(stray("i-young", now - 60 * 1000)).await;

        join_all(f.provisioner.reconcile().await).await;
        assert_eq!(f.cloud.terminate_calls().await, vec!["i-old".to_string()]);
    }

    #[tokio::test]
    async fn instance_leaked_by_failed_teardown_is_collected() {
        let f = fixture();
        let resource = provisioned(&f).await;
        for status in [ResourceStatus::Deprovisioning, ResourceStatus::Deprovisioned] {
            f.store
                .set_resource_status(resource.id, status, "teardown lost")
                .unwrap();
        }
        f.clock.advance(Duration::from_secs(3600));

        join_all(f.provisioner.reconcile().await).await;
        assert_eq!(
            f.cloud.terminate_calls().await,
            vec![resource.cloud_instance_id.clone()]
        );
    }

    #[tokio::test]
    async fn user_terminated_running_resource_is_swept() {
        let f = fixture();
        let resource = provisioned(&f).await;
        f.store.mark_resource_user_terminated(resource.id).unwrap();

        join_all(f.provisioner.reconcile().await).await;
        let teardowns = f.provisioner.drain_deprovision_queue().await;
        assert_eq!(teardowns.len(), 1);
        join_all(teardowns).await;
        let events = f.store.resource_events(resource.id).unwrap();
        assert_eq!(events[events.len() - 2].message, "Terminated by user");
    }
}
