//! Bounded poll-with-timeout waiters.
//!
//! Each waiter polls the provider at a fixed interval until the target
//! condition holds, a terminal failure is observed, or the deadline passes.
//! The deadline is fixed at call time and never extended.

use std::time::Duration;

use spotgrid_core::{CloudAccount, Region};
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, Instance, InstanceState, SpotRequest, SpotStatus};

/// Poll cadence and overall deadline for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Wait until a spot request is fulfilled.
///
/// Pending codes keep polling. Any other code fails immediately with
/// `SpotRequestFailed`.
pub async fn wait_for_spot_request(
    cloud: &dyn CloudProvider,
    account: &CloudAccount,
    region: &Region,
    request_id: &str,
    poll: PollConfig,
) -> CloudResult<SpotRequest> {
    let what = format!("spot request {request_id}");
    bounded(poll, what, async {
        loop {
            let request = cloud
                .describe_spot_request(account, region, request_id)
                .await?;
            match request.status() {
                SpotStatus::Fulfilled => return Ok(request),
                SpotStatus::Pending => {
                    debug!(request_id, code = %request.status_code, "spot request pending");
                }
                SpotStatus::Failed | SpotStatus::MarkedForTermination => {
                    return Err(CloudError::SpotRequestFailed {
                        request_id: request.id,
                        code: request.status_code,
                        message: request.status_message,
                    });
                }
            }
            tokio::time::sleep(poll.interval).await;
        }
    })
    .await
}

/// Wait until an instance reports `running`.
pub async fn wait_for_instance_running(
    cloud: &dyn CloudProvider,
    account: &CloudAccount,
    region: &Region,
    instance_id: &str,
    poll: PollConfig,
) -> CloudResult<Instance> {
    let what = format!("instance {instance_id} to run");
    bounded(poll, what, async {
        loop {
            let instance = cloud.get_instance(account, region, instance_id).await?;
            match instance.state {
                InstanceState::Running => return Ok(instance),
                InstanceState::Pending => {}
                other => {
                    return Err(CloudError::Api(format!(
                        "instance {instance_id} entered {other:?} while starting"
                    )));
                }
            }
            tokio::time::sleep(poll.interval).await;
        }
    })
    .await
}

/// Wait until an instance has a public address and return it.
pub async fn wait_for_address(
    cloud: &dyn CloudProvider,
    account: &CloudAccount,
    region: &Region,
    instance_id: &str,
    poll: PollConfig,
) -> CloudResult<String> {
    let what = format!("address of instance {instance_id}");
    bounded(poll, what, async {
        loop {
            let instance = cloud.get_instance(account, region, instance_id).await?;
            if let Some(ip) = instance.public_ip.filter(|ip| !ip.is_empty()) {
                return Ok(ip);
            }
            tokio::time::sleep(poll.interval).await;
        }
    })
    .await
}

async fn bounded<T>(
    poll: PollConfig,
    what: String,
    fut: impl std::future::Future<Output = CloudResult<T>>,
) -> CloudResult<T> {
    match tokio::time::timeout(poll.timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout {
            what,
            after: poll.timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SpotBid;
    use crate::simulated::SimulatedCloud;
    use spotgrid_core::{InstanceType, ManualClock, Zone};

    fn fast() -> PollConfig {
        PollConfig::new(Duration::from_millis(5), Duration::from_millis(200))
    }

    fn bid() -> SpotBid {
        SpotBid {
            resource_id: 1,
            zone: Zone::from("us-west-2a"),
            instance_type: InstanceType::from("m4.large"),
            price: 0.2,
            subnet_id: "subnet-1".into(),
            security_group_id: None,
            ssh_key: None,
        }
    }

    #[tokio::test]
    async fn fulfilled_request_resolves() {
        let cloud = SimulatedCloud::new(ManualClock::new(0));
        let account = CloudAccount::default();
        let request = cloud.create_spot_request(&account, &bid()).await.unwrap();
        let region = Region::from("us-west-2");

        let done = wait_for_spot_request(&cloud, &account, &region, &request.id, fast())
            .await
            .unwrap();
        assert!(done.instance_id.is_some());

        let id = done.instance_id.unwrap();
        let instance = wait_for_instance_running(&cloud, &account, &region, &id, fast())
            .await
            .unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        let ip = wait_for_address(&cloud, &account, &region, &id, fast())
            .await
            .unwrap();
        assert!(!ip.is_empty());
    }

    #[tokio::test]
    async fn failed_request_fails_fast() {
        let cloud = SimulatedCloud::new(ManualClock::new(0));
        cloud.fail_spot_requests("price-too-low").await;
        let account = CloudAccount::default();
        let request = cloud.create_spot_request(&account, &bid()).await.unwrap();

        let err = wait_for_spot_request(
            &cloud,
            &account,
            &Region::from("us-west-2"),
            &request.id,
            fast(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::SpotRequestFailed { ref code, .. } if code == "price-too-low"));
    }

    #[tokio::test]
    async fn held_request_times_out() {
        let cloud = SimulatedCloud::new(ManualClock::new(0));
        cloud.hold_spot_requests().await;
        let account = CloudAccount::default();
        let request = cloud.create_spot_request(&account, &bid()).await.unwrap();

        let err = wait_for_spot_request(
            &cloud,
            &account,
            &Region::from("us-west-2"),
            &request.id,
            PollConfig::new(Duration::from_millis(5), Duration::from_millis(30)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::Timeout { .. }));
    }
}
