//! Cloud provider contract and the values that cross it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spotgrid_core::{CloudAccount, InstanceType, Region, Zone};

use crate::error::CloudResult;

/// A bid for one spot instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotBid {
    pub resource_id: u64,
    pub zone: Zone,
    pub instance_type: InstanceType,
    /// Maximum $/hour.
    pub price: f64,
    pub subnet_id: String,
    pub security_group_id: Option<String>,
    pub ssh_key: Option<String>,
}

/// Where a spot request stands, derived from its provider status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotStatus {
    /// Still being evaluated or waiting for capacity.
    Pending,
    /// An instance was launched for the request.
    Fulfilled,
    /// Capacity is being reclaimed by the provider.
    MarkedForTermination,
    /// The request will never be fulfilled (price, capacity, constraints).
    Failed,
}

impl SpotStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "pending-evaluation" | "not-scheduled-yet" | "pending-fulfillment" => {
                SpotStatus::Pending
            }
            "fulfilled" | "request-canceled-and-instance-running" => SpotStatus::Fulfilled,
            "marked-for-termination" | "marked-for-stop" => SpotStatus::MarkedForTermination,
            _ => SpotStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: String,
    pub zone: Zone,
    pub instance_type: InstanceType,
    pub status_code: String,
    pub status_message: String,
    pub instance_id: Option<String>,
}

impl SpotRequest {
    pub fn status(&self) -> SpotStatus {
        SpotStatus::from_code(&self.status_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub zone: Zone,
    pub instance_type: InstanceType,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub launch_time: u64,
    pub tags: Vec<String>,
}

/// One price observation. The price stays a string as delivered by the
/// provider; consumers parse it and skip samples that do not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPrice {
    pub zone: Zone,
    pub instance_type: InstanceType,
    pub price: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Operations the orchestrator needs from a cloud provider.
///
/// Every call is scoped to one user's account. Implementations must be
/// safe to call concurrently.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_spot_request(
        &self,
        account: &CloudAccount,
        bid: &SpotBid,
    ) -> CloudResult<SpotRequest>;

    async fn describe_spot_request(
        &self,
        account: &CloudAccount,
        region: &Region,
        request_id: &str,
    ) -> CloudResult<SpotRequest>;

    async fn spot_request_for_instance(
        &self,
        account: &CloudAccount,
        region: &Region,
        instance_id: &str,
    ) -> CloudResult<SpotRequest>;

    async fn cancel_spot_request(
        &self,
        account: &CloudAccount,
        region: &Region,
        request_id: &str,
    ) -> CloudResult<()>;

    async fn get_instance(
        &self,
        account: &CloudAccount,
        region: &Region,
        instance_id: &str,
    ) -> CloudResult<Instance>;

    async fn terminate_instance(
        &self,
        account: &CloudAccount,
        region: &Region,
        instance_id: &str,
    ) -> CloudResult<()>;

    async fn tag_instance(
        &self,
        account: &CloudAccount,
        region: &Region,
        instance_id: &str,
        tag: &str,
    ) -> CloudResult<()>;

    /// Pending or running instances carrying `tag` in a region.
    async fn active_tagged_instances(
        &self,
        account: &CloudAccount,
        region: &Region,
        tag: &str,
    ) -> CloudResult<Vec<Instance>>;

    /// Latest price per instance type in a zone. Types without a market
    /// are simply absent.
    async fn current_spot_prices(
        &self,
        account: &CloudAccount,
        zone: &Zone,
        instance_types: &[InstanceType],
    ) -> CloudResult<Vec<SpotPrice>>;

    /// Price changes overlapping `[start, end]`, oldest first. The first
    /// sample may predate `start` (the price in effect at `start`).
    async fn spot_price_history(
        &self,
        account: &CloudAccount,
        zone: &Zone,
        instance_type: &InstanceType,
        start: u64,
        end: u64,
    ) -> CloudResult<Vec<SpotPrice>>;
}

/// Everything needed to bootstrap the execution agent on an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTarget {
    pub resource_id: u64,
    pub address: String,
    pub region: Region,
    pub ssh_key: Option<String>,
    pub master_address: String,
}

/// Installs and registers the execution agent on a provisioned instance.
#[async_trait]
pub trait AgentInstaller: Send + Sync {
    /// Returns the agent id the cluster manager will know the resource by.
    /// `CloudError::Unreachable` means "try again shortly".
    async fn install(&self, target: &AgentTarget) -> CloudResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_status_codes() {
        assert_eq!(SpotStatus::from_code("pending-evaluation"), SpotStatus::Pending);
        assert_eq!(SpotStatus::from_code("not-scheduled-yet"), SpotStatus::Pending);
        assert_eq!(SpotStatus::from_code("fulfilled"), SpotStatus::Fulfilled);
        assert_eq!(
            SpotStatus::from_code("marked-for-termination"),
            SpotStatus::MarkedForTermination
        );
        assert_eq!(SpotStatus::from_code("price-too-low"), SpotStatus::Failed);
        assert_eq!(SpotStatus::from_code("capacity-not-available"), SpotStatus::Failed);
        assert_eq!(SpotStatus::from_code("something-new"), SpotStatus::Failed);
    }
}
