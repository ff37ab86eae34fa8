//! In-process cloud provider with programmable markets.
//!
//! Spot requests resolve instantly according to the configured outcome,
//! instances come up running with an address, and every teardown call is
//! recorded so callers can assert on it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use spotgrid_core::{CloudAccount, InstanceType, Region, SharedClock, Zone};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::*;

/// How newly created spot requests resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpotOutcome {
    Fulfill,
    Fail(String),
    Hold,
}

#[derive(Debug)]
struct SimState {
    next_id: u64,
    outcome: SpotOutcome,
    requests: HashMap<String, SpotRequest>,
    instances: HashMap<String, Instance>,
    prices: HashMap<(Zone, InstanceType), String>,
    history: HashMap<(Zone, InstanceType), Vec<(u64, String)>>,
    failing_price_zones: HashSet<Zone>,
    rate_limited: bool,
    unreachable_installs: u32,
    terminate_calls: Vec<String>,
    cancel_calls: Vec<String>,
    installs: Vec<u64>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            next_id: 1,
            outcome: SpotOutcome::Fulfill,
            requests: HashMap::new(),
            instances: HashMap::new(),
            prices: HashMap::new(),
            history: HashMap::new(),
            failing_price_zones: HashSet::new(),
            rate_limited: false,
            unreachable_installs: 0,
            terminate_calls: Vec::new(),
            cancel_calls: Vec::new(),
            installs: Vec::new(),
        }
    }
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// A cloud that lives in memory. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedCloud {
    state: Arc<Mutex<SimState>>,
    clock: SharedClock,
}

impl SimulatedCloud {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            clock,
        }
    }

    // ── Markets ────────────────────────────────────────────────────

    pub async fn set_price(&self, zone: &Zone, instance_type: &InstanceType, price: &str) {
        self.state
            .lock()
            .await
            .prices
            .insert((zone.clone(), instance_type.clone()), price.to_string());
    }

    /// Replace the price history of one market. Samples are `(ms, price)`.
    pub async fn set_price_history(
        &self,
        zone: &Zone,
        instance_type: &InstanceType,
        samples: Vec<(u64, &str)>,
    ) {
        let mut samples: Vec<(u64, String)> = samples
            .into_iter()
            .map(|(ts, p)| (ts, p.to_string()))
            .collect();
        samples.sort_by_key(|(ts, _)| *ts);
        self.state
            .lock()
            .await
            .history
            .insert((zone.clone(), instance_type.clone()), samples);
    }

    /// Make every price lookup in `zone` fail.
    pub async fn fail_prices_in(&self, zone: &Zone) {
        self.state
            .lock()
            .await
            .failing_price_zones
            .insert(zone.clone());
    }

    // ── Spot outcomes ──────────────────────────────────────────────

    pub async fn fulfill_spot_requests(&self) {
        self.state.lock().await.outcome = SpotOutcome::Fulfill;
    }

    /// New requests fail with the given status code.
    pub async fn fail_spot_requests(&self, code: &str) {
        self.state.lock().await.outcome = SpotOutcome::Fail(code.to_string());
    }

    /// New requests stay pending forever.
    pub async fn hold_spot_requests(&self) {
        self.state.lock().await.outcome = SpotOutcome::Hold;
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Add an instance the orchestrator did not create.
    pub async fn insert_instance(&self, instance: Instance) {
        self.state
            .lock()
            .await
            .instances
            .insert(instance.id.clone(), instance);
    }

    pub async fn set_instance_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Flag the spot request behind an instance as being reclaimed.
    pub async fn mark_for_termination(&self, instance_id: &str) {
        let mut state = self.state.lock().await;
        for request in state.requests.values_mut() {
            if request.instance_id.as_deref() == Some(instance_id) {
                request.status_code = "marked-for-termination".into();
                request.status_message = "capacity reclaimed".into();
            }
        }
    }

    /// Throttle instance and spot request lookups.
    pub async fn set_rate_limited(&self, limited: bool) {
        self.state.lock().await.rate_limited = limited;
    }

    pub async fn instances(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.state.lock().await.instances.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn spot_request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    pub async fn terminate_calls(&self) -> Vec<String> {
        self.state.lock().await.terminate_calls.clone()
    }

    pub async fn cancel_calls(&self) -> Vec<String> {
        self.state.lock().await.cancel_calls.clone()
    }

    // ── Agent ──────────────────────────────────────────────────────

    /// The next `attempts` agent installs fail with `Unreachable`.
    pub async fn fail_agent_installs(&self, attempts: u32) {
        self.state.lock().await.unreachable_installs = attempts;
    }

    /// Resource ids that got an agent installed, in order.
    pub async fn installs(&self) -> Vec<u64> {
        self.state.lock().await.installs.clone()
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn create_spot_request(
        &self,
        _account: &CloudAccount,
        bid: &SpotBid,
    ) -> CloudResult<SpotRequest> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let n = state.next_id();
        let mut request = SpotRequest {
            id: format!("sir-{n:08x}"),
            zone: bid.zone.clone(),
            instance_type: bid.instance_type.clone(),
            status_code: "pending-evaluation".into(),
            status_message: "Your Spot request has been submitted for review".into(),
            instance_id: None,
        };
        match state.outcome.clone() {
            SpotOutcome::Fulfill => {
                let instance = Instance {
                    id: format!("i-{n:08x}"),
                    zone: bid.zone.clone(),
                    instance_type: bid.instance_type.clone(),
                    state: InstanceState::Running,
                    public_ip: Some(format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff)),
                    launch_time: now,
                    tags: Vec::new(),
                };
                request.status_code = "fulfilled".into();
                request.status_message = "Your Spot request is fulfilled".into();
                request.instance_id = Some(instance.id.clone());
                state.instances.insert(instance.id.clone(), instance);
            }
            SpotOutcome::Fail(code) => {
                request.status_message = format!("simulated {code}");
                request.status_code = code;
            }
            SpotOutcome::Hold => {}
        }
        debug!(request_id = %request.id, resource_id = bid.resource_id, code = %request.status_code, "simulated spot request");
        state.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn describe_spot_request(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        request_id: &str,
    ) -> CloudResult<SpotRequest> {
        self.state
            .lock()
            .await
            .requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("spot request {request_id}")))
    }

    async fn spot_request_for_instance(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        instance_id: &str,
    ) -> CloudResult<SpotRequest> {
        let state = self.state.lock().await;
        if state.rate_limited {
            return Err(CloudError::RateLimited("DescribeSpotInstanceRequests".into()));
        }
        state
            .requests
            .values()
            .find(|r| r.instance_id.as_deref() == Some(instance_id))
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("spot request for {instance_id}")))
    }

    async fn cancel_spot_request(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        request_id: &str,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.cancel_calls.push(request_id.to_string());
        let request = state
            .requests
            .get_mut(request_id)
            .ok_or_else(|| CloudError::NotFound(format!("spot request {request_id}")))?;
        if request.instance_id.is_some() {
            request.status_code = "request-canceled-and-instance-running".into();
        } else {
            request.status_code = "canceled-before-fulfillment".into();
        }
        Ok(())
    }

    async fn get_instance(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        instance_id: &str,
    ) -> CloudResult<Instance> {
        let state = self.state.lock().await;
        if state.rate_limited {
            return Err(CloudError::RateLimited("DescribeInstances".into()));
        }
        state
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))
    }

    async fn terminate_instance(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        instance_id: &str,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.terminate_calls.push(instance_id.to_string());
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))?;
        instance.state = InstanceState::Terminated;
        Ok(())
    }

    async fn tag_instance(
        &self,
        _account: &CloudAccount,
        _region: &Region,
        instance_id: &str,
        tag: &str,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))?;
        if !instance.tags.iter().any(|t| t == tag) {
            instance.tags.push(tag.to_string());
        }
        Ok(())
    }

    async fn active_tagged_instances(
        &self,
        _account: &CloudAccount,
        region: &Region,
        tag: &str,
    ) -> CloudResult<Vec<Instance>> {
        let state = self.state.lock().await;
        let mut found: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| &i.zone.region() == region)
            .filter(|i| matches!(i.state, InstanceState::Pending | InstanceState::Running))
            .filter(|i| i.tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn current_spot_prices(
        &self,
        _account: &CloudAccount,
        zone: &Zone,
        instance_types: &[InstanceType],
    ) -> CloudResult<Vec<SpotPrice>> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        if state.failing_price_zones.contains(zone) {
            return Err(CloudError::Api(format!("price lookup failed in {zone}")));
        }
        Ok(instance_types
            .iter()
            .filter_map(|t| {
                state
                    .prices
                    .get(&(zone.clone(), t.clone()))
                    .map(|price| SpotPrice {
                        zone: zone.clone(),
                        instance_type: t.clone(),
                        price: price.clone(),
                        timestamp: now,
                    })
            })
            .collect())
    }

    async fn spot_price_history(
        &self,
        _account: &CloudAccount,
        zone: &Zone,
        instance_type: &InstanceType,
        start: u64,
        end: u64,
    ) -> CloudResult<Vec<SpotPrice>> {
        let state = self.state.lock().await;
        if state.failing_price_zones.contains(zone) {
            return Err(CloudError::Api(format!("price history failed in {zone}")));
        }
        let key = (zone.clone(), instance_type.clone());
        let samples: Vec<(u64, String)> = match state.history.get(&key) {
            Some(samples) => {
                // The sample in effect at `start` plus every later change up to `end`.
                let first = samples.iter().rposition(|(ts, _)| *ts <= start).unwrap_or(0);
                samples[first..]
                    .iter()
                    .filter(|(ts, _)| *ts <= end)
                    .cloned()
                    .collect()
            }
            None => state
                .prices
                .get(&key)
                .map(|p| vec![(0, p.clone())])
                .unwrap_or_default(),
        };
        Ok(samples
            .into_iter()
            .map(|(timestamp, price)| SpotPrice {
                zone: zone.clone(),
                instance_type: instance_type.clone(),
                price,
                timestamp,
            })
            .collect())
    }
}

#[async_trait]
impl AgentInstaller for SimulatedCloud {
    async fn install(&self, target: &AgentTarget) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        if state.unreachable_installs > 0 {
            state.unreachable_installs -= 1;
            return Err(CloudError::Unreachable(format!(
                "ssh {}: connection refused",
                target.address
            )));
        }
        state.installs.push(target.resource_id);
        Ok(format!("agent-{}", target.resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotgrid_core::ManualClock;

    fn cloud() -> SimulatedCloud {
        SimulatedCloud::new(ManualClock::new(5_000))
    }

    fn bid(zone: &str) -> SpotBid {
        SpotBid {
            resource_id: 7,
            zone: Zone::from(zone),
            instance_type: InstanceType::from("c4.large"),
            price: 0.1,
            subnet_id: "subnet".into(),
            security_group_id: None,
            ssh_key: None,
        }
    }

    #[tokio::test]
    async fn tagged_instances_are_scoped_by_region_and_state() {
        let cloud = cloud();
        let account = CloudAccount::default();
        let a = cloud.create_spot_request(&account, &bid("us-west-2a")).await.unwrap();
        let b = cloud.create_spot_request(&account, &bid("us-east-1a")).await.unwrap();
        let west = Region::from("us-west-2");
        let east = Region::from("us-east-1");
        let ia = a.instance_id.unwrap();
        let ib = b.instance_id.unwrap();
        cloud.tag_instance(&account, &west, &ia, "spotgrid").await.unwrap();
        cloud.tag_instance(&account, &east, &ib, "spotgrid").await.unwrap();

        let found = cloud.active_tagged_instances(&account, &west, "spotgrid").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ia);
        assert_eq!(found[0].launch_time, 5_000);

        cloud.terminate_instance(&account, &west, &ia).await.unwrap();
        assert!(cloud.active_tagged_instances(&account, &west, "spotgrid").await.unwrap().is_empty());
        assert_eq!(cloud.terminate_calls().await, vec![ia]);
    }

    #[tokio::test]
    async fn price_history_starts_at_sample_in_effect() {
        let cloud = cloud();
        let account = CloudAccount::default();
        let zone = Zone::from("us-west-2a");
        let ty = InstanceType::from("m4.large");
        cloud
            .set_price_history(&zone, &ty, vec![(0, "0.10"), (1_000, "0.20"), (5_000, "0.30")])
            .await;

        let samples = cloud.spot_price_history(&account, &zone, &ty, 1_500, 4_000).await.unwrap();
        let prices: Vec<&str> = samples.iter().map(|s| s.price.as_str()).collect();
        assert_eq!(prices, vec!["0.20"]);

        let other = InstanceType::from("c4.large");
        cloud.set_price(&zone, &other, "0.05").await;
        let flat = cloud.spot_price_history(&account, &zone, &other, 10, 20).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].timestamp, 0);
    }

    #[tokio::test]
    async fn agent_install_recovers_after_unreachable_attempts() {
        let cloud = cloud();
        cloud.fail_agent_installs(2).await;
        let target = AgentTarget {
            resource_id: 3,
            address: "10.0.0.3".into(),
            region: Region::from("us-west-2"),
            ssh_key: None,
            master_address: "127.0.0.1:5050".into(),
        };
        assert!(matches!(cloud.install(&target).await, Err(CloudError::Unreachable(_))));
        assert!(matches!(cloud.install(&target).await, Err(CloudError::Unreachable(_))));
        assert_eq!(cloud.install(&target).await.unwrap(), "agent-3");
        assert_eq!(cloud.installs().await, vec![3]);
    }

    #[tokio::test]
    async fn rate_limited_lookups() {
        let cloud = cloud();
        cloud.set_rate_limited(true).await;
        let err = cloud
            .get_instance(&CloudAccount::default(), &Region::from("us-west-2"), "i-1")
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }
}
