//! Provisioner: drives resources from NEW to RUNNING and back down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use spotgrid_cloud::wait::{wait_for_address, wait_for_instance_running, wait_for_spot_request};
use spotgrid_cloud::{AgentInstaller, AgentTarget, CloudError, CloudProvider, PollConfig, SpotBid};
use spotgrid_core::ProvisionerConfig;
use spotgrid_market::{MarketCache, MarketCatalog};
use spotgrid_state::{Resource, ResourceStatus, StateStore};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::queue::{DeprovisionQueue, DeprovisionRequest};

/// Owns every resource status change after creation. Cheap to clone.
#[derive(Clone)]
pub struct Provisioner {
    pub(crate) store: StateStore,
    pub(crate) cloud: Arc<dyn CloudProvider>,
    installer: Arc<dyn AgentInstaller>,
    pub(crate) cache: MarketCache,
    pub(crate) catalog: Arc<MarketCatalog>,
    pub(crate) config: Arc<ProvisionerConfig>,
    pub(crate) queue: DeprovisionQueue,
    /// Taken by whichever consumer drains the queue first.
    receiver: Arc<Mutex<Option<mpsc::Receiver<DeprovisionRequest>>>>,
}

impl Provisioner {
    pub fn new(
        store: StateStore,
        cloud: Arc<dyn CloudProvider>,
        installer: Arc<dyn AgentInstaller>,
        cache: MarketCache,
        catalog: Arc<MarketCatalog>,
        config: ProvisionerConfig,
    ) -> Self {
        let (queue, receiver) = DeprovisionQueue::new(config.queue_capacity);
        Self {
            store,
            cloud,
            installer,
            cache,
            catalog,
            config: Arc::new(config),
            queue,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Producer handle for the deprovision queue.
    pub fn queue(&self) -> DeprovisionQueue {
        self.queue.clone()
    }

    /// Spawn the provision, deprovision, health, and reconcile loops.
    pub fn run(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let provision = self.clone();
        let health = self.clone();
        let reconcile = self.clone();
        let deprovision = self.clone();
        let config = &self.config;
        vec![
            tokio::spawn(every(
                "provision",
                config.provision_interval,
                shutdown.clone(),
                move || {
                    let p = provision.clone();
                    async move {
                        p.provision_new_resources().await;
                    }
                },
            )),
            tokio::spawn(every(
                "health",
                config.health_interval,
                shutdown.clone(),
                move || {
                    let p = health.clone();
                    async move {
                        p.check_health().await;
                    }
                },
            )),
            tokio::spawn(every(
                "reconcile",
                config.reconcile_interval,
                shutdown.clone(),
                move || {
                    let p = reconcile.clone();
                    async move {
                        p.reconcile().await;
                    }
                },
            )),
            tokio::spawn(async move { deprovision.run_deprovisioner(shutdown).await }),
        ]
    }

    // ── Provisioning ───────────────────────────────────────────────

    /// Claim every NEW resource and start provisioning it.
    ///
    /// Returns the spawned per-resource tasks.
    pub async fn provision_new_resources(&self) -> Vec<JoinHandle<()>> {
        let fresh = match self.store.resources_with_status(&[ResourceStatus::New]) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(error = %e, "failed listing new resources");
                return Vec::new();
            }
        };

        let mut handles = Vec::with_capacity(fresh.len());
        for resource in fresh {
            let claimed = match self.store.set_resource_status(
                resource.id,
                ResourceStatus::Provisioning,
                "Provisioning started",
            ) {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(resource_id = resource.id, error = %e, "failed claiming new resource");
                    continue;
                }
            };
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let resource_id = claimed.id;
                match this.provision(claimed).await {
                    Ok(()) => info!(resource_id, "resource provisioned"),
                    Err(e) => {
                        error!(resource_id, error = %e, "provisioning failed");
                        this.queue.enqueue(resource_id, e.to_string()).await;
                    }
                }
            }));
        }
        handles
    }

    async fn provision(&self, resource: Resource) -> ProvisionResult<()> {
        let id = resource.id;
        let user = self.store.require_user(resource.owner_id)?;
        let account = &user.account;
        let region = resource.region();

        self.store
            .set_resource_status(id, ResourceStatus::SpotBidding, "Bidding on spot market")?;

        let subnet_id = account
            .subnet(&resource.zone)
            .ok_or_else(|| ProvisionError::Account(format!("no subnet for {}", resource.zone)))?;
        let bid = SpotBid {
            resource_id: id,
            zone: resource.zone.clone(),
            instance_type: resource.instance_type.clone(),
            price: resource.bid_price,
            subnet_id: subnet_id.to_string(),
            security_group_id: account.security_group(&region).map(str::to_string),
            ssh_key: account.ssh_key(&region).map(str::to_string),
        };
        let request = self.cloud.create_spot_request(account, &bid).await?;
        self.store.record_spot_request(id, &request.id)?;
        debug!(resource_id = id, request_id = %request.id, price = bid.price, "spot request placed");

        let spot_poll = PollConfig::new(self.config.spot_poll, self.config.spot_timeout);
        let fulfilled = match wait_for_spot_request(
            self.cloud.as_ref(),
            account,
            &region,
            &request.id,
            spot_poll,
        )
        .await
        {
            Ok(fulfilled) => fulfilled,
            Err(e) => {
                self.cache
                    .mark_unavailable(&resource.zone, &resource.instance_type)
                    .await;
                if let Err(cancel) = self
                    .cloud
                    .cancel_spot_request(account, &region, &request.id)
                    .await
                {
                    warn!(resource_id = id, request_id = %request.id, error = %cancel, "failed cancelling spot request");
                }
                return Err(e.into());
            }
        };

        let instance_id = fulfilled.instance_id.ok_or_else(|| {
            CloudError::Api(format!("spot request {} fulfilled without an instance", request.id))
        })?;
        let instance = self.cloud.get_instance(account, &region, &instance_id).await?;
        self.store
            .record_instance(id, &instance_id, instance.launch_time)?;
        self.cloud
            .tag_instance(account, &region, &instance_id, &self.config.instance_tag)
            .await?;
        self.store.set_resource_status(
            id,
            ResourceStatus::SpotBidAccepted,
            &format!("Spot request {} fulfilled by {instance_id}", request.id),
        )?;

        let instance_poll = PollConfig::new(self.config.instance_poll, self.config.instance_timeout);
        wait_for_instance_running(self.cloud.as_ref(), account, &region, &instance_id, instance_poll)
            .await?;
        let address =
            wait_for_address(self.cloud.as_ref(), account, &region, &instance_id, instance_poll)
                .await?;
        self.store.record_address(id, &address)?;
        self.store.set_resource_status(
            id,
            ResourceStatus::Provisioned,
            &format!("Instance {instance_id} running at {address}"),
        )?;

        let target = AgentTarget {
            resource_id: id,
            address,
            region: region.clone(),
            ssh_key: account.ssh_key(&region).map(str::to_string),
            master_address: self.config.master_address.clone(),
        };
        let agent_id = self.install_agent(&target).await?;
        self.store.record_agent_id(id, &agent_id)?;
        self.store
            .set_resource_status(id, ResourceStatus::Running, "Agent registered")?;
        Ok(())
    }

    /// Install the agent, retrying unreachable hosts until the setup window closes.
    async fn install_agent(&self, target: &AgentTarget) -> ProvisionResult<String> {
        let deadline = tokio::time::Instant::now() + self.config.agent_setup_window;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.installer.install(target).await {
                Ok(agent_id) => return Ok(agent_id),
                Err(CloudError::Unreachable(msg))
                    if tokio::time::Instant::now() + self.config.agent_retry < deadline =>
                {
                    debug!(resource_id = target.resource_id, attempt, %msg, "agent host unreachable, retrying");
                    tokio::time::sleep(self.config.agent_retry).await;
                }
                Err(e) => return Err(ProvisionError::Agent(e.to_string())),
            }
        }
    }

    // ── Deprovisioning ─────────────────────────────────────────────

    /// Consume the deprovision queue until shutdown.
    pub async fn run_deprovisioner(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.receiver.lock().await.take() else {
            warn!("deprovision queue already has a consumer");
            return;
        };
        info!("deprovision loop started");
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        self.process_deprovision_request(request).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("deprovision loop shutting down");
    }

    /// Handle every request currently queued, without waiting for more.
    ///
    /// Only works while no deprovision loop owns the queue.
    pub async fn drain_deprovision_queue(&self) -> Vec<JoinHandle<()>> {
        let mut guard = self.receiver.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        while let Ok(request) = rx.try_recv() {
            if let Some(handle) = self.process_deprovision_request(request).await {
                handles.push(handle);
            }
        }
        handles
    }

    /// Claim a resource for teardown and spawn the teardown.
    ///
    /// A resource already DEPROVISIONING or DEPROVISIONED is skipped; this
    /// check is the only guard against tearing a resource down twice.
    pub async fn process_deprovision_request(
        &self,
        request: DeprovisionRequest,
    ) -> Option<JoinHandle<()>> {
        let resource_id = request.resource_id;
        let resource = match self.store.require_resource(resource_id) {
            Ok(resource) => resource,
            Err(e) => {
                error!(resource_id, error = %e, "failed loading resource to deprovision");
                return None;
            }
        };
        if resource.status.is_winding_down() {
            debug!(resource_id, status = %resource.status, "already deprovisioning, skipping");
            return None;
        }
        if let Err(e) = self.store.set_resource_status(
            resource_id,
            ResourceStatus::Deprovisioning,
            &request.reason,
        ) {
            error!(resource_id, error = %e, "failed claiming resource for deprovisioning");
            return None;
        }
        info!(resource_id, reason = %request.reason, "deprovisioning resource");

        let this = self.clone();
        Some(tokio::spawn(async move { this.teardown(resource_id).await }))
    }

    /// Release the cloud capacity behind a resource and finalize it.
    ///
    /// Teardown errors are logged; the resource ends DEPROVISIONED regardless.
    async fn teardown(&self, resource_id: u64) {
        if let Err(e) = self.release_capacity(resource_id).await {
            error!(resource_id, error = %e, "teardown incomplete, cloud capacity may leak");
        }
        match self.store.set_resource_status(
            resource_id,
            ResourceStatus::Deprovisioned,
            "Resource deprovisioned",
        ) {
            Ok(_) => info!(resource_id, "resource deprovisioned"),
            Err(e) => error!(resource_id, error = %e, "failed finalizing deprovisioned resource"),
        }
    }

    async fn release_capacity(&self, resource_id: u64) -> ProvisionResult<()> {
        let resource = self.store.require_resource(resource_id)?;
        let user = self.store.require_user(resource.owner_id)?;
        let region = resource.region();
        let mut first_error = None;

        if !resource.cloud_instance_id.is_empty() {
            if let Err(e) = self
                .cloud
                .terminate_instance(&user.account, &region, &resource.cloud_instance_id)
                .await
            {
                warn!(resource_id, instance_id = %resource.cloud_instance_id, error = %e, "terminate failed");
                first_error.get_or_insert(e);
            }
        }
        if !resource.spot_request_id.is_empty() {
            if let Err(e) = self
                .cloud
                .cancel_spot_request(&user.account, &region, &resource.spot_request_id)
                .await
            {
                warn!(resource_id, request_id = %resource.spot_request_id, error = %e, "cancel failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Run `tick` every `interval` until shutdown.
async fn every<F, Fut>(name: &'static str, interval: Duration, mut shutdown: watch::Receiver<bool>, tick: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(loop_name = name, interval_ms = interval.as_millis() as u64, "provisioner loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => tick().await,
            _ = shutdown.changed() => {
                info!(loop_name = name, "provisioner loop shutting down");
                break;
            }
        }
    }
}
