//! The scheduler event loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use spotgrid_core::SchedulerConfig;
use spotgrid_market::{MatchRequest, MatchingEngine};
use spotgrid_state::{
    AssignTarget, Job, JobId, JobStatus, Resource, ResourceId, ResourceStatus, StateStore, UserId,
    decode_status_message, encode_job,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::driver::{ClusterDriver, TaskInfo, TaskState, TaskStatus, job_id_from_task, task_id};
use crate::error::SchedulerResult;
use crate::events::{SchedulerEvent, SchedulerHandle};
use crate::offers::Offer;

/// Recorded when a status update carries no readable executor payload.
pub const NO_STATUS_MESSAGE: &str = "No valid status message from the executor";

/// An offer in the batch being processed, with the resource it came from.
///
/// An offer can be accepted once, so every job placed on it is launched
/// together when the batch is done.
struct LiveOffer {
    offer: Offer,
    resource: Resource,
    jobs: Vec<JobId>,
}

/// Single consumer of the scheduler queue.
pub struct Scheduler {
    store: StateStore,
    engine: Arc<MatchingEngine>,
    driver: Arc<dyn ClusterDriver>,
    config: SchedulerConfig,
    rx: mpsc::Receiver<SchedulerEvent>,
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        engine: Arc<MatchingEngine>,
        driver: Arc<dyn ClusterDriver>,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        Self {
            store,
            engine,
            driver,
            config,
            rx,
            handle: SchedulerHandle::new(tx),
        }
    }

    /// Producer handle for cluster callbacks and other event sources.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Consume events and run periodic sweeps until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            framework = %self.config.framework_name,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "scheduler started"
        );
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("scheduler shutting down");
    }

    /// Handle one event and every follow-up it raises, FIFO.
    ///
    /// Failures are logged and the failing event is dropped.
    pub async fn dispatch(&self, event: SchedulerEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let kind = event.kind();
            if let Err(e) = self.handle_event(event, &mut pending).await {
                warn!(kind, error = %e, "scheduler event dropped");
            }
        }
    }

    async fn handle_event(
        &self,
        event: SchedulerEvent,
        follow_ups: &mut VecDeque<SchedulerEvent>,
    ) -> SchedulerResult<()> {
        match event {
            SchedulerEvent::Registered { framework_id } => self.registered(&framework_id).await,
            SchedulerEvent::Reregistered => {
                info!("re-registered with cluster manager");
                self.reconcile_tasks().await
            }
            SchedulerEvent::Disconnected => {
                warn!("disconnected from cluster manager");
                Ok(())
            }
            SchedulerEvent::Offers(offers) => self.process_offers(offers, follow_ups).await,
            SchedulerEvent::OfferRescinded(offer_id) => {
                debug!(%offer_id, "offer rescinded");
                Ok(())
            }
            SchedulerEvent::StatusUpdate(status) => self.status_update(status).await,
            SchedulerEvent::Assign {
                job_id,
                resource,
                create,
            } => self.assign(job_id, resource, create),
            SchedulerEvent::Launch { job_ids, offer } => self.launch(&job_ids, offer).await,
            SchedulerEvent::UserTermination { job_id } => self.user_termination(job_id).await,
            SchedulerEvent::ResourceTerminated { resource_id } => {
                self.resource_terminated(resource_id).await
            }
        }
    }

    // ── Offers ─────────────────────────────────────────────────────

    async fn process_offers(
        &self,
        offers: Vec<Offer>,
        follow_ups: &mut VecDeque<SchedulerEvent>,
    ) -> SchedulerResult<()> {
        debug!(count = offers.len(), "processing offers");
        let mut by_user: BTreeMap<UserId, Vec<LiveOffer>> = BTreeMap::new();
        let mut orphans = Vec::new();
        for offer in offers {
            match self.offer_resource(&offer) {
                Some(resource) => by_user.entry(resource.owner_id).or_default().push(LiveOffer {
                    offer,
                    resource,
                    jobs: Vec::new(),
                }),
                None => orphans.push(offer.id),
            }
        }

        match self.store.users_with_pending_jobs() {
            Ok(users) => {
                for user in users {
                    let mut none = Vec::new();
                    let live = by_user.get_mut(&user.id).unwrap_or(&mut none);
                    if let Err(e) = self.schedule_user(user.id, live, follow_ups).await {
                        warn!(user_id = user.id, error = %e, "scheduling pass failed for user");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed listing users with pending jobs"),
        }

        let unused = by_user
            .into_values()
            .flatten()
            .filter(|l| l.jobs.is_empty())
            .map(|l| l.offer.id);
        for offer_id in orphans.into_iter().chain(unused) {
            if let Err(e) = self
                .driver
                .decline_offer(&offer_id, self.config.decline_refusal)
                .await
            {
                warn!(%offer_id, error = %e, "failed declining offer");
            }
        }
        Ok(())
    }

    /// The resource an offer was made on, if it is known.
    fn offer_resource(&self, offer: &Offer) -> Option<Resource> {
        let Some(resource_id) = offer.resource_id() else {
            debug!(offer_id = %offer.id, "offer carries no resource id");
            return None;
        };
        match self.store.get_resource(resource_id) {
            Ok(Some(resource)) => Some(resource),
            Ok(None) => {
                debug!(offer_id = %offer.id, resource_id, "offer for unknown resource");
                None
            }
            Err(e) => {
                warn!(offer_id = %offer.id, resource_id, error = %e, "failed loading offer resource");
                None
            }
        }
    }

    /// Launch a user's assigned jobs onto their resources' offers, then
    /// place unassigned jobs on a free offer or on a newly bought resource.
    async fn schedule_user(
        &self,
        user_id: UserId,
        live: &mut [LiveOffer],
        follow_ups: &mut VecDeque<SchedulerEvent>,
    ) -> SchedulerResult<()> {
        let resource_ids: Vec<ResourceId> = live.iter().map(|l| l.resource.id).collect();
        if !resource_ids.is_empty() {
            for job in self.store.assigned_staging_jobs(&resource_ids)? {
                let slot = live
                    .iter_mut()
                    .find(|l| l.resource.id == job.resource_id && l.offer.fits(&job.shape));
                if let Some(slot) = slot {
                    slot.offer.consume(&job.shape);
                    slot.jobs.push(job.id);
                }
            }
        }

        for job in self.store.unassigned_staging_jobs(user_id)? {
            let slot = live.iter_mut().find(|l| {
                l.resource.status == ResourceStatus::Running && l.offer.fits(&job.shape)
            });
            if let Some(slot) = slot {
                debug!(job_id = job.id, resource_id = slot.resource.id, "job fits a live offer");
                follow_ups.push_back(SchedulerEvent::Assign {
                    job_id: job.id,
                    resource: slot.resource.clone(),
                    create: false,
                });
                slot.offer.consume(&job.shape);
                slot.jobs.push(job.id);
                continue;
            }

            if let Some(resource) = self.plan_resource(user_id, &job).await {
                follow_ups.push_back(SchedulerEvent::Assign {
                    job_id: job.id,
                    resource,
                    create: true,
                });
            }
        }

        // Queued after every Assign above, so the bindings exist by then.
        for slot in live.iter().filter(|l| !l.jobs.is_empty()) {
            follow_ups.push_back(SchedulerEvent::Launch {
                job_ids: slot.jobs.clone(),
                offer: slot.offer.clone(),
            });
        }
        Ok(())
    }

    /// Size and price a new resource for `job`. `None` leaves it STAGING.
    async fn plan_resource(&self, user_id: UserId, job: &Job) -> Option<Resource> {
        let found = match self
            .engine
            .match_request(user_id, &MatchRequest::from(&job.shape))
            .await
        {
            Ok(found) => found,
            Err(e) if e.is_no_market() => {
                info!(job_id = job.id, reason = %e, "no market for job, leaving it staged");
                return None;
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "market match failed");
                return None;
            }
        };
        let capacity = self
            .engine
            .catalog()
            .instance(&found.instance_type)
            .map(|spec| spec.shape())
            .unwrap_or(job.shape);
        info!(
            job_id = job.id,
            zone = %found.zone,
            instance_type = %found.instance_type,
            bid = found.bid_price,
            "requesting new resource"
        );
        Some(Resource::planned(
            user_id,
            found.zone,
            found.instance_type,
            found.bid_price,
            capacity,
        ))
    }

    // ── Decisions ──────────────────────────────────────────────────

    fn assign(&self, job_id: JobId, resource: Resource, create: bool) -> SchedulerResult<()> {
        let job = self.store.require_job(job_id)?;
        if job.status != JobStatus::Staging || job.user_terminated {
            warn!(job_id, status = %job.status, "job no longer assignable");
            return Ok(());
        }
        let target = if create {
            AssignTarget::Create(resource)
        } else {
            let current = self.store.require_resource(resource.id)?;
            if current.status != ResourceStatus::Running {
                warn!(job_id, resource_id = current.id, status = %current.status, "resource not running, not assigning");
                return Ok(());
            }
            AssignTarget::Existing(current.id)
        };
        let bound = self.store.assign_job(job_id, target)?;
        info!(job_id, resource_id = bound.id, created = create, "job assigned");
        Ok(())
    }

    /// Accept `offer` once for every job in `job_ids` that is still staged
    /// on the offer's resource.
    async fn launch(&self, job_ids: &[JobId], offer: Offer) -> SchedulerResult<()> {
        let mut launched = Vec::new();
        let mut tasks = Vec::new();
        for &job_id in job_ids {
            let job = self.store.require_job(job_id)?;
            if job.status.is_terminal() {
                debug!(job_id, status = %job.status, "job already terminal, not launching");
                continue;
            }
            if offer.resource_id() != Some(job.resource_id) {
                debug!(job_id, bound = job.resource_id, offer_id = %offer.id, "stale offer, not launching");
                continue;
            }
            if job.status != JobStatus::Staging {
                debug!(job_id, status = %job.status, "job not staged, not launching");
                continue;
            }

            let job = self.store.set_job_status(
                job_id,
                JobStatus::Launched,
                &format!("Launching on offer {}", offer.id),
            )?;
            tasks.push(TaskInfo {
                task_id: task_id(job.id),
                name: job.name.clone(),
                agent_id: offer.agent_id.clone(),
                cpus: job.shape.cpu,
                mem: job.shape.memory_mb as f64,
                gpus: job.shape.gpu as f64,
                command: job.command.clone(),
                image: job.image.clone(),
                data: encode_job(&job)?,
            });
            launched.push(job_id);
        }
        if tasks.is_empty() {
            debug!(offer_id = %offer.id, "nothing left to launch on offer");
            return Ok(());
        }

        match self.driver.launch_tasks(&[offer.id.clone()], tasks).await {
            Ok(()) => {
                info!(jobs = ?launched, resource_id = ?offer.resource_id(), offer_id = %offer.id, "jobs launched");
                Ok(())
            }
            Err(e) => {
                warn!(jobs = ?launched, error = %e, "launch failed, returning jobs to staging");
                let message = format!("Launch failed: {e}");
                for job_id in launched {
                    self.store
                        .set_job_status(job_id, JobStatus::Staging, &message)?;
                }
                Ok(())
            }
        }
    }

    async fn user_termination(&self, job_id: JobId) -> SchedulerResult<()> {
        let job = self.store.require_job(job_id)?;
        match job.status {
            JobStatus::Staging => {
                if job.is_bound() {
                    self.store.unassign_job(job_id)?;
                }
                self.store
                    .set_job_status(job_id, JobStatus::Killed, "Killed by user")?;
                info!(job_id, "staged job killed by user");
            }
            // The agent cannot be addressed until the task is starting.
            JobStatus::Launched => debug!(job_id, "termination deferred until task starts"),
            JobStatus::Starting | JobStatus::Running => {
                self.driver.kill_task(&task_id(job_id)).await?;
                info!(job_id, "kill requested");
            }
            status => debug!(job_id, %status, "nothing to terminate"),
        }
        Ok(())
    }

    async fn resource_terminated(&self, resource_id: ResourceId) -> SchedulerResult<()> {
        let resource = self.store.require_resource(resource_id)?;
        self.engine
            .cache()
            .mark_unavailable(&resource.zone, &resource.instance_type)
            .await;
        for job in self.store.staged_jobs_on_resource(resource_id)? {
            self.store.unassign_job(job.id)?;
            info!(job_id = job.id, resource_id, "released job from terminated resource");
        }
        Ok(())
    }

    // ── Status updates ─────────────────────────────────────────────

    async fn status_update(&self, status: TaskStatus) -> SchedulerResult<()> {
        let Some(job_id) = job_id_from_task(&status.task_id) else {
            warn!(task_id = %status.task_id, "status update for unparsable task id");
            return Ok(());
        };
        let Some(target) = status.state.job_status() else {
            debug!(job_id, state = ?status.state, "status update carries no transition");
            return Ok(());
        };
        let (message, agent_handle) = match decode_status_message(&status.data) {
            Ok(decoded) => (decoded.message, decoded.job.agent_handle),
            Err(e) => {
                debug!(job_id, error = %e, "unreadable status payload");
                (NO_STATUS_MESSAGE.to_string(), String::new())
            }
        };

        let job = self.store.set_job_status(job_id, target, &message)?;
        if target == JobStatus::Starting && !agent_handle.is_empty() {
            self.store.set_job_agent_handle(job_id, &agent_handle)?;
        }
        debug!(job_id, reported = %target, status = %job.status, "status update applied");

        if job.status.is_terminal() && job.start_time != 0 && job.resource_id != 0 {
            self.record_cost(&job).await;
        }
        let releases = matches!(
            target,
            JobStatus::Finished
                | JobStatus::Failed
                | JobStatus::Killed
                | JobStatus::Error
                | JobStatus::Lost
        );
        if releases && job.resource_id != 0 {
            self.store.unassign_job(job_id)?;
        }
        Ok(())
    }

    async fn record_cost(&self, job: &Job) {
        let resource = match self.store.require_resource(job.resource_id) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "cannot cost job");
                return;
            }
        };
        match self
            .engine
            .cost_between(&resource, job.start_time, job.end_time)
            .await
        {
            Ok(cost) => match self.store.add_job_cost(job.id, cost) {
                Ok(total) => info!(job_id = job.id, cost, total, "job cost recorded"),
                Err(e) => warn!(job_id = job.id, error = %e, "failed recording job cost"),
            },
            Err(e) => warn!(job_id = job.id, error = %e, "failed computing job cost"),
        }
    }

    // ── Registration ───────────────────────────────────────────────

    async fn registered(&self, framework_id: &str) -> SchedulerResult<()> {
        match self.store.get_framework_id()? {
            Some(stored) => debug!(%stored, offered = framework_id, "framework id already stored"),
            None => {
                self.store.set_framework_id(framework_id)?;
                info!(framework_id, "framework registered");
            }
        }
        self.reconcile_tasks().await
    }

    /// Replay every non-terminal job's last status to the cluster manager.
    async fn reconcile_tasks(&self) -> SchedulerResult<()> {
        let mut statuses = Vec::new();
        for job in self.store.non_terminal_jobs()? {
            let agent_id = match job.resource_id {
                0 => String::new(),
                id => self
                    .store
                    .get_resource(id)?
                    .map(|r| r.agent_id)
                    .unwrap_or_default(),
            };
            statuses.push(TaskStatus {
                task_id: task_id(job.id),
                state: TaskState::from_job_status(job.status),
                agent_id,
                message: String::new(),
                data: Vec::new(),
            });
        }
        info!(count = statuses.len(), "reconciling tasks");
        self.driver.reconcile_tasks(statuses).await?;
        Ok(())
    }

    // ── Sweeps ─────────────────────────────────────────────────────

    /// Turn user cancellations and terminated resources into events.
    pub async fn sweep(&self) {
        let mut events = Vec::new();
        match self.store.user_terminated_jobs() {
            Ok(jobs) => events.extend(
                jobs.into_iter()
                    .map(|job| SchedulerEvent::UserTermination { job_id: job.id }),
            ),
            Err(e) => error!(error = %e, "failed listing user-terminated jobs"),
        }
        match self.store.terminated_resources_with_staged_jobs() {
            Ok(ids) => events.extend(
                ids.into_iter()
                    .map(|resource_id| SchedulerEvent::ResourceTerminated { resource_id }),
            ),
            Err(e) => error!(error = %e, "failed listing terminated resources"),
        }
        for event in events {
            self.dispatch(event).await;
        }
    }
}
