//! In-process cluster manager for standalone runs.
//!
//! Every RUNNING resource is offered to the scheduler on each round, minus
//! what its local tasks already hold. Launched tasks walk through
//! STARTING and RUNNING and finish once they have run for the configured
//! duration. No container is actually executed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spotgrid_scheduler::{
    ClusterDriver, ClusterError, ClusterResult, Offer, SchedulerHandle, TaskInfo, TaskState,
    TaskStatus,
};
use spotgrid_state::{
    ResourceId, ResourceShape, ResourceStatus, StateStore, StatusMessage, decode_job,
    encode_status_message,
};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OFFER_INTERVAL: Duration = Duration::from_secs(2);

struct LocalTask {
    info: TaskInfo,
    resource_id: ResourceId,
    launched_at: Instant,
    reported: TaskState,
}

#[derive(Default)]
struct ClusterState {
    next_offer: u64,
    /// Offer id → resource it was made on. Offers live for one round.
    outstanding: HashMap<String, ResourceId>,
    /// Resources not to offer again before the given instant.
    refused: HashMap<ResourceId, Instant>,
    tasks: BTreeMap<String, LocalTask>,
    kills: Vec<String>,
    lost: Vec<String>,
}

/// What one round produced for the scheduler.
#[derive(Debug, Default)]
pub(crate) struct Round {
    pub statuses: Vec<TaskStatus>,
    pub offers: Vec<Offer>,
}

#[derive(Clone)]
pub struct LocalCluster {
    store: StateStore,
    task_duration: Duration,
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    pub fn new(store: StateStore, task_duration: Duration) -> Self {
        Self {
            store,
            task_duration,
            state: Arc::new(Mutex::new(ClusterState::default())),
        }
    }

    /// Register with the scheduler, then feed it offers and status updates
    /// until shutdown.
    pub async fn run(
        self,
        events: SchedulerHandle,
        framework_name: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        events.registered(format!("{framework_name}-local")).await;
        info!(interval_secs = OFFER_INTERVAL.as_secs(), "local cluster started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(OFFER_INTERVAL) => {
                    let round = self.round().await;
                    for status in round.statuses {
                        events.status_update(status).await;
                    }
                    if !round.offers.is_empty() {
                        events.offers(round.offers).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("local cluster shutting down");
                    break;
                }
            }
        }
    }

    /// Advance every task one step and make a fresh set of offers.
    pub(crate) async fn round(&self) -> Round {
        let mut state = self.state.lock().await;
        let mut round = Round::default();

        for task_id in std::mem::take(&mut state.kills) {
            if let Some(task) = state.tasks.remove(&task_id) {
                round.statuses.push(report(&task, TaskState::Killed, "Killed on request"));
            }
        }
        for task_id in std::mem::take(&mut state.lost) {
            round.statuses.push(TaskStatus {
                task_id,
                state: TaskState::Lost,
                agent_id: String::new(),
                message: "Task unknown to the cluster".to_string(),
                data: Vec::new(),
            });
        }

        let mut finished = Vec::new();
        for (task_id, task) in state.tasks.iter_mut() {
            let next = match task.reported {
                TaskState::Staging => TaskState::Starting,
                TaskState::Starting => TaskState::Running,
                TaskState::Running if task.launched_at.elapsed() >= self.task_duration => {
                    finished.push(task_id.clone());
                    TaskState::Finished
                }
                _ => continue,
            };
            task.reported = next;
            round.statuses.push(report(task, next, "Simulated task"));
        }
        for task_id in finished {
            state.tasks.remove(&task_id);
        }

        state.outstanding.clear();
        let now = Instant::now();
        state.refused.retain(|_, until| *until > now);
        let running = match self.store.resources_with_status(&[ResourceStatus::Running]) {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "failed listing running resources");
                return round;
            }
        };
        for resource in running {
            if state.refused.contains_key(&resource.id) {
                continue;
            }
            let mut free = ResourceShape {
                cpu: resource.cpu_total,
                memory_mb: resource.memory_total_mb,
                gpu: resource.gpu_total,
                disk_gb: 0.0,
            };
            for task in state.tasks.values().filter(|t| t.resource_id == resource.id) {
                free.cpu = (free.cpu - task.info.cpus).max(0.0);
                free.memory_mb = free.memory_mb.saturating_sub(task.info.mem as u64);
                free.gpu = free.gpu.saturating_sub(task.info.gpus as u32);
            }
            state.next_offer += 1;
            let offer_id = format!("offer-{}", state.next_offer);
            state.outstanding.insert(offer_id.clone(), resource.id);
            round
                .offers
                .push(Offer::for_resource(offer_id, resource.agent_id.clone(), resource.id, &free));
        }
        round
    }
}

fn report(task: &LocalTask, state: TaskState, message: &str) -> TaskStatus {
    let data = match decode_job(&task.info.data) {
        Ok(mut job) => {
            job.agent_handle = format!("local-{}", task.info.task_id);
            encode_status_message(&StatusMessage {
                job,
                message: message.to_string(),
            })
            .unwrap_or_default()
        }
        Err(e) => {
            debug!(task_id = %task.info.task_id, error = %e, "task carries no job payload");
            Vec::new()
        }
    };
    TaskStatus {
        task_id: task.info.task_id.clone(),
        state,
        agent_id: task.info.agent_id.clone(),
        message: message.to_string(),
        data,
    }
}

#[async_trait]
impl ClusterDriver for LocalCluster {
    async fn launch_tasks(&self, offer_ids: &[String], tasks: Vec<TaskInfo>) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let mut resource_id = None;
        for offer_id in offer_ids {
            let id = state
                .outstanding
                .remove(offer_id)
                .ok_or_else(|| ClusterError::UnknownOffer(offer_id.clone()))?;
            resource_id.get_or_insert(id);
        }
        let resource_id =
            resource_id.ok_or_else(|| ClusterError::Rejected("launch without an offer".into()))?;
        for info in tasks {
            debug!(task_id = %info.task_id, resource_id, "task launched");
            state.tasks.insert(
                info.task_id.clone(),
                LocalTask {
                    info,
                    resource_id,
                    launched_at: Instant::now(),
                    reported: TaskState::Staging,
                },
            );
        }
        Ok(())
    }

    async fn kill_task(&self, task_id: &str) -> ClusterResult<()> {
        self.state.lock().await.kills.push(task_id.to_string());
        Ok(())
    }

    async fn decline_offer(&self, offer_id: &str, refuse_for: Duration) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        if let Some(resource_id) = state.outstanding.remove(offer_id) {
            state
                .refused
                .insert(resource_id, Instant::now() + refuse_for);
        }
        Ok(())
    }

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let mut lost = Vec::new();
        for status in statuses {
            let active = matches!(status.state, TaskState::Starting | TaskState::Running);
            if active && !state.tasks.contains_key(&status.task_id) {
                lost.push(status.task_id);
            }
        }
        info!(lost = lost.len(), "tasks reconciled");
        state.lost.extend(lost);
        Ok(())
    }
}
