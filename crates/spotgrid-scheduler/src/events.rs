//! Scheduler events and the producer handle.

use spotgrid_state::{JobId, Resource, ResourceId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::driver::TaskStatus;
use crate::offers::Offer;

/// Everything the scheduler's consumer handles, in arrival order.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// First connection to the cluster manager.
    Registered { framework_id: String },
    Reregistered,
    Disconnected,
    Offers(Vec<Offer>),
    OfferRescinded(String),
    StatusUpdate(TaskStatus),
    /// Bind a STAGING job to `resource`, persisting it first when `create`.
    Assign {
        job_id: JobId,
        resource: Resource,
        create: bool,
    },
    /// Launch assigned jobs onto an offer made by their resource, accepting
    /// the offer once for all of them.
    Launch { job_ids: Vec<JobId>, offer: Offer },
    UserTermination { job_id: JobId },
    /// A winding-down resource still holds staged jobs.
    ResourceTerminated { resource_id: ResourceId },
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Registered { .. } => "registered",
            SchedulerEvent::Reregistered => "reregistered",
            SchedulerEvent::Disconnected => "disconnected",
            SchedulerEvent::Offers(_) => "offers",
            SchedulerEvent::OfferRescinded(_) => "offer-rescinded",
            SchedulerEvent::StatusUpdate(_) => "status-update",
            SchedulerEvent::Assign { .. } => "assign",
            SchedulerEvent::Launch { .. } => "launch",
            SchedulerEvent::UserTermination { .. } => "user-termination",
            SchedulerEvent::ResourceTerminated { .. } => "resource-terminated",
        }
    }
}

/// Producer side of the scheduler queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::Sender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event, waiting for room. Returns false once the scheduler
    /// has stopped.
    pub async fn send(&self, event: SchedulerEvent) -> bool {
        let kind = event.kind();
        if self.tx.send(event).await.is_err() {
            warn!(kind, "scheduler stopped, event dropped");
            return false;
        }
        true
    }

    pub async fn offers(&self, offers: Vec<Offer>) -> bool {
        self.send(SchedulerEvent::Offers(offers)).await
    }

    pub async fn status_update(&self, status: TaskStatus) -> bool {
        self.send(SchedulerEvent::StatusUpdate(status)).await
    }

    pub async fn registered(&self, framework_id: impl Into<String>) -> bool {
        self.send(SchedulerEvent::Registered {
            framework_id: framework_id.into(),
        })
        .await
    }
}
