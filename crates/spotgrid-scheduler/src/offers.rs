//! Resource offers from the cluster manager.

use std::collections::BTreeMap;

use spotgrid_state::{ResourceId, ResourceShape};

/// Agent attribute carrying the id of the resource the agent runs on.
pub const RESOURCE_ID_ATTRIBUTE: &str = "resource-id";

/// A time-limited grant of capacity on one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub cpus: f64,
    /// Megabytes.
    pub mem: f64,
    pub gpus: f64,
    pub attributes: BTreeMap<String, String>,
}

impl Offer {
    /// An offer tagged with the resource it was made on.
    pub fn for_resource(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        resource_id: ResourceId,
        capacity: &ResourceShape,
    ) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(RESOURCE_ID_ATTRIBUTE.to_string(), resource_id.to_string());
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            hostname: String::new(),
            cpus: capacity.cpu,
            mem: capacity.memory_mb as f64,
            gpus: capacity.gpu as f64,
            attributes,
        }
    }

    /// The correlated resource, if the attribute is present and numeric.
    pub fn resource_id(&self) -> Option<ResourceId> {
        self.attributes
            .get(RESOURCE_ID_ATTRIBUTE)?
            .parse()
            .ok()
            .filter(|id| *id != 0)
    }

    pub fn fits(&self, shape: &ResourceShape) -> bool {
        self.cpus >= shape.cpu
            && self.mem >= shape.memory_mb as f64
            && self.gpus >= shape.gpu as f64
    }

    /// Deduct a launched job from what this offer still has to give.
    pub(crate) fn consume(&mut self, shape: &ResourceShape) {
        self.cpus = (self.cpus - shape.cpu).max(0.0);
        self.mem = (self.mem - shape.memory_mb as f64).max(0.0);
        self.gpus = (self.gpus - shape.gpu as f64).max(0.0);
    }
}
