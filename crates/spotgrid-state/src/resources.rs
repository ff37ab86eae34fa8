//! Resource records and their status event log.

use redb::WriteTransaction;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::lifecycle::{apply_resource_transition, resource_event};
use crate::store::{StateStore, get_row, next_sequence, put_row, scan_prefix};
use crate::tables::*;
use crate::types::*;

const CREATED_MESSAGE: &str = "Resource requested";

impl StateStore {
    // ── Resources ──────────────────────────────────────────────────

    /// Persist a new resource in NEW and record its first event.
    pub fn create_resource(&self, resource: &Resource) -> StateResult<Resource> {
        let now = self.now();
        let created = self.write(|txn| insert_resource(txn, resource.clone(), now))?;
        info!(
            resource_id = created.id,
            zone = %created.zone,
            instance_type = %created.instance_type,
            "resource created"
        );
        Ok(created)
    }

    pub fn get_resource(&self, id: ResourceId) -> StateResult<Option<Resource>> {
        self.read(|txn| {
            let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            get_row(&table, &id_key(id))
        })
    }

    /// Get a resource, failing with `NotFound` if absent.
    pub fn require_resource(&self, id: ResourceId) -> StateResult<Resource> {
        self.get_resource(id)?
            .ok_or_else(|| StateError::NotFound(format!("resource {id}")))
    }

    /// Run a status change through the resource state machine.
    pub fn set_resource_status(
        &self,
        id: ResourceId,
        status: ResourceStatus,
        message: &str,
    ) -> StateResult<Resource> {
        let now = self.now();
        let resource = self.write(|txn| {
            let mut resource = load_resource(txn, id)?;
            let event = apply_resource_transition(&mut resource, status, message, now)?;
            put_resource(txn, &resource)?;
            append_resource_event(txn, &event)?;
            Ok(resource)
        })?;
        debug!(resource_id = id, status = %resource.status, "resource status updated");
        Ok(resource)
    }

    pub fn record_spot_request(&self, id: ResourceId, request_id: &str) -> StateResult<()> {
        self.update_resource(id, |r| r.spot_request_id = request_id.to_string())
    }

    /// Record the cloud instance backing a resource and when it launched.
    pub fn record_instance(
        &self,
        id: ResourceId,
        instance_id: &str,
        launch_time: u64,
    ) -> StateResult<()> {
        self.update_resource(id, |r| {
            r.cloud_instance_id = instance_id.to_string();
            r.launch_time = launch_time;
        })
    }

    pub fn record_address(&self, id: ResourceId, address: &str) -> StateResult<()> {
        self.update_resource(id, |r| r.address = address.to_string())
    }

    pub fn record_agent_id(&self, id: ResourceId, agent_id: &str) -> StateResult<()> {
        self.update_resource(id, |r| r.agent_id = agent_id.to_string())
    }

    pub fn mark_resource_user_terminated(&self, id: ResourceId) -> StateResult<()> {
        self.update_resource(id, |r| r.user_terminated = true)
    }

    fn update_resource(&self, id: ResourceId, f: impl FnOnce(&mut Resource)) -> StateResult<()> {
        self.write(|txn| {
            let mut resource = load_resource(txn, id)?;
            f(&mut resource);
            put_resource(txn, &resource)
        })
    }

    /// The resource's status history, oldest first.
    pub fn resource_events(&self, id: ResourceId) -> StateResult<Vec<ResourceEvent>> {
        self.read(|txn| {
            let table = txn.open_table(RESOURCE_EVENTS).map_err(map_err!(Table))?;
            scan_prefix(&table, &event_prefix(id))
        })
    }

    pub fn list_resources(&self) -> StateResult<Vec<Resource>> {
        self.scan(RESOURCES)
    }

    /// Resources currently in any of `statuses`.
    pub fn resources_with_status(&self, statuses: &[ResourceStatus]) -> StateResult<Vec<Resource>> {
        Ok(self
            .list_resources()?
            .into_iter()
            .filter(|r| statuses.contains(&r.status))
            .collect())
    }

    /// A user's PROVISIONED or RUNNING resources.
    pub fn provisioned_resources_for_user(&self, owner_id: UserId) -> StateResult<Vec<Resource>> {
        Ok(self
            .resources_with_status(&[ResourceStatus::Provisioned, ResourceStatus::Running])?
            .into_iter()
            .filter(|r| r.owner_id == owner_id)
            .collect())
    }

    /// RUNNING resources the user asked to tear down.
    pub fn running_user_terminated_resources(&self) -> StateResult<Vec<Resource>> {
        Ok(self
            .resources_with_status(&[ResourceStatus::Running])?
            .into_iter()
            .filter(|r| r.user_terminated)
            .collect())
    }

    /// Winding-down resources that still have STAGING jobs bound to them.
    pub fn terminated_resources_with_staged_jobs(&self) -> StateResult<Vec<ResourceId>> {
        let mut ids = Vec::new();
        for resource in self.resources_with_status(&[
            ResourceStatus::Deprovisioning,
            ResourceStatus::Deprovisioned,
        ])? {
            if !self.staged_jobs_on_resource(resource.id)?.is_empty() {
                ids.push(resource.id);
            }
        }
        Ok(ids)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

pub(crate) fn insert_resource(
    txn: &WriteTransaction,
    mut resource: Resource,
    now: u64,
) -> StateResult<Resource> {
    resource.id = next_sequence(txn, "resource")?;
    resource.status = ResourceStatus::New;
    resource.created_at = now;
    put_resource(txn, &resource)?;
    append_resource_event(txn, &resource_event(&resource, now, CREATED_MESSAGE))?;
    Ok(resource)
}

pub(crate) fn load_resource(txn: &WriteTransaction, id: ResourceId) -> StateResult<Resource> {
    let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
    get_row(&table, &id_key(id))?.ok_or_else(|| StateError::NotFound(format!("resource {id}")))
}

pub(crate) fn put_resource(txn: &WriteTransaction, resource: &Resource) -> StateResult<()> {
    let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
    put_row(&mut table, &id_key(resource.id), resource)
}

fn append_resource_event(txn: &WriteTransaction, event: &ResourceEvent) -> StateResult<()> {
    let sequence = next_sequence(txn, "resource_event")?;
    let mut table = txn.open_table(RESOURCE_EVENTS).map_err(map_err!(Table))?;
    put_row(&mut table, &event_key(event.resource_id, sequence), event)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spotgrid_core::{InstanceType, Zone};

    pub(crate) fn test_resource(owner_id: UserId) -> Resource {
        Resource::planned(
            owner_id,
            Zone::from("us-west-2a"),
            InstanceType::from("m4.large"),
            0.125,
            ResourceShape {
                cpu: 2.0,
                memory_mb: 8192,
                gpu: 0,
                disk_gb: 0.0,
            },
        )
    }

    fn drive_to_running(store: &StateStore, id: ResourceId) {
        for status in [
            ResourceStatus::Provisioning,
            ResourceStatus::SpotBidding,
            ResourceStatus::SpotBidAccepted,
            ResourceStatus::Provisioned,
            ResourceStatus::Running,
        ] {
            store.set_resource_status(id, status, "").unwrap();
        }
    }

    #[test]
    fn create_assigns_id_and_new_event() {
        let store = StateStore::open_in_memory().unwrap();
        let mut planned = test_resource(1);
        planned.status = ResourceStatus::Running;
        let r = store.create_resource(&planned).unwrap();
        assert_eq!(r.id, 1);
        assert_eq!(r.status, ResourceStatus::New);

        let events = store.resource_events(r.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ResourceStatus::New);
    }

    #[test]
    fn full_lifecycle_records_every_step() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        drive_to_running(&store, r.id);
        store
            .set_resource_status(r.id, ResourceStatus::Running, "still up")
            .unwrap();
        store
            .set_resource_status(r.id, ResourceStatus::Deprovisioning, "idle")
            .unwrap();
        store
            .set_resource_status(r.id, ResourceStatus::Deprovisioned, "")
            .unwrap();

        let events = store.resource_events(r.id).unwrap();
        assert_eq!(events.len(), 9);
        assert_eq!(events.last().unwrap().status, ResourceStatus::Deprovisioned);
    }

    #[test]
    fn illegal_resource_transition_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        let err = store
            .set_resource_status(r.id, ResourceStatus::Running, "")
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(
            store.require_resource(r.id).unwrap().status,
            ResourceStatus::New
        );
        assert_eq!(store.resource_events(r.id).unwrap().len(), 1);
    }

    #[test]
    fn long_messages_truncated() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        let reason = "x".repeat(5000);
        store
            .set_resource_status(r.id, ResourceStatus::Deprovisioning, &reason)
            .unwrap();
        let events = store.resource_events(r.id).unwrap();
        assert_eq!(events[1].message.len(), MAX_EVENT_MESSAGE_LEN);
    }

    #[test]
    fn runtime_fields_recorded() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        store.record_spot_request(r.id, "sir-1").unwrap();
        store.record_instance(r.id, "i-abc", 1234).unwrap();
        store.record_address(r.id, "10.0.0.7").unwrap();
        store.record_agent_id(r.id, "agent-7").unwrap();
        store.mark_resource_user_terminated(r.id).unwrap();

        let r = store.require_resource(r.id).unwrap();
        assert_eq!(r.spot_request_id, "sir-1");
        assert_eq!(r.cloud_instance_id, "i-abc");
        assert_eq!(r.launch_time, 1234);
        assert_eq!(r.address, "10.0.0.7");
        assert_eq!(r.agent_id, "agent-7");
        assert!(r.user_terminated);
    }

    #[test]
    fn status_queries() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_resource(&test_resource(1)).unwrap();
        let b = store.create_resource(&test_resource(2)).unwrap();
        let _c = store.create_resource(&test_resource(1)).unwrap();
        drive_to_running(&store, a.id);
        drive_to_running(&store, b.id);
        store.mark_resource_user_terminated(b.id).unwrap();

        assert_eq!(
            store
                .resources_with_status(&[ResourceStatus::New])
                .unwrap()
                .len(),
            1
        );
        let mine = store.provisioned_resources_for_user(1).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);
        let doomed = store.running_user_terminated_resources().unwrap();
        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].id, b.id);
    }
}
