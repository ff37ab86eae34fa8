//! Job ↔ resource binding with capacity bookkeeping.
//!
//! A resource's `*_used` counters always equal the sum of the shapes of
//! the jobs bound to it. Both directions update the job and the resource
//! in one write transaction, so the counters never drift from the bindings.

use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::jobs::{load_job, put_job};
use crate::resources::{insert_resource, load_resource, put_resource};
use crate::store::StateStore;
use crate::types::*;

/// Slack for floating-point cpu sums.
const CPU_EPSILON: f64 = 1e-9;

/// Where [`StateStore::assign_job`] binds a job.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    /// An already persisted resource.
    Existing(ResourceId),
    /// A planned resource persisted in the same transaction as the binding.
    Create(Resource),
}

impl StateStore {
    /// Bind a job to a resource and claim its shape from the resource.
    ///
    /// Fails with `Conflict` if the job is already bound and with
    /// `CapacityExceeded` if the resource cannot hold the job. Returns the
    /// resource as persisted (with its id when newly created).
    pub fn assign_job(&self, job_id: JobId, target: AssignTarget) -> StateResult<Resource> {
        let now = self.now();
        let resource = self.write(|txn| {
            let mut job = load_job(txn, job_id)?;
            if job.is_bound() {
                return Err(StateError::Conflict(format!(
                    "job {job_id} already bound to resource {}",
                    job.resource_id
                )));
            }

            let mut resource = match target {
                AssignTarget::Existing(id) => load_resource(txn, id)?,
                AssignTarget::Create(planned) => insert_resource(txn, planned, now)?,
            };
            claim(&mut resource, &job.shape)?;
            job.resource_id = resource.id;

            put_resource(txn, &resource)?;
            put_job(txn, &job)?;
            Ok(resource)
        })?;
        debug!(job_id, resource_id = resource.id, "job assigned");
        Ok(resource)
    }

    /// Unbind a job and release its shape. A no-op for an unbound job.
    ///
    /// Returns the resource the job was bound to, if any.
    pub fn unassign_job(&self, job_id: JobId) -> StateResult<Option<ResourceId>> {
        let released = self.write(|txn| {
            let mut job = load_job(txn, job_id)?;
            if !job.is_bound() {
                return Ok(None);
            }
            let resource_id = job.resource_id;
            match load_resource(txn, resource_id) {
                Ok(mut resource) => {
                    release(&mut resource, &job.shape);
                    put_resource(txn, &resource)?;
                }
                Err(StateError::NotFound(_)) => {
                    warn!(job_id, resource_id, "bound resource missing, clearing binding");
                }
                Err(e) => return Err(e),
            }
            job.resource_id = 0;
            put_job(txn, &job)?;
            Ok(Some(resource_id))
        })?;
        if let Some(resource_id) = released {
            debug!(job_id, resource_id, "job unassigned");
        }
        Ok(released)
    }
}

fn claim(resource: &mut Resource, shape: &ResourceShape) -> StateResult<()> {
    let cpu = resource.cpu_used + shape.cpu;
    let memory = resource.memory_used_mb + shape.memory_mb;
    let gpu = resource.gpu_used + shape.gpu;
    if cpu > resource.cpu_total + CPU_EPSILON
        || memory > resource.memory_total_mb
        || gpu > resource.gpu_total
    {
        return Err(StateError::CapacityExceeded {
            resource_id: resource.id,
            detail: format!(
                "need cpu {cpu}/{} mem {memory}/{} gpu {gpu}/{}",
                resource.cpu_total, resource.memory_total_mb, resource.gpu_total
            ),
        });
    }
    resource.cpu_used = cpu;
    resource.memory_used_mb = memory;
    resource.gpu_used = gpu;
    Ok(())
}

fn release(resource: &mut Resource, shape: &ResourceShape) {
    let cpu = resource.cpu_used - shape.cpu;
    resource.cpu_used = if cpu < CPU_EPSILON { 0.0 } else { cpu };
    resource.memory_used_mb = resource.memory_used_mb.saturating_sub(shape.memory_mb);
    resource.gpu_used = resource.gpu_used.saturating_sub(shape.gpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tests::test_resource;
    use proptest::prelude::*;

    fn job_with(store: &StateStore, cpu: f64, memory_mb: u64, gpu: u32) -> Job {
        store
            .create_job(NewJob {
                owner_id: 1,
                name: "j".into(),
                command: "true".into(),
                image: "busybox".into(),
                shape: ResourceShape {
                    cpu,
                    memory_mb,
                    gpu,
                    disk_gb: 0.0,
                },
            })
            .unwrap()
    }

    #[test]
    fn assign_creates_resource_in_same_txn() {
        let store = StateStore::open_in_memory().unwrap();
        let job = job_with(&store, 1.0, 512, 0);
        let resource = store
            .assign_job(job.id, AssignTarget::Create(test_resource(1)))
            .unwrap();
        assert_eq!(resource.status, ResourceStatus::New);
        assert_eq!(resource.cpu_used, 1.0);
        assert_eq!(resource.memory_used_mb, 512);

        let job = store.require_job(job.id).unwrap();
        assert_eq!(job.resource_id, resource.id);
        assert_eq!(store.require_resource(resource.id).unwrap(), resource);
    }

    #[test]
    fn assign_rejects_double_binding() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        let job = job_with(&store, 0.5, 256, 0);
        store.assign_job(job.id, AssignTarget::Existing(r.id)).unwrap();
        let err = store
            .assign_job(job.id, AssignTarget::Existing(r.id))
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert_eq!(store.require_resource(r.id).unwrap().cpu_used, 0.5);
    }

    #[test]
    fn assign_rejects_overflow_without_side_effects() {
        let store = StateStore::open_in_memory().unwrap();
        let job = job_with(&store, 4.0, 512, 0);
        let err = store
            .assign_job(job.id, AssignTarget::Create(test_resource(1)))
            .unwrap_err();
        assert!(matches!(err, StateError::CapacityExceeded { .. }));
        // The planned resource was rolled back with the binding.
        assert!(store.list_resources().unwrap().is_empty());
        assert!(!store.require_job(job.id).unwrap().is_bound());
    }

    #[test]
    fn unassign_releases_and_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        let job = job_with(&store, 1.0, 1024, 0);
        store.assign_job(job.id, AssignTarget::Existing(r.id)).unwrap();

        assert_eq!(store.unassign_job(job.id).unwrap(), Some(r.id));
        assert_eq!(store.unassign_job(job.id).unwrap(), None);

        let r = store.require_resource(r.id).unwrap();
        assert_eq!(r.cpu_used, 0.0);
        assert_eq!(r.memory_used_mb, 0);
        assert!(!store.require_job(job.id).unwrap().is_bound());
    }

    #[test]
    fn staged_jobs_on_terminated_resources() {
        let store = StateStore::open_in_memory().unwrap();
        let r = store.create_resource(&test_resource(1)).unwrap();
        let job = job_with(&store, 1.0, 512, 0);
        store.assign_job(job.id, AssignTarget::Existing(r.id)).unwrap();
        assert!(store.terminated_resources_with_staged_jobs().unwrap().is_empty());

        store
            .set_resource_status(r.id, ResourceStatus::Deprovisioning, "bid lost")
            .unwrap();
        assert_eq!(store.terminated_resources_with_staged_jobs().unwrap(), vec![r.id]);
        assert_eq!(store.assigned_staging_jobs(&[r.id]).unwrap().len(), 1);
        assert_eq!(store.active_jobs_on_resource(r.id).unwrap().len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Assign(usize, usize),
        Unassign(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize, 0..2usize).prop_map(|(j, r)| Op::Assign(j, r)),
            (0..6usize).prop_map(Op::Unassign),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn used_capacity_matches_bound_jobs(
            shapes in proptest::collection::vec(
                (prop::sample::select(vec![0.25f64, 0.5, 1.0]), 1u64..1024, 0u32..2),
                6,
            ),
            ops in proptest::collection::vec(op(), 1..40),
        ) {
            let store = StateStore::open_in_memory().unwrap();
            let mut planned = test_resource(1);
            planned.gpu_total = 4;
            let resources = [
                store.create_resource(&planned).unwrap(),
                store.create_resource(&planned).unwrap(),
            ];
            let jobs: Vec<Job> = shapes
                .iter()
                .map(|(cpu, mem, gpu)| job_with(&store, *cpu, *mem, *gpu))
                .collect();

            for op in ops {
                // Rejections (double bind, overflow) are part of the sequence.
                match op {
                    Op::Assign(j, r) => {
                        let _ = store.assign_job(jobs[j].id, AssignTarget::Existing(resources[r].id));
                    }
                    Op::Unassign(j) => {
                        store.unassign_job(jobs[j].id).unwrap();
                    }
                }
            }

            for resource in &resources {
                let r = store.require_resource(resource.id).unwrap();
                let bound: Vec<Job> = store
                    .list_jobs()
                    .unwrap()
                    .into_iter()
                    .filter(|j| j.resource_id == r.id)
                    .collect();
                let cpu: f64 = bound.iter().map(|j| j.shape.cpu).sum();
                let mem: u64 = bound.iter().map(|j| j.shape.memory_mb).sum();
                let gpu: u32 = bound.iter().map(|j| j.shape.gpu).sum();
                prop_assert!((r.cpu_used - cpu).abs() < 1e-9);
                prop_assert_eq!(r.memory_used_mb, mem);
                prop_assert_eq!(r.gpu_used, gpu);
                prop_assert!(r.cpu_used <= r.cpu_total + 1e-9);
                prop_assert!(r.memory_used_mb <= r.memory_total_mb);
                prop_assert!(r.gpu_used <= r.gpu_total);
            }
        }
    }
}
