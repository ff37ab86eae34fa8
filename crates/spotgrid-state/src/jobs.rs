//! Job records and their status event log.

use redb::WriteTransaction;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::lifecycle::apply_job_transition;
use crate::store::{StateStore, get_row, next_sequence, put_row, scan_prefix};
use crate::tables::*;
use crate::types::*;

const CREATED_MESSAGE: &str = "Job submitted";

impl StateStore {
    // ── Jobs ───────────────────────────────────────────────────────

    /// Create a job in STAGING and record its first event.
    pub fn create_job(&self, new: NewJob) -> StateResult<Job> {
        let now = self.now();
        let job = self.write(|txn| {
            let id = next_sequence(txn, "job")?;
            let job = Job {
                id,
                owner_id: new.owner_id,
                name: new.name,
                command: new.command,
                image: new.image,
                shape: new.shape,
                status: JobStatus::Staging,
                resource_id: 0,
                retry_count: 0,
                user_terminated: false,
                agent_handle: String::new(),
                start_time: 0,
                end_time: 0,
                total_cost: 0.0,
                created_at: now,
            };
            put_job(txn, &job)?;
            append_job_events(
                txn,
                &[JobEvent {
                    job_id: id,
                    time: now,
                    resource_id: 0,
                    status: JobStatus::Staging,
                    attempt: 0,
                    message: CREATED_MESSAGE.to_string(),
                }],
            )?;
            Ok(job)
        })?;
        info!(job_id = job.id, owner_id = job.owner_id, "job created");
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.read(|txn| {
            let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            get_row(&table, &id_key(id))
        })
    }

    /// Get a job, failing with `NotFound` if absent.
    pub fn require_job(&self, id: JobId) -> StateResult<Job> {
        self.get_job(id)?
            .ok_or_else(|| StateError::NotFound(format!("job {id}")))
    }

    /// Run a status change through the job state machine.
    ///
    /// The status, timestamps, retry counter, and appended events commit in
    /// one transaction. An illegal transition leaves everything unchanged
    /// and returns [`StateError::InvalidTransition`]. Returns the job as
    /// persisted, which may differ from `status` after a retry redirect.
    pub fn set_job_status(&self, id: JobId, status: JobStatus, message: &str) -> StateResult<Job> {
        let now = self.now();
        let job = self.write(|txn| {
            let mut job = load_job(txn, id)?;
            let events = apply_job_transition(&mut job, status, message, now)?;
            put_job(txn, &job)?;
            append_job_events(txn, &events)?;
            Ok(job)
        })?;
        debug!(
            job_id = id,
            requested = %status,
            status = %job.status,
            attempt = job.retry_count,
            "job status updated"
        );
        Ok(job)
    }

    /// Record the execution-agent handle reported when the task started.
    pub fn set_job_agent_handle(&self, id: JobId, handle: &str) -> StateResult<()> {
        self.update_job(id, |job| job.agent_handle = handle.to_string())
            .map(|_| ())
    }

    /// Add to a job's accumulated cost and return the new total.
    pub fn add_job_cost(&self, id: JobId, cost: f64) -> StateResult<f64> {
        self.update_job(id, |job| job.total_cost += cost)
            .map(|job| job.total_cost)
    }

    /// Flag a job for cancellation. The scheduler's sweep picks it up.
    pub fn mark_job_user_terminated(&self, id: JobId) -> StateResult<()> {
        self.update_job(id, |job| job.user_terminated = true)
            .map(|_| ())
    }

    fn update_job(&self, id: JobId, f: impl FnOnce(&mut Job)) -> StateResult<Job> {
        self.write(|txn| {
            let mut job = load_job(txn, id)?;
            f(&mut job);
            put_job(txn, &job)?;
            Ok(job)
        })
    }

    /// The job's status history, oldest first.
    pub fn job_events(&self, id: JobId) -> StateResult<Vec<JobEvent>> {
        self.read(|txn| {
            let table = txn.open_table(JOB_EVENTS).map_err(map_err!(Table))?;
            scan_prefix(&table, &event_prefix(id))
        })
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.scan(JOBS)
    }

    fn jobs_where(&self, pred: impl Fn(&Job) -> bool) -> StateResult<Vec<Job>> {
        Ok(self.list_jobs()?.into_iter().filter(|j| pred(j)).collect())
    }

    /// Jobs that have not reached FINISHED, FAILED, or KILLED.
    pub fn non_terminal_jobs(&self) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| !j.status.is_terminal())
    }

    /// Jobs the user asked to cancel that are not yet terminal.
    pub fn user_terminated_jobs(&self) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| j.user_terminated && !j.status.is_terminal())
    }

    /// STAGING jobs already bound to one of `resource_ids`.
    pub fn assigned_staging_jobs(&self, resource_ids: &[ResourceId]) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| {
            j.status == JobStatus::Staging
                && !j.user_terminated
                && j.is_bound()
                && resource_ids.contains(&j.resource_id)
        })
    }

    /// A user's STAGING jobs with no resource yet.
    pub fn unassigned_staging_jobs(&self, owner_id: UserId) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| {
            j.owner_id == owner_id
                && j.status == JobStatus::Staging
                && !j.user_terminated
                && !j.is_bound()
        })
    }

    /// Jobs bound to a resource in STAGING, LAUNCHED, STARTING, or RUNNING.
    pub fn active_jobs_on_resource(&self, resource_id: ResourceId) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| {
            j.resource_id == resource_id
                && (j.status == JobStatus::Staging || j.status.is_active())
        })
    }

    /// STAGING jobs bound to a resource that are not being cancelled.
    pub fn staged_jobs_on_resource(&self, resource_id: ResourceId) -> StateResult<Vec<Job>> {
        self.jobs_where(|j| {
            j.resource_id == resource_id && j.status == JobStatus::Staging && !j.user_terminated
        })
    }

    /// Users owning at least one STAGING job that is not being cancelled.
    pub fn users_with_pending_jobs(&self) -> StateResult<Vec<User>> {
        let pending: std::collections::BTreeSet<UserId> = self
            .jobs_where(|j| j.status == JobStatus::Staging && !j.user_terminated)?
            .into_iter()
            .map(|j| j.owner_id)
            .collect();
        let mut users = Vec::with_capacity(pending.len());
        for id in pending {
            match self.get_user(id)? {
                Some(user) => users.push(user),
                None => debug!(user_id = id, "pending jobs belong to unknown user"),
            }
        }
        Ok(users)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

pub(crate) fn load_job(txn: &WriteTransaction, id: JobId) -> StateResult<Job> {
    let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
    get_row(&table, &id_key(id))?.ok_or_else(|| StateError::NotFound(format!("job {id}")))
}

pub(crate) fn put_job(txn: &WriteTransaction, job: &Job) -> StateResult<()> {
    let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
    put_row(&mut table, &id_key(job.id), job)
}

fn append_job_events(txn: &WriteTransaction, events: &[JobEvent]) -> StateResult<()> {
    for event in events {
        let sequence = next_sequence(txn, "job_event")?;
        let mut table = txn.open_table(JOB_EVENTS).map_err(map_err!(Table))?;
        put_row(&mut table, &event_key(event.job_id, sequence), event)?;
    }
    Ok(())
}
