//! Job and resource state machines.
//!
//! Pure transition logic: validate a requested status change against the
//! transition table and compute the record updates plus the audit events
//! to append. Persistence lives in the store, which applies the result in
//! one write transaction.
//!
//! ```text
//! STAGING ─▶ LAUNCHED ─▶ STARTING ─▶ RUNNING ─▶ FINISHED
//!    │           │           │           │
//!    └───────────┴─────┬─────┴───────────┘
//!                      ▼
//!          ERROR / LOST ──▶ STAGING (retry) or FAILED
//!          KILLED, FAILED
//! ```

use thiserror::Error;

use crate::types::{
    Job, JobEvent, JobStatus, MAX_EVENT_MESSAGE_LEN, Resource, ResourceEvent, ResourceStatus,
};

/// Retries granted to a job that reports ERROR or LOST.
pub const MAX_RETRIES: u32 = 3;

pub const RETRY_MESSAGE: &str = "Retrying";
pub const NO_MORE_RETRIES_MESSAGE: &str = "Failed, no more retries";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid job transition {from} -> {to} for job {job_id}")]
    Job {
        job_id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid resource transition {from} -> {to} for resource {resource_id}")]
    Resource {
        resource_id: u64,
        from: ResourceStatus,
        to: ResourceStatus,
    },
}

// ── Jobs ───────────────────────────────────────────────────────

/// The single success successor of an active starting state.
pub fn success_successor(from: JobStatus) -> Option<JobStatus> {
    match from {
        JobStatus::Staging => Some(JobStatus::Launched),
        JobStatus::Launched => Some(JobStatus::Starting),
        JobStatus::Starting => Some(JobStatus::Running),
        JobStatus::Running => Some(JobStatus::Finished),
        _ => None,
    }
}

/// Failure targets reachable from an active starting state.
///
/// LAUNCHED may fall back to STAGING when the task never reached the
/// cluster manager.
pub fn failure_set(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Staging => &[Error, Lost, Killed],
        Launched => &[Error, Lost, Killed, Failed, Staging],
        Starting | Running => &[Error, Lost, Killed, Failed],
        _ => &[],
    }
}

pub fn is_legal_job_transition(from: JobStatus, to: JobStatus) -> bool {
    success_successor(from) == Some(to) || failure_set(from).contains(&to)
}

/// Apply `to` to `job` at time `now`.
///
/// On success the job is updated in place and the events to append are
/// returned in order. ERROR and LOST never persist: the job is redirected
/// to STAGING while retries remain, otherwise finalized as FAILED, and a
/// second event records the redirect. On error the job is untouched.
pub fn apply_job_transition(
    job: &mut Job,
    to: JobStatus,
    message: &str,
    now: u64,
) -> Result<Vec<JobEvent>, TransitionError> {
    let from = job.status;
    if !is_legal_job_transition(from, to) {
        return Err(TransitionError::Job {
            job_id: job.id,
            from,
            to,
        });
    }

    let mut events = Vec::with_capacity(2);
    job.status = to;
    stamp_job_times(job, now);
    events.push(job_event(job, now, message));

    if matches!(to, JobStatus::Error | JobStatus::Lost) {
        if job.retry_count < MAX_RETRIES {
            job.retry_count += 1;
            job.status = JobStatus::Staging;
            events.push(job_event(job, now, RETRY_MESSAGE));
        } else {
            job.status = JobStatus::Failed;
            stamp_job_times(job, now);
            events.push(job_event(job, now, NO_MORE_RETRIES_MESSAGE));
        }
    }

    Ok(events)
}

fn stamp_job_times(job: &mut Job, now: u64) {
    match job.status {
        JobStatus::Launched if job.start_time == 0 => job.start_time = now,
        JobStatus::Finished | JobStatus::Failed | JobStatus::Killed => job.end_time = now,
        _ => {}
    }
}

fn job_event(job: &Job, now: u64, message: &str) -> JobEvent {
    JobEvent {
        job_id: job.id,
        time: now,
        resource_id: job.resource_id,
        status: job.status,
        attempt: job.retry_count,
        message: message.to_string(),
    }
}

// ── Resources ──────────────────────────────────────────────────

/// Legal successors of a resource status.
pub fn resource_successors(from: ResourceStatus) -> &'static [ResourceStatus] {
    use ResourceStatus::*;
    match from {
        New => &[Provisioning, Deprovisioning],
        Provisioning => &[SpotBidding, Deprovisioning],
        SpotBidding => &[SpotBidAccepted, Deprovisioning],
        SpotBidAccepted => &[Provisioned, Deprovisioning],
        Provisioned => &[Running, Deprovisioning],
        Running => &[Running, Deprovisioning],
        Deprovisioning => &[Deprovisioned],
        Deprovisioned => &[],
    }
}

pub fn is_legal_resource_transition(from: ResourceStatus, to: ResourceStatus) -> bool {
    resource_successors(from).contains(&to)
}

/// Apply `to` to `resource`, returning the event to append.
pub fn apply_resource_transition(
    resource: &mut Resource,
    to: ResourceStatus,
    message: &str,
    now: u64,
) -> Result<ResourceEvent, TransitionError> {
    let from = resource.status;
    if !is_legal_resource_transition(from, to) {
        return Err(TransitionError::Resource {
            resource_id: resource.id,
            from,
            to,
        });
    }
    resource.status = to;
    Ok(resource_event(resource, now, message))
}

pub(crate) fn resource_event(resource: &Resource, now: u64, message: &str) -> ResourceEvent {
    ResourceEvent {
        resource_id: resource.id,
        time: now,
        status: resource.status,
        message: truncate_message(message),
    }
}

/// Cut a message to at most [`MAX_EVENT_MESSAGE_LEN`] bytes on a char boundary.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_EVENT_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_EVENT_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceShape, ResourceStatus};
    use spotgrid_core::{InstanceType, Zone};

    fn test_job(status: JobStatus) -> Job {
        Job {
            id: 7,
            owner_id: 1,
            name: "train".into(),
            command: "python train.py".into(),
            image: "trainer:latest".into(),
            shape: ResourceShape {
                cpu: 1.0,
                memory_mb: 512,
                gpu: 0,
                disk_gb: 0.0,
            },
            status,
            resource_id: 3,
            retry_count: 0,
            user_terminated: false,
            agent_handle: String::new(),
            start_time: 0,
            end_time: 0,
            total_cost: 0.0,
            created_at: 0,
        }
    }

    #[test]
    fn every_pair_matches_table() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let mut job = test_job(from);
                let before = job.clone();
                let result = apply_job_transition(&mut job, to, "", 10);
                if is_legal_job_transition(from, to) {
                    assert!(result.is_ok(), "{from} -> {to} should be legal");
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be illegal");
                    assert_eq!(job, before);
                }
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for from in [JobStatus::Finished, JobStatus::Failed, JobStatus::Killed] {
            for to in JobStatus::ALL {
                assert!(!is_legal_job_transition(from, to));
            }
        }
    }

    #[test]
    fn success_path_stamps_times() {
        let mut job = test_job(JobStatus::Staging);
        apply_job_transition(&mut job, JobStatus::Launched, "", 100).unwrap();
        assert_eq!(job.start_time, 100);
        apply_job_transition(&mut job, JobStatus::Starting, "", 200).unwrap();
        apply_job_transition(&mut job, JobStatus::Running, "", 300).unwrap();
        let events = apply_job_transition(&mut job, JobStatus::Finished, "done", 400).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.start_time, 100);
        assert_eq!(job.end_time, 400);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "done");
        assert_eq!(events[0].resource_id, 3);
    }

    #[test]
    fn start_time_survives_relaunch() {
        let mut job = test_job(JobStatus::Staging);
        job.start_time = 50;
        apply_job_transition(&mut job, JobStatus::Launched, "", 100).unwrap();
        assert_eq!(job.start_time, 50);
    }

    #[test]
    fn error_with_retries_left_restages() {
        let mut job = test_job(JobStatus::Running);
        job.retry_count = 2;
        let events = apply_job_transition(&mut job, JobStatus::Error, "oom", 10).unwrap();
        assert_eq!(job.status, JobStatus::Staging);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.end_time, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, JobStatus::Error);
        assert_eq!(events[0].attempt, 2);
        assert_eq!(events[1].status, JobStatus::Staging);
        assert_eq!(events[1].attempt, 3);
        assert_eq!(events[1].message, RETRY_MESSAGE);
    }

    #[test]
    fn lost_without_retries_fails() {
        let mut job = test_job(JobStatus::Starting);
        job.retry_count = MAX_RETRIES;
        let events = apply_job_transition(&mut job, JobStatus::Lost, "", 99).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, MAX_RETRIES);
        assert_eq!(job.end_time, 99);
        assert_eq!(events.last().unwrap().message, NO_MORE_RETRIES_MESSAGE);
    }

    #[test]
    fn resource_table() {
        use ResourceStatus::*;
        assert!(is_legal_resource_transition(New, Provisioning));
        assert!(is_legal_resource_transition(Running, Running));
        assert!(is_legal_resource_transition(SpotBidding, Deprovisioning));
        assert!(!is_legal_resource_transition(New, Running));
        assert!(!is_legal_resource_transition(Deprovisioning, Running));
        assert!(!is_legal_resource_transition(Deprovisioned, Deprovisioning));
        for from in ResourceStatus::ALL {
            if from != Deprovisioning && from != Deprovisioned {
                assert!(is_legal_resource_transition(from, Deprovisioning), "{from}");
            }
        }
    }

    #[test]
    fn resource_event_message_truncated() {
        let mut r = Resource::planned(
            1,
            Zone::from("us-east-1a"),
            InstanceType::from("m4.large"),
            0.1,
            ResourceShape::default(),
        );
        let long = "é".repeat(MAX_EVENT_MESSAGE_LEN);
        let event = apply_resource_transition(&mut r, ResourceStatus::Provisioning, &long, 5).unwrap();
        assert!(event.message.len() <= MAX_EVENT_MESSAGE_LEN);
        assert_eq!(r.status, ResourceStatus::Provisioning);

        let err = apply_resource_transition(&mut r, ResourceStatus::Running, "", 6).unwrap_err();
        assert!(matches!(err, TransitionError::Resource { .. }));
        assert_eq!(r.status, ResourceStatus::Provisioning);
    }
}
