//! spotgrid-scheduler: owns the job lifecycle.
//!
//! Everything that mutates a job funnels through one event queue with a
//! single consumer, so no two decisions about the same job ever race.
//!
//! # Architecture
//!
//! ```text
//! cluster manager ──(offers, status updates)──► SchedulerHandle ─┐
//! sweep timer ───────────────────────────────────────────────────┤
//!                                                                ▼
//!                                            Scheduler::run (single consumer)
//!                                              ├── Offers        → Assign / Launch / decline
//!                                              ├── Assign        → StateStore::assign_job
//!                                              ├── Launch        → ClusterDriver::launch_tasks
//!                                              ├── StatusUpdate  → job state machine, cost, unbind
//!                                              ├── UserTermination
//!                                              └── ResourceTerminated
//! ```
//!
//! Follow-up events raised while handling one event run before the next
//! queued event.

pub mod driver;
pub mod error;
pub mod events;
pub mod offers;
pub mod scheduler;

pub use driver::{ClusterDriver, TaskInfo, TaskState, TaskStatus, job_id_from_task, task_id};
pub use error::{ClusterError, ClusterResult, SchedulerError, SchedulerResult};
pub use events::{SchedulerEvent, SchedulerHandle};
pub use offers::{Offer, RESOURCE_ID_ATTRIBUTE};
pub use scheduler::{NO_STATUS_MESSAGE, Scheduler};
