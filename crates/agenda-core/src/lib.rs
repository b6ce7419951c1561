//! # agenda-core
//!
//! The processor core of a persistent, distributed job scheduler: durable
//! job records live in a pluggable [`repository::JobRepository`], a single
//! process leases due jobs out of it onto an in-memory priority queue, and a
//! dispatcher runs each job's handler under a liveness watchdog.
//!
//! ## Architecture
//!
//! ```text
//! JobRepository (durable store)
//!     │
//!     ▼ get_next_job_to_run / lock_job
//! Queue filler / on-the-fly locker ──► PriorityQueue (in-memory, per process)
//!     │                                      │
//!     │                                      ▼ peek_next
//!     │                                 Dispatcher
//!     │                                      │
//!     │                      ┌───────────────┼───────────────┐
//!     │                      ▼               ▼               ▼
//!     │               handler.run()   completion.complete()  watchdog timeout
//!     │                      └───────────────┴───────────────┘
//!     │                                      │ first to resolve wins
//!     ▼                                      ▼
//! Rescheduler ──────────────────────► save_job_state
//! ```
//!
//! ## Key invariants
//!
//! - Exactly one process ever holds a given job's lease at a time (I1).
//! - A lease is always eventually reclaimable: an abandoned lock expires
//!   after `lockLifetime` and is picked back up by any process (I5).
//! - Concurrency gates (per-definition and process-wide) are always
//!   honored; a closed gate degrades to "try again next pass", never to
//!   running over the limit (I3).
//! - `failCount` only ever increments; a later success does not reset it.
//!
//! ## What this is not
//!
//! - Not a cron daemon: recurrence is evaluated per job, not against a
//!   system-wide schedule table.
//! - Not a distributed consensus system: the repository's atomic claim
//!   operation is the only coordination primitive between processes.
//! - Not a workflow/saga engine: a job's handler is an opaque unit of work,
//!   with no built-in notion of steps or compensations.

mod builder;
mod config;
mod cron_spec;
mod definition;
mod dispatcher;
mod error;
mod events;
mod filler;
mod fly;
mod interval;
mod job;
mod lease;
mod notification;
mod processor;
mod queue;
mod reschedule;
mod repository;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(test)]
mod e2e_tests;

pub use builder::JobBuilder;
pub use config::AgendaConfig;
pub use definition::{
    CompletionHandle, Definition, DefinitionOptions, FnHandler, JobContext, JobHandler, TouchHandle,
    DEFAULT_LOCK_LIFETIME,
};
pub use error::{AgendaError, JobError, RepositoryError, ScheduleError};
pub use events::{EventKind, ProcessorEvent};
pub use job::{Job, JobState, JobType, Priority, UniqueOpts};
pub use notification::{
    ChannelState, JobNotification, NotificationChannel, StateEventKind, StateNotification, Unsubscribe,
};
pub use processor::Agenda;
pub use reschedule::compute_next_run;
pub use repository::{JobPage, JobQuery, JobRepository, JobSort, JobStateDelta};

pub use async_trait::async_trait;
