//! §6.3 User-facing event stream.
//!
//! Named events (`start`, `complete`, `success`, `fail`, each with a
//! `:<name>` variant) are modeled as one broadcast stream carrying a
//! structured [`ProcessorEvent`]; subscribers filter on `job.name` and
//! `kind` themselves instead of subscribing to a stringly-typed channel,
//! which keeps the emit side a single call site (§4.H).
//!
//! `Error` is the `error` event of §7: "the only escape hatch" for a
//! transient repository failure, purely observational and never fatal to
//! the tick loop. It carries `job: None` when the failure wasn't scoped to
//! a particular record (e.g. a claim scan for a whole definition name).

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Complete,
    Success,
    Fail,
    Error,
}

/// One emission on the outbound event stream (§6.3, §4.H, §7).
#[derive(Debug, Clone)]
pub struct ProcessorEvent {
    pub kind: EventKind,
    /// `None` for an `Error` event with no single job in hand.
    pub job: Option<Job>,
    /// Set on `fail` and `error`; `None` otherwise.
    pub error: Option<String>,
    /// True when this event originates from a peer's `publishState` rather
    /// than a locally dispatched job (§6.2).
    pub remote: bool,
    pub at: DateTime<Utc>,
}

impl ProcessorEvent {
    /// A repository-error event scoped to no particular job (§7), e.g. a
    /// failed claim scan for a definition name.
    pub(crate) fn repository_error(message: impl Into<String>) -> Self {
        ProcessorEvent {
            kind: EventKind::Error,
            job: None,
            error: Some(message.into()),
            remote: false,
            at: Utc::now(),
        }
    }

    /// A repository-error event scoped to `job` (§7).
    pub(crate) fn repository_error_for(job: Job, message: impl Into<String>) -> Self {
        ProcessorEvent {
            kind: EventKind::Error,
            job: Some(job),
            error: Some(message.into()),
            remote: false,
            at: Utc::now(),
        }
    }
}

/// Broadcast hub for [`ProcessorEvent`]s. Cheap to clone; all clones share
/// the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProcessorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.sender.subscribe()
    }

    /// Emitting is fire-and-forget: a stream with no subscribers is not an
    /// error (§7 — the event channel is purely observational).
    pub fn emit(&self, event: ProcessorEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
