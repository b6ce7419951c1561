//! Fixtures and helpers for exercising `agenda-core` without a real backend.
//!
//! There is no teacher crate to adapt here — the original framework's
//! testing utilities existed for a different coordination primitive
//! entirely — so this follows the shape `agenda-core`'s own tests use
//! internally (an in-memory repository, `tokio::sync::broadcast` event
//! capture) and makes it reusable across crates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agenda_core::{Agenda, AgendaConfig, EventKind, JobContext, JobError, JobHandler, ProcessorEvent};
use async_trait::async_trait;
use tokio::sync::Mutex;

pub use agenda_core::memory::InMemoryJobRepository;

/// Builds an `Agenda` backed by an in-memory repository with a short
/// `processEvery`, suitable for tests that don't want to wait out a
/// production poll interval.
pub fn test_agenda() -> Agenda {
    test_agenda_named("test-worker")
}

pub fn test_agenda_named(worker_name: &str) -> Agenda {
    let repo = Arc::new(InMemoryJobRepository::new());
    let config = AgendaConfig {
        name: worker_name.to_string(),
        process_every: chrono::Duration::milliseconds(25),
        ..Default::default()
    };
    Agenda::new(repo, config)
}

/// A handler that counts invocations and always succeeds. Handy for
/// asserting "ran N times" without writing a bespoke handler per test.
pub struct CountingHandler {
    pub count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(CountingHandler {
                count: count.clone(),
            }),
            count,
        )
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn run(&self, _ctx: JobContext) -> Result<(), JobError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A handler that always fails with a fixed message.
pub struct FailingHandler(pub String);

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _ctx: JobContext) -> Result<(), JobError> {
        Err(JobError::Failed(self.0.clone()))
    }
}

/// Captures every event a processor emits so a test can assert on the
/// sequence after the fact, instead of racing a live subscription.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ProcessorEvent>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl EventRecorder {
    pub fn attach(agenda: &Agenda) -> Self {
        let mut rx = agenda.subscribe();
        let events = Arc::new(Mutex::new(Vec::new()));
        let store = events.clone();
        let task = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                store.lock().await.push(event);
            }
        });
        EventRecorder { events, _task: task }
    }

    pub async fn snapshot(&self) -> Vec<ProcessorEvent> {
        self.events.lock().await.clone()
    }

    /// Polls until an event of `kind` for `job_name` has been recorded, or
    /// `timeout` elapses.
    pub async fn wait_for(&self, kind: EventKind, job_name: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .events
                .lock()
                .await
                .iter()
                .any(|e| e.kind == kind && e.job.as_ref().map(|j| j.name.as_str()) == Some(job_name))
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
