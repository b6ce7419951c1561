//! §4.I Scheduler / orchestrator — the `Agenda` handle callers construct,
//! configure job definitions on, and start/stop.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgendaConfig;
use crate::definition::{DefinitionOptions, DefinitionRegistry, JobHandler};
use crate::dispatcher;
use crate::error::AgendaError;
use crate::events::{EventBus, ProcessorEvent};
use crate::filler;
use crate::fly;
use crate::job::Job;
use crate::notification::NotificationChannel;
use crate::queue::PriorityQueue;
use crate::repository::{JobQuery, JobRepository};

/// All mutable and shared state the filler/fly-locker/dispatcher tasks
/// touch. Held behind `Arc` so spawned tasks can outlive the call that
/// created them; individual fields are separately locked rather than one
/// coarse lock, since filler/fly/dispatcher each only ever need one or two
/// of them at a time (§5).
pub(crate) struct Shared {
    pub(crate) config: AgendaConfig,
    pub(crate) registry: Arc<DefinitionRegistry>,
    pub(crate) repo: Arc<dyn JobRepository>,
    pub(crate) events: EventBus,
    pub(crate) notification: Option<Arc<dyn NotificationChannel>>,

    pub(crate) queue: Mutex<PriorityQueue>,
    pub(crate) locally_locked: Mutex<HashSet<Uuid>>,
    pub(crate) filling: Mutex<HashSet<String>>,
    pub(crate) fly_queue: Mutex<VecDeque<Job>>,
    pub(crate) timer_scheduled: Mutex<HashSet<Uuid>>,

    pub(crate) locking_on_the_fly: AtomicBool,
    pub(crate) dispatch_running: AtomicBool,
    pub(crate) dispatch_pending: AtomicBool,
    pub(crate) running: AtomicBool,
    /// §4.I `drain`: once set, the filler and on-the-fly locker refuse to
    /// claim any new job, but in-flight handlers are left to finish.
    pub(crate) draining: AtomicBool,
}

/// The entry point of the crate: owns one processor's configuration,
/// definitions and lifecycle (§4.I).
pub struct Agenda {
    pub(crate) shared: Arc<Shared>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    notify_unsubscribe: Mutex<Option<crate::notification::Unsubscribe>>,
}

impl Agenda {
    pub fn new(repo: Arc<dyn JobRepository>, config: AgendaConfig) -> Self {
        Self::with_notification_channel(repo, config, None)
    }

    pub fn with_notification_channel(
        repo: Arc<dyn JobRepository>,
        config: AgendaConfig,
        notification: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let registry = Arc::new(DefinitionRegistry::new(
            config.default_concurrency,
            config.default_lock_limit,
            config.default_lock_lifetime,
            config.default_priority,
        ));
        let shared = Arc::new(Shared {
            config,
            registry,
            repo,
            events: EventBus::new(),
            notification,
            queue: Mutex::new(PriorityQueue::new()),
            locally_locked: Mutex::new(HashSet::new()),
            filling: Mutex::new(HashSet::new()),
            fly_queue: Mutex::new(VecDeque::new()),
            timer_scheduled: Mutex::new(HashSet::new()),
            locking_on_the_fly: AtomicBool::new(false),
            dispatch_running: AtomicBool::new(false),
            dispatch_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        });
        Agenda {
            shared,
            tick_handle: Mutex::new(None),
            notify_unsubscribe: Mutex::new(None),
        }
    }

    /// Registers (or replaces) a handler for `name` (§4.C).
    pub fn define(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.define_with(name, handler, DefinitionOptions::default());
    }

    pub fn define_with(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        opts: DefinitionOptions,
    ) {
        self.shared.registry.define(name, handler, opts);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.shared.events.subscribe()
    }

    /// Builds a new, unsaved job for a registered definition (§4.D, builder
    /// surface per §9's acknowledged out-of-scope-but-necessary API).
    pub fn create(&self, name: impl Into<String>, data: serde_json::Value) -> crate::builder::JobBuilder {
        crate::builder::JobBuilder::new(self.shared.clone(), name.into(), data)
    }

    /// Starts the processor: connects the repository and notification
    /// channel (if any), subscribes to remote wakeups, and begins polling on
    /// `processEvery` (§4.I).
    pub async fn start(&self) -> Result<(), AgendaError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(AgendaError::AlreadyRunning);
        }
        self.shared.draining.store(false, Ordering::SeqCst);

        self.shared.repo.connect().await?;

        if let Some(channel) = &self.shared.notification {
            channel.connect().await.map_err(|e| {
                AgendaError::Repository(crate::error::RepositoryError::Connection(e.to_string()))
            })?;
            let shared = self.shared.clone();
            let unsubscribe = channel.subscribe(Box::new(move |notification| {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Ok(Some(job)) = shared
                        .repo
                        .get_job_by_id(notification.job_id)
                        .await
                    {
                        fly::enqueue_fly_candidate(&shared, job).await;
                    }
                });
            }));
            *self.notify_unsubscribe.lock().await = Some(unsubscribe);
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(
                shared
                    .config
                    .process_every
                    .to_std()
                    .unwrap_or(StdDuration::from_secs(5)),
            );
            loop {
                interval.tick().await;
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                run_fill_pass(&shared).await;
                dispatcher::wake(&shared);
            }
        });
        *self.tick_handle.lock().await = Some(handle);

        info!(worker = %self.shared.config.name, "processor started");
        Ok(())
    }

    /// Stops polling and, unless `force`, waits up to `timeout` for
    /// in-flight handlers to finish before returning (§4.I, §7). Leases this
    /// process still holds are always released regardless of `force`.
    pub async fn stop(&self, timeout: StdDuration) -> Result<(), AgendaError> {
        self.stop_inner(timeout, false).await
    }

    pub async fn stop_force(&self) -> Result<(), AgendaError> {
        self.stop_inner(StdDuration::from_secs(0), true).await
    }

    async fn stop_inner(&self, timeout: StdDuration, force: bool) -> Result<(), AgendaError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(AgendaError::NotRunning);
        }

        if let Some(handle) = self.tick_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(unsubscribe) = self.notify_unsubscribe.lock().await.take() {
            unsubscribe();
        }
        if let Some(channel) = &self.shared.notification {
            let _ = channel.disconnect().await;
        }

        if !force {
            let deadline = tokio::time::Instant::now() + timeout;
            while self.shared.registry.total_running() > 0 {
                if tokio::time::Instant::now() >= deadline {
                    self.release_all_leases().await;
                    return Err(AgendaError::StopTimeout(timeout));
                }
                tokio::time::sleep(StdDuration::from_millis(25)).await;
            }
        }

        self.release_all_leases().await;
        Ok(())
    }

    async fn release_all_leases(&self) {
        let ids: Vec<Uuid> = self.shared.locally_locked.lock().await.drain().collect();
        if ids.is_empty() {
            return;
        }
        if let Err(err) = self.shared.repo.unlock_jobs(&ids).await {
            warn!(error = %err, "failed to release leases on stop");
            self.shared.events.emit(ProcessorEvent::repository_error(format!(
                "failed to release leases on stop: {err}"
            )));
        }
    }

    /// Blocks until the queue this process holds is empty and no handler is
    /// running (§4.I "drain"). Unlike `stop`, the periodic tick keeps
    /// running, but `draining` stops the filler and on-the-fly locker from
    /// claiming any new job, so the wait is guaranteed to converge.
    pub async fn drain(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        loop {
            let queue_empty = self.shared.queue.lock().await.is_empty();
            let none_running = self.shared.registry.total_running() == 0;
            if queue_empty && none_running {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
    }

    /// Removes every job record belonging to a definition no longer
    /// registered in this process (§4.C, §8 P7). Never touches jobs for
    /// names that are still defined, even if they are currently idle.
    pub async fn purge(&self) -> Result<u64, AgendaError> {
        let known = self.shared.registry.names();
        let query = JobQuery {
            names_not_in: Some(known),
            ..Default::default()
        };
        Ok(self.shared.repo.remove_jobs(&query).await?)
    }

    pub async fn queue_size(&self) -> Result<u64, AgendaError> {
        Ok(self.shared.repo.get_queue_size().await?)
    }
}

/// §4.F: fan out one fill attempt per registered definition name, run
/// concurrently but each serialized against itself by [`filler::fill_definition`]'s
/// internal guard.
async fn run_fill_pass(shared: &Arc<Shared>) {
    if shared.draining.load(Ordering::SeqCst) {
        return;
    }
    let names = shared.registry.names();
    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            filler::fill_definition(&shared, &name).await;
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await {
            debug!(error = %err, "queue filler task panicked");
        }
    }
}
