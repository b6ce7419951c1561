//! §4.C Definition registry and the user handler surface.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{JobError, RepositoryError};
use crate::job::{Job, Priority};
use crate::repository::{JobRepository, JobStateDelta};

/// Default lock lifetime (§6.5): 10 minutes.
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::milliseconds(600_000);

/// A running job's last known `lockedAt`, shared between the handler's
/// [`TouchHandle`] and the dispatcher's liveness watchdog (§4.H, §5). This
/// is what makes `touch()` actually renew the lease the watchdog is
/// watching, rather than a deadline the watchdog computed once up front.
#[derive(Clone)]
pub(crate) struct LeaseClock(Arc<StdMutex<DateTime<Utc>>>);

impl LeaseClock {
    pub(crate) fn new(initial: DateTime<Utc>) -> Self {
        LeaseClock(Arc::new(StdMutex::new(initial)))
    }

    pub(crate) fn get(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap() = at;
    }
}

/// Lets a running handler renew its lease and optionally report progress
/// (§5 "Cancellation & timeouts": "the user handler may call `touch()`").
#[derive(Clone)]
pub struct TouchHandle {
    repo: Arc<dyn JobRepository>,
    job_id: Uuid,
    clock: LeaseClock,
}

impl TouchHandle {
    pub(crate) fn new(repo: Arc<dyn JobRepository>, job_id: Uuid, clock: LeaseClock) -> Self {
        TouchHandle { repo, job_id, clock }
    }

    /// Renews `lockedAt = now` and, if given, persists `progress`. Updates
    /// the shared [`LeaseClock`] first so the watchdog's next tick sees the
    /// renewal even if the repository write is still in flight.
    pub async fn touch(&self, progress: Option<f64>) -> Result<(), RepositoryError> {
        let now = Utc::now();
        self.clock.set(now);
        self.repo
            .save_job_state(
                self.job_id,
                JobStateDelta {
                    locked_at: Some(Some(now)),
                    progress: progress.map(Some),
                    ..Default::default()
                },
            )
            .await
    }
}

/// The dual completion signal surface (§4.H): a handler may resolve by
/// returning from [`JobHandler::run`], or by calling `complete()` from
/// within a spawned task it does not await directly. The dispatcher races
/// both; whichever resolves first wins and the other is ignored.
#[derive(Clone)]
pub struct CompletionHandle {
    sender: Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<Result<(), JobError>>>>>,
}

impl CompletionHandle {
    pub(crate) fn new() -> (Self, tokio::sync::oneshot::Receiver<Result<(), JobError>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            CompletionHandle {
                sender: Arc::new(tokio::sync::Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Signals completion out-of-band. A second call (from either path) is
    /// silently ignored, matching §4.H.
    pub async fn complete(&self, result: Result<(), JobError>) {
        if let Some(tx) = self.sender.lock().await.take() {
            let _ = tx.send(result);
        }
    }
}

/// What a handler receives when it runs (§4.H).
pub struct JobContext {
    pub job: Job,
    pub touch: TouchHandle,
    pub completion: CompletionHandle,
}

/// A process-local job handler. `run` is the "return-based" completion
/// path; a handler may additionally clone `ctx.completion` into a spawned
/// task and call `complete()` there instead (§4.H).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// A handler built from a plain async closure, for callers who don't need
/// the callback-completion path.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), JobError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.0)(ctx).await
    }
}

/// Process-local configuration for one job name (§3 "Definition").
pub struct Definition {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub concurrency: usize,
    /// 0 means unbounded (§6.5 `defaultLockLimit`).
    pub lock_limit: usize,
    pub lock_lifetime: Duration,
    pub default_priority: Priority,

    running: AtomicI64,
    locked: AtomicI64,
}

impl Definition {
    pub fn running(&self) -> i64 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn locked(&self) -> i64 {
        self.locked.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_locked(&self) {
        self.locked.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_locked(&self) {
        self.locked.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_running(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_running(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Options accepted by [`DefinitionRegistry::define`], defaulting from the
/// process-level config (§4.C).
#[derive(Clone)]
pub struct DefinitionOptions {
    pub concurrency: Option<usize>,
    pub lock_limit: Option<usize>,
    pub lock_lifetime: Option<Duration>,
    pub priority: Option<Priority>,
}

impl Default for DefinitionOptions {
    fn default() -> Self {
        DefinitionOptions {
            concurrency: None,
            lock_limit: None,
            lock_lifetime: None,
            priority: None,
        }
    }
}

/// `name -> Definition` (§4.C). Append-only during normal operation:
/// `define` may be called again for the same name to replace the handler,
/// but the processor never removes entries on its own — removal is purely
/// "this name used to be registered and no longer is", detected by absence,
/// which is what `purge()` acts on.
pub struct DefinitionRegistry {
    entries: DashMap<String, Arc<Definition>>,
    default_concurrency: usize,
    default_lock_limit: usize,
    default_lock_lifetime: Duration,
    default_priority: Priority,
}

impl DefinitionRegistry {
    pub fn new(
        default_concurrency: usize,
        default_lock_limit: usize,
        default_lock_lifetime: Duration,
        default_priority: Priority,
    ) -> Self {
        DefinitionRegistry {
            entries: DashMap::new(),
            default_concurrency,
            default_lock_limit,
            default_lock_lifetime,
            default_priority,
        }
    }

    pub fn define(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        opts: DefinitionOptions,
    ) {
        let name = name.into();
        let definition = Definition {
            name: name.clone(),
            handler,
            concurrency: opts.concurrency.unwrap_or(self.default_concurrency),
            lock_limit: opts.lock_limit.unwrap_or(self.default_lock_limit),
            lock_lifetime: opts.lock_lifetime.unwrap_or(self.default_lock_lifetime),
            default_priority: opts.priority.unwrap_or(self.default_priority),
            running: AtomicI64::new(0),
            locked: AtomicI64::new(0),
        };
        self.entries.insert(name, Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Definition>> {
        self.entries.get(name).map(|e| e.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn total_locked(&self) -> i64 {
        self.entries.iter().map(|e| e.value().locked()).sum()
    }

    pub fn total_running(&self) -> i64 {
        self.entries.iter().map(|e| e.value().running()).sum()
    }
}
