//! §6.2 NotificationChannel — an optional, low-latency wakeup and
//! cross-process state event fan-out. The core only depends on the trait;
//! no implementation ships here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Disconnected,
}

/// Announces a new/updated job so peers can skip straight to the
/// on-the-fly locker instead of waiting for their own poll (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub job_name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEventKind {
    Start,
    Progress,
    Success,
    Fail,
    Complete,
    Retry,
}

/// A state-transition announcement (§6.2). `source` is the originating
/// worker's `name` (§6.5); receivers suppress events whose `source`
/// matches their own name to avoid self-loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateNotification {
    pub kind: StateEventKind,
    pub job_id: Uuid,
    pub job_name: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub extras: Option<serde_json::Value>,
}

pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Cross-process pub/sub the processor uses purely as an optimization
/// (§6.2). A processor with no channel configured falls back entirely on
/// polling; correctness never depends on this trait.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    fn state(&self) -> ChannelState;

    async fn publish(&self, notification: JobNotification) -> anyhow::Result<()>;
    fn subscribe(
        &self,
        handler: Box<dyn Fn(JobNotification) + Send + Sync>,
    ) -> Unsubscribe;

    async fn publish_state(&self, notification: StateNotification) -> anyhow::Result<()>;
    fn subscribe_state(
        &self,
        handler: Box<dyn Fn(StateNotification) + Send + Sync>,
    ) -> Unsubscribe;
}
