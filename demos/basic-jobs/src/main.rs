//! Runs a handful of one-shot jobs at different priorities against an
//! in-memory repository, to show the dispatch order and event stream.

use std::sync::Arc;
use std::time::Duration;

use agenda_core::memory::InMemoryJobRepository;
use agenda_core::{Agenda, AgendaConfig, FnHandler, Priority};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let repo = Arc::new(InMemoryJobRepository::new());
    let config = AgendaConfig {
        name: "basic-jobs-demo".to_string(),
        process_every: chrono::Duration::milliseconds(100),
        ..Default::default()
    };
    let agenda = Agenda::new(repo, config);

    agenda.define(
        "send-welcome-email",
        Arc::new(FnHandler(|ctx| async move {
            let to = ctx.job.data.get("to").and_then(|v| v.as_str()).unwrap_or("unknown");
            tracing::info!(to, priority = ctx.job.priority.0, "sending welcome email");
            Ok(())
        })),
    );

    let mut subscriber = agenda.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = subscriber.recv().await {
            let job_name = event.job.as_ref().map(|j| j.name.as_str()).unwrap_or("-");
            tracing::info!(kind = ?event.kind, job = job_name, error = ?event.error, "event");
        }
    });

    agenda
        .create("send-welcome-email", serde_json::json!({"to": "low-priority-user"}))
        .priority(Priority::LOW)
        .now()
        .save()
        .await?;
    agenda
        .create("send-welcome-email", serde_json::json!({"to": "normal-priority-user"}))
        .now()
        .save()
        .await?;
    agenda
        .create("send-welcome-email", serde_json::json!({"to": "high-priority-user"}))
        .priority(Priority::HIGH)
        .now()
        .save()
        .await?;

    agenda.start().await?;
    agenda.drain().await;
    agenda.stop(Duration::from_secs(5)).await?;

    Ok(())
}
