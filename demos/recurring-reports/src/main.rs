//! A recurring job with a per-name concurrency limit, driven by a cron
//! expression evaluated in a specific timezone.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agenda_core::memory::InMemoryJobRepository;
use agenda_core::{Agenda, AgendaConfig, DefinitionOptions, FnHandler};
use chrono_tz::Tz;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let repo = Arc::new(InMemoryJobRepository::new());
    let config = AgendaConfig {
        name: "recurring-reports-demo".to_string(),
        process_every: chrono::Duration::milliseconds(200),
        ..Default::default()
    };
    let agenda = Agenda::new(repo, config);

    agenda.define_with(
        "generate-daily-report",
        Arc::new(FnHandler(|ctx| async move {
            tracing::info!(region = ?ctx.job.data.get("region"), "generating report");
            ctx.touch.touch(Some(0.5)).await.ok();
            Ok(())
        })),
        DefinitionOptions {
            concurrency: Some(2),
            lock_limit: Some(1),
            ..Default::default()
        },
    );

    let tz = Tz::from_str("America/New_York").unwrap_or(chrono_tz::UTC);

    agenda
        .create("generate-daily-report", serde_json::json!({"region": "us-east"}))
        .repeat_every("0 0 6 * * *")
        .timezone(tz)
        .save()
        .await?;

    agenda.start().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    agenda.stop(Duration::from_secs(5)).await?;

    Ok(())
}
