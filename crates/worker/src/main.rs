//! Credmarket Background Worker
//!
//! Handles scheduled jobs:
//! - Ledger invariant checks (every 15 minutes by default)
//! - Heartbeat (every 5 minutes)

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;

use std::time::Duration;

use credmarket_billing::InvariantChecker;
use credmarket_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::WorkerConfig;

async fn run_invariant_checks(checker: &InvariantChecker) {
    match checker.run_all_checks().await {
        Ok(summary) => summary.log(),
        Err(e) => error!(error = %e, "Ledger invariant check failed to run"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Credmarket Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    let checker = InvariantChecker::new(pool);
    info!(
        checks = ?InvariantChecker::available_checks(),
        "Running startup invariant check"
    );
    run_invariant_checks(&checker).await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Ledger invariant checks
    let job_checker = checker.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let checker = job_checker.clone();
                Box::pin(async move {
                    info!("Running scheduled ledger invariant check");
                    run_invariant_checks(&checker).await;
                })
            },
        )?)
        .await?;
    info!(
        cron = %config.invariant_check_cron,
        "Scheduled: Ledger invariant checks"
    );

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Credmarket Worker started with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
