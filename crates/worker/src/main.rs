//! Plancap Background Worker
//!
//! Handles scheduled jobs including:
//! - Seat reconciliation sweep over every subscribed workspace (hourly by default)
//! - Seat billing invariant checks (hourly, offset from the sweep)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use anyhow::Context;
use plancap_billing::{BillingService, InvariantChecker, ViolationSeverity};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Schedules read from the environment
struct WorkerConfig {
    database_url: String,
    seat_sweep_cron: String,
    invariant_cron: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            // Six-field cron: sec min hour day month weekday
            seat_sweep_cron: std::env::var("SEAT_SWEEP_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            invariant_cron: std::env::var("INVARIANT_CHECK_CRON")
                .unwrap_or_else(|_| "0 30 * * * *".to_string()),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Plancap Worker");

    let config = WorkerConfig::from_env()?;
    let pool = plancap_shared::create_pool(&config.database_url).await?;

    let billing = Arc::new(
        BillingService::from_env(pool.clone()).context("Stripe billing is not configured")?,
    );
    let checker = Arc::new(InvariantChecker::new(pool));

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Seat sweep. Catches anything the post-commit sync missed,
    // including remote failures left for retry.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.seat_sweep_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running seat reconciliation sweep");
                match billing.reconciler.reconcile_all().await {
                    Ok(summary) if summary.remote_failures > 0 => warn!(
                        failures = summary.remote_failures,
                        "Some seat items could not be synced; next sweep will retry"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Seat sweep could not list workspaces"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.seat_sweep_cron, "Scheduled: Seat reconciliation sweep");

    // Job 2: Invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) => {
                        let critical = summary
                            .violations
                            .iter()
                            .filter(|v| v.severity == ViolationSeverity::Critical)
                            .count();
                        if critical > 0 {
                            error!(
                                critical = critical,
                                failed = summary.checks_failed,
                                "Critical seat billing invariant violations"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Seat invariant checks");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Plancap Worker started with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");
    scheduler.shutdown().await?;
    billing.shutdown();
    Ok(())
}
