/// Background Sweep Module
///
/// Periodically reconciles every eligible user so scheduled unlocks land
/// even when nobody opens the app. Users are processed independently:
/// one user's failure is recorded in the report and the sweep moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;

use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::store::UnlockStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFailure {
    pub user_id: i64,
    pub error: String,
}

/// Aggregate result of one sweep pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub users_checked: usize,
    pub tips_unlocked: usize,
    pub completions: usize,
    /// Users that became ineligible between listing and processing
    pub skipped_ineligible: usize,
    pub failures: Vec<SweepFailure>,
    pub finished_at: DateTime<Utc>,
}

/// Rolling sweep counters surfaced by the HTTP status endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStatus {
    pub last_sweep: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
    pub total_sweeps: u32,
}

/// Reconcile all eligible users once at `now`
///
/// Never aborts partway: per-user errors land in the report's failure
/// list, eligibility races are counted as skips.
pub async fn run_sweep(
    store: &Arc<dyn UnlockStore>,
    reconciler: &Reconciler,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let users = store.list_eligible_users().await?;

    let mut report = SweepReport {
        users_checked: 0,
        tips_unlocked: 0,
        completions: 0,
        skipped_ineligible: 0,
        failures: Vec::new(),
        finished_at: now,
    };

    for user in users {
        match reconciler.reconcile(user.user_id, now).await {
            Ok(outcome) => {
                report.users_checked += 1;
                report.tips_unlocked += outcome.newly_unlocked.len();
                if outcome.completed {
                    report.completions += 1;
                }
            }
            Err(e) if e.is_not_eligible() => {
                report.skipped_ineligible += 1;
                log::debug!("Sweep skipping user {}: {}", user.user_id, e);
            }
            Err(e) => {
                log::error!("Sweep failed for user {}: {:#}", user.user_id, e);
                report.failures.push(SweepFailure {
                    user_id: user.user_id,
                    error: e.to_string(),
                });
            }
        }
    }

    report.finished_at = Utc::now();
    Ok(report)
}

/// Run the unlock sweep at a fixed cadence
pub async fn start_sweep_loop(
    interval_minutes: u64,
    store: Arc<dyn UnlockStore>,
    reconciler: Arc<Reconciler>,
    status: Arc<RwLock<SweepStatus>>,
) {
    let mut interval = time::interval(Duration::from_secs(interval_minutes * 60));

    log::info!(
        "Starting unlock sweep loop (interval: {} minutes)",
        interval_minutes
    );

    // The first tick fires immediately, so unlocks missed while the
    // service was down are caught up at boot
    loop {
        interval.tick().await;

        match run_sweep(&store, &reconciler, Utc::now()).await {
            Ok(report) => {
                log::info!(
                    "Sweep complete: {} users, {} tips unlocked, {} completions, {} failures",
                    report.users_checked,
                    report.tips_unlocked,
                    report.completions,
                    report.failures.len()
                );

                let mut status = status.write().await;
                status.last_sweep = Some(report.finished_at);
                status.last_report = Some(report);
                status.total_sweeps += 1;
            }
            Err(e) => {
                log::error!("Sweep pass failed before processing users: {:#}", e);
            }
        }
    }
}
