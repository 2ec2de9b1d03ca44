use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use capigrid_core::types::Contribution;
use capigrid_gateway::{PaystackClient, PaystackError};
use capigrid_storage::{ContributionError, Database};
use capigrid_util::AppConfig;

use crate::payments::apply_successful_charge;

const BATCH_LIMIT: i64 = 1000;
const RECONCILE_BATCH: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    /// Pending card payments older than this are checked against Paystack.
    pub reconcile_after: Duration,
    /// Pending card payments older than this that are still not paid are failed.
    pub abandon_after: Duration,
}

impl MaintenanceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: config.maintenance_interval,
            reconcile_after: config.reconcile_after,
            abandon_after: config.abandon_after,
        }
    }
}

/// Background worker for session expiry, payment reconciliation and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    paystack: Option<PaystackClient>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    settings: MaintenanceSettings,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub settled: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub still_pending: u64,
    pub errors: u64,
}

impl MaintenanceWorker {
    pub fn new(database: Database, paystack: Option<PaystackClient>, settings: MaintenanceSettings) -> Self {
        Self {
            database,
            paystack,
            clock: Arc::new(Utc::now),
            settings,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "maintenance", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<ReconcileSummary, MaintenanceError> {
        let now = (self.clock)();

        let (sessions_deleted, sessions_busy) = self
            .delete_expired_rows("sessions", now, |now| async move {
                self.database.sessions().delete_expired_batch(now, BATCH_LIMIT).await
            })
            .await?;
        let (states_deleted, states_busy) = self
            .delete_expired_rows("oidc_login_states", now, |now| async move {
                self.database
                    .login_states()
                    .delete_expired_batch(now, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "maintenance",
            sessions_deleted,
            sessions_busy,
            states_deleted,
            states_busy,
            "expired sessions swept"
        );

        let summary = self.reconcile_payments(now).await?;
        self.run_checkpoint().await?;

        Ok(summary)
    }

    async fn delete_expired_rows<Fut>(
        &self,
        table: &'static str,
        now: DateTime<Utc>,
        mut delete_fn: impl FnMut(DateTime<Utc>) -> Fut,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match delete_fn(now).await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => table).increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "maintenance", %table, error = %err, "expiry sweep hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::TtlDelete { table, source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    /// Asks Paystack about card payments whose webhook never arrived.
    async fn reconcile_payments(&self, now: DateTime<Utc>) -> Result<ReconcileSummary, MaintenanceError> {
        let mut summary = ReconcileSummary::default();
        let Some(paystack) = &self.paystack else {
            return Ok(summary);
        };

        let threshold = before(now, self.settings.reconcile_after);
        let abandon_before = before(now, self.settings.abandon_after);
        let pending = match self
            .database
            .contributions()
            .list_pending_before(threshold, RECONCILE_BATCH)
            .await
        {
            Ok(pending) => pending,
            Err(ContributionError::Database(err)) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "reconcile").increment(1);
                warn!(stage = "maintenance", error = %err, "reconcile query hit busy timeout");
                return Ok(summary);
            }
            Err(err) => return Err(MaintenanceError::Reconcile { source: err }),
        };

        for contribution in &pending {
            let result = self
                .reconcile_one(paystack, contribution, now, abandon_before)
                .await;
            if matches!(result, ReconcileResult::StillPending | ReconcileResult::Error) {
                self.mark_checked(contribution, now).await;
            }
            let label = match result {
                ReconcileResult::Settled => {
                    summary.settled += 1;
                    "settled"
                }
                ReconcileResult::Failed => {
                    summary.failed += 1;
                    "failed"
                }
                ReconcileResult::Abandoned => {
                    summary.abandoned += 1;
                    "abandoned"
                }
                ReconcileResult::StillPending => {
                    summary.still_pending += 1;
                    "pending"
                }
                ReconcileResult::Error => {
                    summary.errors += 1;
                    "error"
                }
            };
            counter!("payments_reconciled_total", "result" => label).increment(1);
        }

        if !pending.is_empty() {
            info!(
                stage = "maintenance",
                checked = pending.len(),
                settled = summary.settled,
                failed = summary.failed,
                abandoned = summary.abandoned,
                still_pending = summary.still_pending,
                errors = summary.errors,
                "pending payments reconciled"
            );
        }
        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        paystack: &PaystackClient,
        contribution: &Contribution,
        now: DateTime<Utc>,
        abandon_before: DateTime<Utc>,
    ) -> ReconcileResult {
        let Some(reference) = contribution.payment_id.as_deref() else {
            return ReconcileResult::StillPending;
        };
        let stale = contribution.created_at <= abandon_before;

        match paystack.verify(reference).await {
            Ok(transaction) if transaction.is_success() => {
                match apply_successful_charge(&self.database, &transaction, now, "reconcile").await {
                    Ok(_) => ReconcileResult::Settled,
                    Err(err) => {
                        warn!(stage = "maintenance", %reference, error = %err, "failed to settle reconciled payment");
                        ReconcileResult::Error
                    }
                }
            }
            Ok(transaction) if transaction.is_failed() => self.fail(reference, ReconcileResult::Failed).await,
            Ok(_) if stale => self.fail(reference, ReconcileResult::Abandoned).await,
            Ok(_) => ReconcileResult::StillPending,
            // Paystack never saw the checkout, e.g. the customer closed the page.
            Err(PaystackError::Status { .. } | PaystackError::Rejected { .. }) if stale => {
                self.fail(reference, ReconcileResult::Abandoned).await
            }
            Err(err @ (PaystackError::Status { .. } | PaystackError::Rejected { .. })) => {
                info!(stage = "maintenance", %reference, error = %err, "payment not yet known to gateway");
                ReconcileResult::StillPending
            }
            Err(err) => {
                warn!(stage = "maintenance", %reference, error = %err, "payment lookup failed");
                ReconcileResult::Error
            }
        }
    }

    async fn mark_checked(&self, contribution: &Contribution, now: DateTime<Utc>) {
        let Some(reference) = contribution.payment_id.as_deref() else {
            return;
        };
        if let Err(err) = self
            .database
            .contributions()
            .mark_reconcile_checked(reference, now)
            .await
        {
            warn!(stage = "maintenance", %reference, error = %err, "failed to record reconcile check");
        }
    }

    async fn fail(&self, reference: &str, result: ReconcileResult) -> ReconcileResult {
        match self.database.contributions().mark_failed(reference).await {
            Ok(_) => {
                info!(stage = "maintenance", %reference, outcome = ?result, "pending payment closed");
                result
            }
            Err(err) => {
                if let ContributionError::Database(db_err) = &err {
                    if is_sqlite_busy(db_err) {
                        counter!("db_busy_total", "op" => "reconcile").increment(1);
                    }
                }
                warn!(stage = "maintenance", %reference, error = %err, "failed to close pending payment");
                ReconcileResult::Error
            }
        }
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        let checkpoint_result = self.database.wal_checkpoint_truncate().await;

        match checkpoint_result {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "maintenance",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "maintenance",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
            }
            Err(err) => {
                if is_sqlite_busy(&err) {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(stage = "maintenance", error = %err, "WAL checkpoint hit busy timeout");
                    return Ok(());
                }

                return Err(MaintenanceError::Checkpoint { source: err });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileResult {
    Settled,
    Failed,
    Abandoned,
    StillPending,
    Error,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to list pending payments")]
    Reconcile {
        #[source]
        source: ContributionError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
