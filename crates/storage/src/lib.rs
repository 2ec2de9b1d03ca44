mod admins;
mod analytics;
mod campaigns;
mod content;
mod contributions;
mod sessions;
mod users;

use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;

pub use admins::{AdminCredential, AdminError, AdminRepository, NewAdmin};
pub use analytics::{AnalyticsError, AnalyticsRepository};
pub use campaigns::{CampaignError, CampaignFilters, CampaignRepository, NewCampaign};
pub use content::{
    CommentError, CommentRepository, NewComment, NewUpdate, UpdateError, UpdateRepository,
};
pub use contributions::{
    ContributionError, ContributionRepository, NewContribution, RecordOutcome, SettleContribution,
    SettleOutcome,
};
pub use sessions::{
    LoginState, LoginStateRepository, NewLoginState, SessionRepository, StoredSession,
};
pub use users::{NewUser, UserError, UserRepository};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are part of the connect options so every pooled connection
    /// gets them, not only the first one.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn sessions(&self) -> SessionRepository {
        SessionRepository::new(self.pool.clone())
    }

    /// Returns a handle for pending OIDC authorization requests.
    pub fn login_states(&self) -> LoginStateRepository {
        LoginStateRepository::new(self.pool.clone())
    }

    /// Returns a handle for username/password admin accounts.
    pub fn admins(&self) -> AdminRepository {
        AdminRepository::new(self.pool.clone())
    }

    pub fn campaigns(&self) -> CampaignRepository {
        CampaignRepository::new(self.pool.clone())
    }

    /// Returns the funding ledger.
    pub fn contributions(&self) -> ContributionRepository {
        ContributionRepository::new(self.pool.clone())
    }

    pub fn updates(&self) -> UpdateRepository {
        UpdateRepository::new(self.pool.clone())
    }

    pub fn comments(&self) -> CommentRepository {
        CommentRepository::new(self.pool.clone())
    }

    pub fn analytics(&self) -> AnalyticsRepository {
        AnalyticsRepository::new(self.pool.clone())
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and returns its statistics.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get(0)?,
            log_frames: row.try_get(1)?,
            checkpointed_frames: row.try_get(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Result row of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    constraint_code(err) == Some(Cow::Borrowed("2067"))
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    constraint_code(err) == Some(Cow::Borrowed("787"))
}

pub(crate) fn is_check_violation(err: &sqlx::Error) -> bool {
    constraint_code(err) == Some(Cow::Borrowed("275"))
}

fn constraint_code(err: &sqlx::Error) -> Option<Cow<'_, str>> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code(),
        _ => None,
    }
}

/// Wraps a column that could not be mapped onto a domain value.
pub(crate) fn decode_error<E>(err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(err))
}


#[cfg(test)]
mod tests {
    use super::test_support::setup_db;
    use super::*;

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 8, "expected core tables to be created");
    }

    #[tokio::test]
    async fn separate_memory_databases_are_isolated() {
        let first = setup_db().await;
        let second = setup_db().await;
        test_support::insert_user(&first, "only-in-first").await;

        assert_eq!(first.users().count().await.expect("count"), 1);
        assert_eq!(second.users().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn checkpoint_reports_statistics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ckpt.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");

        let stats = db.wal_checkpoint_truncate().await.expect("checkpoint");
        assert_eq!(stats.busy_frames, 0);
    }
}
