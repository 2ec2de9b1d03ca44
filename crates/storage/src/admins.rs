use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::to_rfc3339;

const ADMIN_COLUMNS: &str = "id, username, password_hash, email, two_factor_secret, is_active, \
                             last_login_at, created_at, updated_at";

/// Repository for username/password administrator accounts.
#[derive(Clone)]
pub struct AdminRepository {
    pool: SqlitePool,
}

impl AdminRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AdminCredential>, AdminError> {
        let sql = format!("SELECT {ADMIN_COLUMNS} FROM admin_credentials WHERE username = ?");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(admin_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<AdminCredential>, AdminError> {
        let sql = format!("SELECT {ADMIN_COLUMNS} FROM admin_credentials WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(admin_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Creates the admin or replaces the credentials of an existing username.
    pub async fn upsert(&self, admin: &NewAdmin) -> Result<AdminCredential, AdminError> {
        let now = to_rfc3339(admin.now);
        let sql = format!(
            "INSERT INTO admin_credentials \
             (id, username, password_hash, email, two_factor_secret, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET \
                 password_hash = excluded.password_hash, \
                 email = excluded.email, \
                 two_factor_secret = excluded.two_factor_secret, \
                 is_active = 1, \
                 updated_at = excluded.updated_at \
             RETURNING {ADMIN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&admin.username)
            .bind(&admin.password_hash)
            .bind(&admin.email)
            .bind(&admin.two_factor_secret)
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await?;
        Ok(admin_from_row(&row)?)
    }

    pub async fn touch_last_login(&self, id: &str, at: DateTime<Utc>) -> Result<(), AdminError> {
        let at = to_rfc3339(at);
        let result = sqlx::query(
            "UPDATE admin_credentials SET last_login_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&at)
        .bind(&at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AdminError::NotFound);
        }
        Ok(())
    }
}

fn admin_from_row(row: &SqliteRow) -> Result<AdminCredential, sqlx::Error> {
    Ok(AdminCredential {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        email: row.try_get("email")?,
        two_factor_secret: row.try_get("two_factor_secret")?,
        is_active: row.try_get("is_active")?,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Stored administrator credentials. The password hash is a PHC string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub two_factor_secret: Option<String>,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAdmin {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub two_factor_secret: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
