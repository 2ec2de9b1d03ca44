use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use capigrid_core::types::{User, UserRole};

use crate::{decode_error, is_unique_violation, to_rfc3339};

const USER_COLUMNS: [&str; 9] = [
    "id",
    "email",
    "first_name",
    "last_name",
    "profile_image_url",
    "role",
    "two_factor_enabled",
    "created_at",
    "updated_at",
];

/// Builds `alias.col AS prefixcol, ...` for joins that embed a user.
pub(crate) fn user_select_list(alias: &str, prefix: &str) -> String {
    USER_COLUMNS
        .iter()
        .map(|column| format!("{alias}.{column} AS {prefix}{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps the user columns of `row`, optionally prefixed by a join alias.
pub(crate) fn user_from_row(row: &SqliteRow, prefix: &str) -> Result<User, sqlx::Error> {
    let col = |name: &str| format!("{prefix}{name}");
    let role: String = row.try_get(col("role").as_str())?;
    Ok(User {
        id: row.try_get(col("id").as_str())?,
        email: row.try_get(col("email").as_str())?,
        first_name: row.try_get(col("first_name").as_str())?,
        last_name: row.try_get(col("last_name").as_str())?,
        profile_image_url: row.try_get(col("profile_image_url").as_str())?,
        role: role.parse::<UserRole>().map_err(decode_error)?,
        two_factor_enabled: row.try_get(col("two_factor_enabled").as_str())?,
        created_at: row.try_get(col("created_at").as_str())?,
        updated_at: row.try_get(col("updated_at").as_str())?,
    })
}

/// Repository for platform accounts created from OIDC claims.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<User>, UserError> {
        let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS.join(", "));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| user_from_row(&row, "").map_err(UserError::from))
            .transpose()
    }

    /// Inserts the user or refreshes the profile fields of an existing one.
    ///
    /// The stored role is never overwritten by a login.
    pub async fn upsert(&self, user: &NewUser) -> Result<User, UserError> {
        let now = to_rfc3339(user.now);
        let sql = format!(
            "INSERT INTO users (id, email, first_name, last_name, profile_image_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 email = excluded.email, \
                 first_name = excluded.first_name, \
                 last_name = excluded.last_name, \
                 profile_image_url = excluded.profile_image_url, \
                 updated_at = excluded.updated_at \
             RETURNING {}",
            USER_COLUMNS.join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(&user.id)
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.profile_image_url)
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    UserError::EmailTaken
                } else {
                    UserError::Database(err)
                }
            })?;
        Ok(user_from_row(&row, "")?)
    }

    /// Changes the role of an existing user.
    pub async fn set_role(
        &self,
        id: &str,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Result<User, UserError> {
        let sql = format!(
            "UPDATE users SET role = ?, updated_at = ? WHERE id = ? RETURNING {}",
            USER_COLUMNS.join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(role.as_str())
            .bind(to_rfc3339(now))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)?;
        Ok(user_from_row(&row, "")?)
    }

    pub async fn count(&self) -> Result<u64, UserError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM users")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }
}

/// Profile data taken from verified ID token claims.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("email address is already used by another account")]
    EmailTaken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
