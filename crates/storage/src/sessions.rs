use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::to_rfc3339;

/// Repository for server-side HTTP sessions.
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        sid: &str,
        data_json: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (sid, data_json, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(sid)
        .bind(data_json)
        .bind(to_rfc3339(expires_at))
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads a session that has not expired at `now`.
    pub async fn fetch_active(
        &self,
        sid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredSession>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT sid, data_json, expires_at FROM sessions WHERE sid = ? AND expires_at > ?",
        )
        .bind(sid)
        .bind(to_rfc3339(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredSession {
            sid: row.try_get("sid")?,
            data_json: row.try_get("data_json")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    /// Replaces the payload and extends the expiry. Returns `false` when the session is gone.
    pub async fn update_data(
        &self,
        sid: &str,
        data_json: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE sessions SET data_json = ?, expires_at = ? WHERE sid = ?")
            .bind(data_json)
            .bind(to_rfc3339(expires_at))
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, sid: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE sid = ?")
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes up to `limit` sessions that expired before `now`.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE sid IN \
             (SELECT sid FROM sessions WHERE expires_at <= ? ORDER BY expires_at LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub sid: String,
    pub data_json: String,
    pub expires_at: DateTime<Utc>,
}

/// Repository for in-flight OIDC authorization requests.
#[derive(Clone)]
pub struct LoginStateRepository {
    pool: SqlitePool,
}

impl LoginStateRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &NewLoginState) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO oidc_login_states \
             (state, nonce, code_verifier, return_to, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.state)
        .bind(&record.nonce)
        .bind(&record.code_verifier)
        .bind(&record.return_to)
        .bind(to_rfc3339(record.created_at))
        .bind(to_rfc3339(record.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes the state and returns it when it was still valid at `now`.
    ///
    /// The row is deleted even when it has expired, so a state can be used once.
    pub async fn consume(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LoginState>, sqlx::Error> {
        let row = sqlx::query(
            "DELETE FROM oidc_login_states WHERE state = ? \
             RETURNING state, nonce, code_verifier, return_to, expires_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let login_state = LoginState {
            state: row.try_get("state")?,
            nonce: row.try_get("nonce")?,
            code_verifier: row.try_get("code_verifier")?,
            return_to: row.try_get("return_to")?,
            expires_at: row.try_get("expires_at")?,
        };
        if login_state.expires_at <= now {
            return Ok(None);
        }
        Ok(Some(login_state))
    }

    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM oidc_login_states WHERE state IN \
             (SELECT state FROM oidc_login_states WHERE expires_at <= ? ORDER BY expires_at LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct NewLoginState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub return_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub return_to: Option<String>,
    pub expires_at: DateTime<Utc>,
}
