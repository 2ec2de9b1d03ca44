//! Funding ledger.
//!
//! A campaign's `current_amount_minor` always equals the sum of its
//! `completed` contributions. Every mutation that touches the balance runs in
//! one transaction whose first statement is a write, so SQLite takes the write
//! lock up front and concurrent writers queue on `busy_timeout` instead of
//! failing on a stale snapshot. `payment_id` is the idempotency key.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use capigrid_core::{
    types::{Contribution, ContributionStatus, PaymentMethod},
    Amount,
};

use crate::{decode_error, is_check_violation, is_foreign_key_violation, is_unique_violation, to_rfc3339};

const CONTRIBUTION_COLUMNS: &str = "id, campaign_id, contributor_id, amount_minor, payment_method, \
     payment_id, contributor_email, contributor_name, anonymous, reward_tier_json, status, \
     created_at, settled_at";

fn contribution_from_row(row: &SqliteRow) -> Result<Contribution, sqlx::Error> {
    let payment_method: String = row.try_get("payment_method")?;
    let status: String = row.try_get("status")?;
    let reward_tier: Option<String> = row.try_get("reward_tier_json")?;

    Ok(Contribution {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        contributor_id: row.try_get("contributor_id")?,
        amount: Amount::from_minor(row.try_get("amount_minor")?).map_err(decode_error)?,
        payment_method: payment_method
            .parse::<PaymentMethod>()
            .map_err(decode_error)?,
        payment_id: row.try_get("payment_id")?,
        contributor_email: row.try_get("contributor_email")?,
        contributor_name: row.try_get("contributor_name")?,
        anonymous: row.try_get("anonymous")?,
        reward_tier: reward_tier
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(decode_error)?,
        status: status
            .parse::<ContributionStatus>()
            .map_err(decode_error)?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn balance_from_row(row: &SqliteRow) -> Result<Amount, sqlx::Error> {
    Amount::from_minor(row.try_get("current_amount_minor")?).map_err(decode_error)
}

/// The funding ledger: contributions and the campaign balances they feed.
#[derive(Clone)]
pub struct ContributionRepository {
    pool: SqlitePool,
}

impl ContributionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a contribution.
    ///
    /// A `completed` contribution increments the campaign balance in the same
    /// transaction. A `pending` one leaves the balance alone until [`settle`].
    /// Both require the campaign to be approved and active. A contribution
    /// whose `payment_id` is already stored is reported as a duplicate and
    /// nothing is written.
    ///
    /// [`settle`]: Self::settle
    pub async fn record(&self, contribution: NewContribution) -> Result<RecordOutcome, ContributionError> {
        let completed = match contribution.status {
            ContributionStatus::Completed => true,
            ContributionStatus::Pending => false,
            other => return Err(ContributionError::InvalidStatus(other)),
        };

        let mut tx = self.pool.begin().await?;

        let campaign_total = if completed {
            let row = sqlx::query(
                "UPDATE campaigns \
                 SET current_amount_minor = current_amount_minor + ?, updated_at = ? \
                 WHERE id = ? AND approved = 1 AND status = 'active' \
                 RETURNING current_amount_minor",
            )
            .bind(contribution.amount.minor())
            .bind(to_rfc3339(contribution.created_at))
            .bind(&contribution.campaign_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_balance_error)?;

            let Some(row) = row else {
                tx.rollback().await?;
                return Err(self.rejection_reason(&contribution.campaign_id).await);
            };
            Some(balance_from_row(&row)?)
        } else {
            None
        };

        let inserted = match insert_contribution(&mut tx, &contribution, completed).await {
            Ok(inserted) => inserted,
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                return self.duplicate_of(&contribution).await;
            }
            Err(err) if is_foreign_key_violation(&err) => {
                tx.rollback().await?;
                return Err(ContributionError::UnknownContributor);
            }
            Err(err) => return Err(err.into()),
        };

        let Some(contribution_row) = inserted else {
            // Only the pending path inserts conditionally.
            tx.rollback().await?;
            return Err(self.rejection_reason(&contribution.campaign_id).await);
        };
        let stored = contribution_from_row(&contribution_row)?;

        let campaign_total = match campaign_total {
            Some(total) => total,
            None => {
                let row = sqlx::query("SELECT current_amount_minor FROM campaigns WHERE id = ?")
                    .bind(&stored.campaign_id)
                    .fetch_one(&mut *tx)
                    .await?;
                balance_from_row(&row)?
            }
        };

        tx.commit().await?;

        Ok(RecordOutcome::Recorded {
            contribution: stored,
            campaign_total,
        })
    }

    /// Marks a pending (or previously failed) contribution as completed and
    /// credits the campaign. Settling twice credits once.
    ///
    /// The amount confirmed by the gateway replaces the recorded amount. The
    /// campaign status is not checked here because the money has already been
    /// captured.
    pub async fn settle(&self, request: SettleContribution) -> Result<SettleOutcome, ContributionError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE contributions \
             SET status = 'completed', amount_minor = ?, settled_at = ? \
             WHERE payment_id = ? AND status IN ('pending', 'failed') \
             RETURNING {CONTRIBUTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(request.confirmed_amount.minor())
            .bind(to_rfc3339(request.settled_at))
            .bind(&request.payment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_balance_error)?;

        let Some(row) = row else {
            tx.rollback().await?;
            return match self.fetch_by_payment_id(&request.payment_id).await? {
                Some(existing) => Ok(SettleOutcome::AlreadySettled(existing)),
                None => Ok(SettleOutcome::NotFound),
            };
        };
        let contribution = contribution_from_row(&row)?;

        let row = sqlx::query(
            "UPDATE campaigns \
             SET current_amount_minor = current_amount_minor + ?, updated_at = ? \
             WHERE id = ? \
             RETURNING current_amount_minor",
        )
        .bind(contribution.amount.minor())
        .bind(to_rfc3339(request.settled_at))
        .bind(&contribution.campaign_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_balance_error)?;
        let campaign_total = balance_from_row(&row)?;

        tx.commit().await?;

        Ok(SettleOutcome::Settled {
            contribution,
            campaign_total,
        })
    }

    /// Moves a pending contribution to `failed`. Returns `None` when no
    /// pending contribution carries `payment_id`.
    pub async fn mark_failed(&self, payment_id: &str) -> Result<Option<Contribution>, ContributionError> {
        let sql = format!(
            "UPDATE contributions SET status = 'failed' \
             WHERE payment_id = ? AND status = 'pending' \
             RETURNING {CONTRIBUTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(contribution_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<Contribution>, ContributionError> {
        let sql = format!("SELECT {CONTRIBUTION_COLUMNS} FROM contributions WHERE payment_id = ?");
        let row = sqlx::query(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(contribution_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Contributions made to a campaign, newest first.
    pub async fn list_for_campaign(&self, campaign_id: &str) -> Result<Vec<Contribution>, ContributionError> {
        let sql = format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions \
             WHERE campaign_id = ? ORDER BY created_at DESC, id"
        );
        let rows = sqlx::query(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        collect(&rows)
    }

    /// Contributions made by a user, newest first.
    pub async fn list_for_contributor(
        &self,
        contributor_id: &str,
    ) -> Result<Vec<Contribution>, ContributionError> {
        let sql = format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions \
             WHERE contributor_id = ? ORDER BY created_at DESC, id"
        );
        let rows = sqlx::query(&sql)
            .bind(contributor_id)
            .fetch_all(&self.pool)
            .await?;
        collect(&rows)
    }

    /// Pending card contributions created at or before `threshold`.
    ///
    /// Rows never checked come first, then the least recently checked, so a
    /// backlog of unpaid checkouts cannot starve newer payments.
    pub async fn list_pending_before(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Contribution>, ContributionError> {
        let sql = format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions \
             WHERE status = 'pending' AND payment_method = 'card' \
               AND payment_id IS NOT NULL AND created_at <= ? \
             ORDER BY reconcile_checked_at IS NOT NULL, reconcile_checked_at, created_at, id \
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(to_rfc3339(threshold))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect(&rows)
    }

    /// Records that the gateway was asked about a still-pending payment.
    pub async fn mark_reconcile_checked(
        &self,
        payment_id: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), ContributionError> {
        sqlx::query(
            "UPDATE contributions SET reconcile_checked_at = ? \
             WHERE payment_id = ? AND status = 'pending'",
        )
        .bind(to_rfc3339(checked_at))
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn duplicate_of(&self, contribution: &NewContribution) -> Result<RecordOutcome, ContributionError> {
        let payment_id = contribution
            .payment_id
            .as_deref()
            .ok_or(ContributionError::DuplicateId)?;
        match self.fetch_by_payment_id(payment_id).await? {
            Some(existing) => Ok(RecordOutcome::Duplicate(existing)),
            None => Err(ContributionError::DuplicateId),
        }
    }

    async fn rejection_reason(&self, campaign_id: &str) -> ContributionError {
        let exists = sqlx::query("SELECT 1 FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => ContributionError::CampaignNotAccepting,
            Ok(None) => ContributionError::CampaignNotFound,
            Err(err) => ContributionError::Database(err),
        }
    }
}

/// Inserts the contribution row. The pending path only inserts when the
/// campaign accepts contributions, so `None` means the campaign rejected it.
async fn insert_contribution(
    tx: &mut Transaction<'_, Sqlite>,
    contribution: &NewContribution,
    completed: bool,
) -> Result<Option<SqliteRow>, sqlx::Error> {
    let reward_tier = contribution
        .reward_tier
        .as_ref()
        .map(Value::to_string);
    let created_at = to_rfc3339(contribution.created_at);
    let settled_at = completed.then(|| created_at.clone());

    let sql = if completed {
        format!(
            "INSERT INTO contributions ({CONTRIBUTION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {CONTRIBUTION_COLUMNS}"
        )
    } else {
        format!(
            "INSERT INTO contributions ({CONTRIBUTION_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
               FROM campaigns WHERE id = ? AND approved = 1 AND status = 'active' \
             RETURNING {CONTRIBUTION_COLUMNS}"
        )
    };

    let mut query = sqlx::query(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(&contribution.campaign_id)
        .bind(&contribution.contributor_id)
        .bind(contribution.amount.minor())
        .bind(contribution.payment_method.as_str())
        .bind(&contribution.payment_id)
        .bind(&contribution.contributor_email)
        .bind(&contribution.contributor_name)
        .bind(contribution.anonymous)
        .bind(reward_tier)
        .bind(contribution.status.as_str())
        .bind(created_at)
        .bind(settled_at);
    if !completed {
        query = query.bind(&contribution.campaign_id);
    }

    query.fetch_optional(&mut **tx).await
}

fn map_balance_error(err: sqlx::Error) -> ContributionError {
    if is_check_violation(&err) {
        ContributionError::BalanceOverflow
    } else {
        ContributionError::Database(err)
    }
}

fn collect(rows: &[SqliteRow]) -> Result<Vec<Contribution>, ContributionError> {
    rows.iter()
        .map(|row| contribution_from_row(row).map_err(ContributionError::from))
        .collect()
}

/// Contribution to be written to the ledger.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub campaign_id: String,
    pub contributor_id: Option<String>,
    pub amount: Amount,
    pub payment_method: PaymentMethod,
    /// Gateway reference. Unique across all contributions when present.
    pub payment_id: Option<String>,
    pub contributor_email: Option<String>,
    pub contributor_name: Option<String>,
    pub anonymous: bool,
    pub reward_tier: Option<Value>,
    /// Either `pending` or `completed`.
    pub status: ContributionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded {
        contribution: Contribution,
        campaign_total: Amount,
    },
    /// A contribution with the same `payment_id` already exists; it is returned unchanged.
    Duplicate(Contribution),
}

impl RecordOutcome {
    pub fn contribution(&self) -> &Contribution {
        match self {
            Self::Recorded { contribution, .. } | Self::Duplicate(contribution) => contribution,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[derive(Debug, Clone)]
pub struct SettleContribution {
    pub payment_id: String,
    pub confirmed_amount: Amount,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled {
        contribution: Contribution,
        campaign_total: Amount,
    },
    /// The contribution was already completed (or refunded); nothing changed.
    AlreadySettled(Contribution),
    NotFound,
}

#[derive(Debug, Error)]
pub enum ContributionError {
    #[error("campaign not found")]
    CampaignNotFound,
    #[error("campaign is not accepting contributions")]
    CampaignNotAccepting,
    #[error("contributor account does not exist")]
    UnknownContributor,
    #[error("contributions can only be recorded as pending or completed, got {0}")]
    InvalidStatus(ContributionStatus),
    #[error("campaign balance would exceed the maximum amount")]
    BalanceOverflow,
    #[error("contribution id collided with an existing row")]
    DuplicateId,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
