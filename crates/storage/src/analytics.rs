use sqlx::{Row, SqlitePool};
use thiserror::Error;

use capigrid_core::{
    types::{CampaignAnalytics, DailyContribution, PlatformStats},
    Amount, AmountError,
};

/// Read-only aggregates over the ledger. Only `completed` contributions count.
#[derive(Clone)]
pub struct AnalyticsRepository {
    pool: SqlitePool,
}

impl AnalyticsRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn platform_stats(&self) -> Result<PlatformStats, AnalyticsError> {
        let row = sqlx::query(
            "SELECT \
               (SELECT COALESCE(SUM(amount_minor), 0) FROM contributions WHERE status = 'completed') AS revenue, \
               (SELECT COUNT(*) FROM campaigns WHERE status = 'active') AS active_campaigns, \
               (SELECT COUNT(*) FROM campaigns) AS total_campaigns, \
               (SELECT COUNT(*) FROM users) AS total_users",
        )
        .fetch_one(&self.pool)
        .await?;

        let revenue: i64 = row.try_get("revenue")?;
        let active: i64 = row.try_get("active_campaigns")?;
        let campaigns: i64 = row.try_get("total_campaigns")?;
        let users: i64 = row.try_get("total_users")?;

        Ok(PlatformStats {
            total_revenue: Amount::from_minor(revenue)?,
            active_campaigns: active as u64,
            total_users: users as u64,
            total_campaigns: campaigns as u64,
        })
    }

    /// Totals, distinct backers and a per-UTC-day breakdown for one campaign.
    pub async fn campaign_analytics(&self, campaign_id: &str) -> Result<CampaignAnalytics, AnalyticsError> {
        let totals = sqlx::query(
            "SELECT COALESCE(SUM(amount_minor), 0) AS raised, \
                    COUNT(*) AS contributions, \
                    COUNT(DISTINCT contributor_id) AS backers \
               FROM contributions \
              WHERE campaign_id = ? AND status = 'completed'",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        let raised: i64 = totals.try_get("raised")?;
        let contributions: i64 = totals.try_get("contributions")?;
        let backers: i64 = totals.try_get("backers")?;
        let total_raised = Amount::from_minor(raised)?;

        // created_at is stored as RFC 3339 UTC, so the first ten characters are the UTC day.
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) AS day, \
                    SUM(amount_minor) AS amount, \
                    COUNT(*) AS count \
               FROM contributions \
              WHERE campaign_id = ? AND status = 'completed' \
              GROUP BY day \
              ORDER BY day ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut daily_contributions = Vec::with_capacity(rows.len());
        for row in rows {
            let amount: i64 = row.try_get("amount")?;
            let count: i64 = row.try_get("count")?;
            daily_contributions.push(DailyContribution {
                date: row.try_get("day")?,
                amount: Amount::from_minor(amount)?,
                count: count as u64,
            });
        }

        Ok(CampaignAnalytics {
            total_raised,
            backers_count: backers as u64,
            avg_contribution: Amount::average(total_raised, contributions as u64),
            daily_contributions,
        })
    }
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("aggregate is out of range: {0}")]
    Amount(#[from] AmountError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
