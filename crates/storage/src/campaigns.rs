use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use capigrid_core::{
    types::{Campaign, CampaignStatus, CampaignWithCreator, FundingModel},
    validation::ValidCampaign,
    Amount, Rate,
};

use crate::{decode_error, is_foreign_key_violation, to_rfc3339, users};

pub(crate) const CAMPAIGN_COLUMNS: &str = "c.id, c.title, c.description, c.short_description, \
     c.image_url, c.funding_model, c.target_amount_minor, c.current_amount_minor, c.creator_id, \
     c.status, c.featured, c.approved, c.approved_at, c.approved_by, c.end_date, c.category, \
     c.rewards_json, c.equity_percentage_bp, c.interest_rate_bp, c.created_at, c.updated_at";

fn bare_columns() -> String {
    CAMPAIGN_COLUMNS.replace("c.", "")
}

const PUBLIC_FILTER: &str = "c.approved = 1 AND c.status = 'active'";

pub(crate) fn campaign_from_row(row: &SqliteRow) -> Result<Campaign, sqlx::Error> {
    let funding_model: String = row.try_get("funding_model")?;
    let status: String = row.try_get("status")?;
    let rewards_json: Option<String> = row.try_get("rewards_json")?;
    let equity: Option<i64> = row.try_get("equity_percentage_bp")?;
    let interest: Option<i64> = row.try_get("interest_rate_bp")?;

    Ok(Campaign {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        short_description: row.try_get("short_description")?,
        image_url: row.try_get("image_url")?,
        funding_model: funding_model
            .parse::<FundingModel>()
            .map_err(decode_error)?,
        target_amount: Amount::from_minor(row.try_get("target_amount_minor")?)
            .map_err(decode_error)?,
        current_amount: Amount::from_minor(row.try_get("current_amount_minor")?)
            .map_err(decode_error)?,
        creator_id: row.try_get("creator_id")?,
        status: status.parse::<CampaignStatus>().map_err(decode_error)?,
        featured: row.try_get("featured")?,
        approved: row.try_get("approved")?,
        approved_at: row.try_get("approved_at")?,
        approved_by: row.try_get("approved_by")?,
        end_date: row.try_get("end_date")?,
        category: row.try_get("category")?,
        rewards: rewards_json
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(decode_error)?,
        equity_percentage: equity
            .map(Rate::from_hundredths)
            .transpose()
            .map_err(decode_error)?,
        interest_rate: interest
            .map(Rate::from_hundredths)
            .transpose()
            .map_err(decode_error)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Escapes `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Repository for campaigns and their approval workflow.
#[derive(Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

impl CampaignRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Lists publicly visible campaigns, newest first.
    pub async fn list_public(&self, filters: &CampaignFilters) -> Result<Vec<Campaign>, CampaignError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns AS c \
             WHERE {PUBLIC_FILTER} \
               AND (? IS NULL OR c.category = ?) \
               AND (? IS NULL OR c.funding_model = ?) \
               AND (? IS NULL OR c.featured = ?) \
             ORDER BY c.created_at DESC, c.id"
        );
        let funding_model = filters.funding_model.map(FundingModel::as_str);
        let rows = sqlx::query(&sql)
            .bind(&filters.category)
            .bind(&filters.category)
            .bind(funding_model)
            .bind(funding_model)
            .bind(filters.featured)
            .bind(filters.featured)
            .fetch_all(&self.pool)
            .await?;
        collect_campaigns(&rows)
    }

    /// Case-insensitive substring search over public campaigns.
    pub async fn search(&self, query: &str) -> Result<Vec<Campaign>, CampaignError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns AS c \
             WHERE {PUBLIC_FILTER} \
               AND (c.title LIKE ?1 ESCAPE '\\' \
                    OR c.description LIKE ?1 ESCAPE '\\' \
                    OR c.category LIKE ?1 ESCAPE '\\') \
             ORDER BY c.created_at DESC, c.id"
        );
        let rows = sqlx::query(&sql)
            .bind(like_pattern(query.trim()))
            .fetch_all(&self.pool)
            .await?;
        collect_campaigns(&rows)
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<Campaign>, CampaignError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns AS c WHERE c.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(campaign_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Loads the campaign together with its creator.
    pub async fn fetch_with_creator(
        &self,
        id: &str,
    ) -> Result<Option<CampaignWithCreator>, CampaignError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS}, {} FROM campaigns AS c \
             INNER JOIN users AS u ON u.id = c.creator_id \
             WHERE c.id = ?",
            users::user_select_list("u", "u_")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CampaignWithCreator {
            campaign: campaign_from_row(&row)?,
            creator: users::user_from_row(&row, "u_")?,
        }))
    }

    /// Creates a campaign awaiting review. Moderation fields always start cleared.
    pub async fn insert(&self, campaign: NewCampaign) -> Result<Campaign, CampaignError> {
        let NewCampaign {
            creator_id,
            details,
            now,
        } = campaign;
        let now = to_rfc3339(now);
        let rewards_json = details
            .rewards
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let sql = format!(
            "INSERT INTO campaigns \
             (id, title, description, short_description, image_url, funding_model, \
              target_amount_minor, current_amount_minor, creator_id, status, featured, approved, \
              end_date, category, rewards_json, equity_percentage_bp, interest_rate_bp, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'pending', 0, 0, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {}",
            bare_columns()
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&details.title)
            .bind(&details.description)
            .bind(&details.short_description)
            .bind(&details.image_url)
            .bind(details.funding_model.as_str())
            .bind(details.target_amount.minor())
            .bind(&creator_id)
            .bind(details.end_date.map(to_rfc3339))
            .bind(&details.category)
            .bind(rewards_json)
            .bind(details.equity_percentage.map(Rate::hundredths))
            .bind(details.interest_rate.map(Rate::hundredths))
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    CampaignError::UnknownCreator
                } else {
                    CampaignError::Database(err)
                }
            })?;
        Ok(campaign_from_row(&row)?)
    }

    pub async fn list_for_creator(&self, creator_id: &str) -> Result<Vec<Campaign>, CampaignError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns AS c \
             WHERE c.creator_id = ? ORDER BY c.created_at DESC, c.id"
        );
        let rows = sqlx::query(&sql)
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;
        collect_campaigns(&rows)
    }

    /// Campaigns waiting for moderation, newest first.
    pub async fn list_pending(&self) -> Result<Vec<Campaign>, CampaignError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns AS c \
             WHERE c.status = 'pending' ORDER BY c.created_at DESC, c.id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        collect_campaigns(&rows)
    }

    /// Publishes a pending campaign.
    pub async fn approve(
        &self,
        id: &str,
        approved_by: &str,
        at: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let at = to_rfc3339(at);
        let sql = format!(
            "UPDATE campaigns \
             SET approved = 1, status = 'active', approved_at = ?, approved_by = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending' \
             RETURNING {}",
            bare_columns()
        );
        let row = sqlx::query(&sql)
            .bind(&at)
            .bind(approved_by)
            .bind(&at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(campaign_from_row(&row)?),
            None => Err(self.transition_error(id).await),
        }
    }

    /// Rejects a pending campaign. It never becomes publicly visible.
    pub async fn reject(
        &self,
        id: &str,
        rejected_by: &str,
        at: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let sql = format!(
            "UPDATE campaigns \
             SET approved = 0, status = 'rejected', approved_by = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending' \
             RETURNING {}",
            bare_columns()
        );
        let row = sqlx::query(&sql)
            .bind(rejected_by)
            .bind(to_rfc3339(at))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(campaign_from_row(&row)?),
            None => Err(self.transition_error(id).await),
        }
    }

    async fn transition_error(&self, id: &str) -> CampaignError {
        match self.fetch(id).await {
            Ok(Some(campaign)) => CampaignError::InvalidTransition {
                status: campaign.status,
            },
            Ok(None) => CampaignError::NotFound,
            Err(err) => err,
        }
    }
}

fn collect_campaigns(rows: &[SqliteRow]) -> Result<Vec<Campaign>, CampaignError> {
    rows.iter()
        .map(|row| campaign_from_row(row).map_err(CampaignError::from))
        .collect()
}

/// Optional listing filters. `None` means "do not filter".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignFilters {
    pub category: Option<String>,
    pub funding_model: Option<FundingModel>,
    pub featured: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub creator_id: String,
    pub details: ValidCampaign,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign not found")]
    NotFound,
    #[error("campaign creator does not exist")]
    UnknownCreator,
    #[error("campaign is {status}, expected pending")]
    InvalidTransition { status: CampaignStatus },
    #[error("failed to encode rewards json: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
