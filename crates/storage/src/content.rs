use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use capigrid_core::types::{CampaignComment, CampaignUpdate, CommentWithUser};

use crate::{is_foreign_key_violation, to_rfc3339, users};

/// Repository for creator-authored campaign updates.
#[derive(Clone)]
pub struct UpdateRepository {
    pool: SqlitePool,
}

impl UpdateRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, update: &NewUpdate) -> Result<CampaignUpdate, UpdateError> {
        let row = sqlx::query(
            "INSERT INTO campaign_updates (id, campaign_id, title, content, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, campaign_id, title, content, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&update.campaign_id)
        .bind(&update.title)
        .bind(&update.content)
        .bind(to_rfc3339(update.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                UpdateError::CampaignNotFound
            } else {
                UpdateError::Database(err)
            }
        })?;
        Ok(update_from_row(&row)?)
    }

    pub async fn list_for_campaign(&self, campaign_id: &str) -> Result<Vec<CampaignUpdate>, UpdateError> {
        let rows = sqlx::query(
            "SELECT id, campaign_id, title, content, created_at FROM campaign_updates \
             WHERE campaign_id = ? ORDER BY created_at DESC, id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| update_from_row(row).map_err(UpdateError::from))
            .collect()
    }
}

fn update_from_row(row: &SqliteRow) -> Result<CampaignUpdate, sqlx::Error> {
    Ok(CampaignUpdate {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewUpdate {
    pub campaign_id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("campaign not found")]
    CampaignNotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for campaign discussion comments.
#[derive(Clone)]
pub struct CommentRepository {
    pool: SqlitePool,
}

impl CommentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, comment: &NewComment) -> Result<CampaignComment, CommentError> {
        let row = sqlx::query(
            "INSERT INTO campaign_comments (id, campaign_id, user_id, content, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, campaign_id, user_id, content, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&comment.campaign_id)
        .bind(&comment.user_id)
        .bind(&comment.content)
        .bind(to_rfc3339(comment.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                CommentError::CampaignNotFound
            } else {
                CommentError::Database(err)
            }
        })?;
        Ok(comment_from_row(&row)?)
    }

    /// Comments with their author (if the account still exists), newest first.
    pub async fn list_for_campaign(&self, campaign_id: &str) -> Result<Vec<CommentWithUser>, CommentError> {
        let sql = format!(
            "SELECT cc.id, cc.campaign_id, cc.user_id, cc.content, cc.created_at, {} \
             FROM campaign_comments AS cc \
             LEFT JOIN users AS u ON u.id = cc.user_id \
             WHERE cc.campaign_id = ? \
             ORDER BY cc.created_at DESC, cc.id",
            users::user_select_list("u", "u_")
        );
        let rows = sqlx::query(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;

        let mut comments = Vec::with_capacity(rows.len());
        for row in &rows {
            let author: Option<String> = row.try_get("u_id")?;
            let user = match author {
                Some(_) => Some(users::user_from_row(row, "u_")?),
                None => None,
            };
            comments.push(CommentWithUser {
                comment: comment_from_row(row)?,
                user,
            });
        }
        Ok(comments)
    }
}

fn comment_from_row(row: &SqliteRow) -> Result<CampaignComment, sqlx::Error> {
    Ok(CampaignComment {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        user_id: row.try_get("user_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub campaign_id: String,
    pub user_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("campaign not found")]
    CampaignNotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{active_campaign, at, insert_user, setup_db};

    #[tokio::test]
    async fn updates_are_listed_newest_first() {
        let db = setup_db().await;
        insert_user(&db, "creator").await;
        let campaign_id = active_campaign(&db, "creator", "Wells").await;
        let repo = db.updates();

        for (title, secs) in [("Drilling started", 10), ("Water found", 20)] {
            repo.insert(&NewUpdate {
                campaign_id: campaign_id.clone(),
                title: title.into(),
                content: "details".into(),
                created_at: at(secs),
            })
            .await
            .expect("insert update");
        }

        let listed = repo.list_for_campaign(&campaign_id).await.expect("list");
        let titles: Vec<_> = listed.iter().map(|u| u.title.as_str()).collect();
        assert_eq!(titles, vec!["Water found", "Drilling started"]);
    }

    #[tokio::test]
    async fn update_for_missing_campaign_is_rejected() {
        let db = setup_db().await;
        let err = db
            .updates()
            .insert(&NewUpdate {
                campaign_id: "missing".into(),
                title: "t".into(),
                content: "c".into(),
                created_at: at(0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::CampaignNotFound));
    }

    #[tokio::test]
    async fn comments_embed_their_author() {
        let db = setup_db().await;
        insert_user(&db, "creator").await;
        insert_user(&db, "fan").await;
        let campaign_id = active_campaign(&db, "creator", "Library").await;
        let repo = db.comments();

        repo.insert(&NewComment {
            campaign_id: campaign_id.clone(),
            user_id: Some("fan".into()),
            content: "Great idea".into(),
            created_at: at(10),
        })
        .await
        .expect("insert comment");
        repo.insert(&NewComment {
            campaign_id: campaign_id.clone(),
            user_id: None,
            content: "Anonymous note".into(),
            created_at: at(20),
        })
        .await
        .expect("insert comment");

        let listed = repo.list_for_campaign(&campaign_id).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].comment.content, "Anonymous note");
        assert!(listed[0].user.is_none());
        let author = listed[1].user.as_ref().expect("author");
        assert_eq!(author.id, "fan");

        let err = repo
            .insert(&NewComment {
                campaign_id: "missing".into(),
                user_id: None,
                content: "x".into(),
                created_at: at(30),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommentError::CampaignNotFound));
    }
}
