use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use tracing::{error, info};

use capigrid_core::{
    types::{
        Campaign, CampaignAnalytics, CampaignUpdate, CampaignWithCreator, CommentWithUser,
        CampaignComment, FundingModel,
    },
    validation::{CampaignInput, CommentInput, UpdateInput},
};
use capigrid_storage::{
    CampaignError, CampaignFilters, CommentError, NewCampaign, NewComment, NewUpdate, UpdateError,
};

use crate::auth::require_user;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub funding_model: Option<String>,
    #[serde(default)]
    pub featured: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Campaign>>, ProblemResponse> {
    let filters = parse_filters(query)?;
    let campaigns = state
        .storage()
        .campaigns()
        .list_public(&filters)
        .await
        .map_err(|err| storage_failure(err, "failed to list campaigns"))?;
    Ok(Json(campaigns))
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Campaign>>, ProblemResponse> {
    let term = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .ok_or_else(|| {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "missing_query", "Search query is required")
        })?;

    let campaigns = state
        .storage()
        .campaigns()
        .search(term)
        .await
        .map_err(|err| storage_failure(err, "failed to search campaigns"))?;
    Ok(Json(campaigns))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CampaignWithCreator>, ProblemResponse> {
    state
        .storage()
        .campaigns()
        .fetch_with_creator(&id)
        .await
        .map_err(|err| storage_failure(err, "failed to load campaign"))?
        .map(Json)
        .ok_or_else(campaign_not_found)
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CampaignInput>,
) -> Result<(StatusCode, Json<Campaign>), ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let now = state.now();
    let details = input.validate(now).map_err(ProblemResponse::validation)?;

    let campaign = state
        .storage()
        .campaigns()
        .insert(NewCampaign {
            creator_id: current.user.id.clone(),
            details,
            now,
        })
        .await
        .map_err(|err| storage_failure(err, "failed to create campaign"))?;

    info!(
        stage = "campaigns",
        campaign_id = %campaign.id,
        creator_id = %campaign.creator_id,
        "campaign submitted for review"
    );
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn list_mine(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Campaign>>, ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let campaigns = state
        .storage()
        .campaigns()
        .list_for_creator(&current.user.id)
        .await
        .map_err(|err| storage_failure(err, "failed to list campaigns"))?;
    Ok(Json(campaigns))
}

pub async fn create_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<UpdateInput>,
) -> Result<(StatusCode, Json<CampaignUpdate>), ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let campaign = load_campaign(&state, &id).await?;
    if campaign.creator_id != current.user.id {
        return Err(ProblemResponse::forbidden(
            "Only the campaign creator can post updates",
        ));
    }
    let valid = input.validate().map_err(ProblemResponse::validation)?;

    let update = state
        .storage()
        .updates()
        .insert(&NewUpdate {
            campaign_id: campaign.id,
            title: valid.title,
            content: valid.content,
            created_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            UpdateError::CampaignNotFound => campaign_not_found(),
            UpdateError::Database(err) => {
                error!(stage = "campaigns", error = %err, "failed to store update");
                ProblemResponse::internal("failed to store update")
            }
        })?;
    Ok((StatusCode::CREATED, Json(update)))
}

pub async fn list_updates(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CampaignUpdate>>, ProblemResponse> {
    let updates = state
        .storage()
        .updates()
        .list_for_campaign(&id)
        .await
        .map_err(|err| {
            error!(stage = "campaigns", error = %err, "failed to list updates");
            ProblemResponse::internal("failed to list updates")
        })?;
    Ok(Json(updates))
}

pub async fn create_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<CommentInput>,
) -> Result<(StatusCode, Json<CampaignComment>), ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let content = input.validate().map_err(ProblemResponse::validation)?;

    let comment = state
        .storage()
        .comments()
        .insert(&NewComment {
            campaign_id: id,
            user_id: Some(current.user.id),
            content,
            created_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            CommentError::CampaignNotFound => campaign_not_found(),
            CommentError::Database(err) => {
                error!(stage = "campaigns", error = %err, "failed to store comment");
                ProblemResponse::internal("failed to store comment")
            }
        })?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CommentWithUser>>, ProblemResponse> {
    let comments = state
        .storage()
        .comments()
        .list_for_campaign(&id)
        .await
        .map_err(|err| {
            error!(stage = "campaigns", error = %err, "failed to list comments");
            ProblemResponse::internal("failed to list comments")
        })?;
    Ok(Json(comments))
}

/// Funding analytics, visible to the campaign creator and platform admins.
pub async fn analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CampaignAnalytics>, ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let campaign = load_campaign(&state, &id).await?;
    if campaign.creator_id != current.user.id && !current.user.is_admin() {
        return Err(ProblemResponse::forbidden(
            "Only the campaign creator or an admin can view analytics",
        ));
    }

    let analytics = state
        .storage()
        .analytics()
        .campaign_analytics(&campaign.id)
        .await
        .map_err(|err| {
            error!(stage = "campaigns", campaign_id = %campaign.id, error = %err, "failed to compute analytics");
            ProblemResponse::internal("failed to compute analytics")
        })?;
    Ok(Json(analytics))
}

async fn load_campaign(state: &AppState, id: &str) -> Result<Campaign, ProblemResponse> {
    state
        .storage()
        .campaigns()
        .fetch(id)
        .await
        .map_err(|err| storage_failure(err, "failed to load campaign"))?
        .ok_or_else(campaign_not_found)
}

fn parse_filters(query: ListQuery) -> Result<CampaignFilters, ProblemResponse> {
    let funding_model = match query.funding_model.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<FundingModel>().map_err(|err| {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_filter", err.to_string())
        })?),
    };
    let featured = match query.featured.as_deref().map(str::trim) {
        None | Some("") => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(_) => {
            return Err(ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_filter",
                "featured must be true or false",
            ))
        }
    };
    Ok(CampaignFilters {
        category: query
            .category
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        funding_model,
        featured,
    })
}

pub(crate) fn campaign_not_found() -> ProblemResponse {
    ProblemResponse::not_found("campaign_not_found", "Campaign not found")
}

fn storage_failure(err: CampaignError, detail: &'static str) -> ProblemResponse {
    match err {
        CampaignError::NotFound => campaign_not_found(),
        other => {
            error!(stage = "campaigns", error = %other, "{detail}");
            ProblemResponse::internal(detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    use capigrid_core::{
        types::{ContributionStatus, PaymentMethod, UserRole},
        Amount,
    };
    use capigrid_storage::NewContribution;

    use crate::router::test_support::{get, post_json, send, TestContext};

    #[tokio::test]
    async fn public_listing_hides_unapproved_and_applies_filters() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let visible = context.active_campaign("creator", "Solar pumps").await;
        context.campaign("creator", "Still pending").await;

        let (status, _, body) = send(context.router(), get("/api/campaigns", None)).await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().expect("array");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], visible.id.as_str());
        assert_eq!(listed[0]["targetAmount"], "10000.00");
        assert_eq!(listed[0]["currentAmount"], "0.00");

        let (_, _, body) = send(
            context.router(),
            get("/api/campaigns?fundingModel=equity", None),
        )
        .await;
        assert!(body.as_array().unwrap().is_empty());

        let (_, _, body) = send(
            context.router(),
            get("/api/campaigns?category=community&featured=false", None),
        )
        .await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _, body) = send(
            context.router(),
            get("/api/campaigns?featured=maybe", None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_filter");
    }

    #[tokio::test]
    async fn search_requires_a_query() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        context.active_campaign("creator", "Clean water for Kano").await;

        let (status, _, _) = send(context.router(), get("/api/campaigns/search?q=%20", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = send(context.router(), get("/api/campaigns/search?q=WATER", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detail_embeds_creator() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let campaign = context.campaign("creator", "Library").await;

        let (status, _, body) = send(
            context.router(),
            get(&format!("/api/campaigns/{}", campaign.id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Library");
        assert_eq!(body["creator"]["id"], "creator");

        let (status, _, body) = send(context.router(), get("/api/campaigns/missing", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "campaign_not_found");
    }

    #[tokio::test]
    async fn create_requires_login_and_ignores_moderation_fields() {
        let context = TestContext::new().await;
        let payload = json!({
            "title": "  Community garden ",
            "description": "Raised beds for the block",
            "fundingModel": "donation",
            "targetAmount": "2500.50",
            "status": "active",
            "approved": true,
            "featured": true,
            "currentAmount": "999.00",
            "creatorId": "someone-else"
        });

        let (status, _, _) = send(
            context.router(),
            post_json("/api/campaigns", None, payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let cookie = context.user_cookie("maker").await;
        let (status, _, body) = send(
            context.router(),
            post_json("/api/campaigns", Some(&cookie), payload),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["title"], "Community garden");
        assert_eq!(body["status"], "pending");
        assert_eq!(body["approved"], false);
        assert_eq!(body["featured"], false);
        assert_eq!(body["currentAmount"], "0.00");
        assert_eq!(body["targetAmount"], "2500.50");
        assert_eq!(body["creatorId"], "maker");

        let (status, _, body) = send(context.router(), get("/api/users/campaigns", Some(&cookie))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_reports_every_invalid_field() {
        let context = TestContext::new().await;
        let cookie = context.user_cookie("maker").await;

        let (status, headers, body) = send(
            context.router(),
            post_json(
                "/api/campaigns",
                Some(&cookie),
                json!({ "title": "", "fundingModel": "lottery", "targetAmount": "-5" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/problem+json"
        );
        let paths: Vec<&str> = body["errors"]
            .as_array()
            .expect("errors")
            .iter()
            .filter_map(|e| e["path"].as_str())
            .collect();
        for expected in ["title", "description", "fundingModel", "targetAmount"] {
            assert!(paths.contains(&expected), "missing {expected} in {paths:?}");
        }
    }

    #[tokio::test]
    async fn only_creator_posts_updates() {
        let context = TestContext::new().await;
        let owner = context.user_cookie("owner").await;
        let stranger = context.user_cookie("stranger").await;
        let campaign = context.active_campaign("owner", "Bridge").await;
        let uri = format!("/api/campaigns/{}/updates", campaign.id);
        let payload = json!({ "title": "Week 1", "content": "Foundations poured" });

        let (status, _, _) = send(context.router(), post_json(&uri, Some(&stranger), payload.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, _) = send(
            context.router(),
            post_json("/api/campaigns/missing/updates", Some(&owner), payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = send(context.router(), post_json(&uri, Some(&owner), payload)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["campaignId"], campaign.id.as_str());

        let (status, _, body) = send(context.router(), get(&uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["title"], "Week 1");
    }

    #[tokio::test]
    async fn comments_are_listed_with_author() {
        let context = TestContext::new().await;
        context.user("owner", UserRole::User).await;
        let fan = context.user_cookie("fan").await;
        let campaign = context.active_campaign("owner", "Clinic").await;
        let uri = format!("/api/campaigns/{}/comments", campaign.id);

        let (status, _, _) = send(
            context.router(),
            post_json(&uri, None, json!({ "content": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, body) = send(
            context.router(),
            post_json(&uri, Some(&fan), json!({ "content": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["path"], "content");

        let (status, _, _) = send(
            context.router(),
            post_json(&uri, Some(&fan), json!({ "content": "Count me in" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _, _) = send(
            context.router(),
            post_json("/api/campaigns/missing/comments", Some(&fan), json!({ "content": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, _, body) = send(context.router(), get(&uri, None)).await;
        assert_eq!(body[0]["content"], "Count me in");
        assert_eq!(body[0]["user"]["id"], "fan");
    }

    #[tokio::test]
    async fn analytics_visible_to_creator_and_admin_only() {
        let context = TestContext::new().await;
        let owner = context.user_cookie("owner").await;
        let stranger = context.user_cookie("stranger").await;
        context.user("boss", UserRole::Admin).await;
        let boss = context.sign_in("boss", Duration::hours(1), None).await;
        let campaign = context.active_campaign("owner", "Farm").await;

        context
            .database
            .contributions()
            .record(NewContribution {
                campaign_id: campaign.id.clone(),
                contributor_id: Some("stranger".into()),
                amount: Amount::from_minor(12_345).unwrap(),
                payment_method: PaymentMethod::BankTransfer,
                payment_id: None,
                contributor_email: None,
                contributor_name: None,
                anonymous: false,
                reward_tier: None,
                status: ContributionStatus::Completed,
                created_at: context.now,
            })
            .await
            .expect("record");

        let uri = format!("/api/campaigns/{}/analytics", campaign.id);
        let (status, _, _) = send(context.router(), get(&uri, Some(&stranger))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        for cookie in [&owner, &boss] {
            let (status, _, body) = send(context.router(), get(&uri, Some(cookie))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["totalRaised"], "123.45");
            assert_eq!(body["backersCount"], 1);
            assert_eq!(body["avgContribution"], "123.45");
            assert_eq!(body["dailyContributions"][0]["date"], "2023-11-14");
        }
    }
}
