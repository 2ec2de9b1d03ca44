use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use metrics::counter;
use tracing::{error, info};

use capigrid_core::{types::Contribution, validation::ContributionInput};
use capigrid_storage::{ContributionError, NewContribution, RecordOutcome};

use crate::auth::{optional_user_id, require_user};
use crate::campaigns::campaign_not_found;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Records a crypto or bank-transfer contribution reported by the client.
///
/// `paymentId` is the idempotency key: repeating a request returns the stored
/// contribution with 200 instead of counting it again. Only the original
/// backer sees the full row on a repeat; anyone else gets the public view.
pub async fn contribute(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<ContributionInput>,
) -> Result<(StatusCode, Json<Contribution>), ProblemResponse> {
    let valid = input.validate().map_err(ProblemResponse::validation)?;
    let contributor_id = optional_user_id(&state, &headers).await;
    let caller_id = contributor_id.clone();
    let method = valid.payment_method.as_str();

    let outcome = state
        .storage()
        .contributions()
        .record(NewContribution {
            campaign_id: campaign_id.clone(),
            contributor_id,
            amount: valid.amount,
            payment_method: valid.payment_method,
            payment_id: valid.payment_id,
            contributor_email: valid.contributor_email,
            contributor_name: valid.contributor_name,
            anonymous: valid.anonymous,
            reward_tier: valid.reward_tier,
            status: valid.status,
            created_at: state.now(),
        })
        .await
        .map_err(|err| {
            counter!("contributions_recorded_total", "method" => method, "outcome" => "rejected")
                .increment(1);
            ledger_problem(err, &campaign_id)
        })?;

    match outcome {
        RecordOutcome::Recorded {
            contribution,
            campaign_total,
        } => {
            info!(
                stage = "ledger",
                campaign_id = %contribution.campaign_id,
                contribution_id = %contribution.id,
                amount = %contribution.amount,
                status = %contribution.status,
                campaign_total = %campaign_total,
                "contribution recorded"
            );
            counter!("contributions_recorded_total", "method" => method, "outcome" => "recorded")
                .increment(1);
            Ok((StatusCode::CREATED, Json(contribution)))
        }
        RecordOutcome::Duplicate(contribution) => {
            if contribution.campaign_id != campaign_id {
                counter!("contributions_recorded_total", "method" => method, "outcome" => "conflict")
                    .increment(1);
                return Err(ProblemResponse::new(
                    StatusCode::CONFLICT,
                    "duplicate_payment_id",
                    "Payment id is already recorded for another campaign",
                ));
            }
            info!(
                stage = "ledger",
                campaign_id = %contribution.campaign_id,
                contribution_id = %contribution.id,
                "duplicate payment id, returning stored contribution"
            );
            counter!("contributions_recorded_total", "method" => method, "outcome" => "duplicate")
                .increment(1);
            let owner = caller_id.is_some() && caller_id == contribution.contributor_id;
            let body = if owner {
                contribution
            } else {
                contribution.public_view()
            };
            Ok((StatusCode::OK, Json(body)))
        }
    }
}

pub async fn list_for_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<Vec<Contribution>>, ProblemResponse> {
    let contributions = state
        .storage()
        .contributions()
        .list_for_campaign(&campaign_id)
        .await
        .map_err(|err| ledger_problem(err, &campaign_id))?;
    Ok(Json(contributions.iter().map(Contribution::public_view).collect()))
}

pub async fn list_mine(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Contribution>>, ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    let contributions = state
        .storage()
        .contributions()
        .list_for_contributor(&current.user.id)
        .await
        .map_err(|err| {
            error!(stage = "ledger", error = %err, "failed to list contributions");
            ProblemResponse::internal("failed to list contributions")
        })?;
    Ok(Json(contributions))
}

/// Maps ledger errors to responses; unexpected ones are logged.
pub(crate) fn ledger_problem(err: ContributionError, campaign_id: &str) -> ProblemResponse {
    match err {
        ContributionError::CampaignNotFound => campaign_not_found(),
        ContributionError::CampaignNotAccepting => ProblemResponse::new(
            StatusCode::CONFLICT,
            "campaign_not_accepting",
            "Campaign is not accepting contributions",
        ),
        ContributionError::BalanceOverflow => ProblemResponse::new(
            StatusCode::CONFLICT,
            "balance_overflow",
            "Contribution would exceed the maximum campaign balance",
        ),
        other => {
            error!(stage = "ledger", %campaign_id, error = %other, "ledger operation failed");
            ProblemResponse::internal("failed to record contribution")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use capigrid_core::types::UserRole;

    use crate::router::test_support::{get, post_json, send, TestContext};

    #[tokio::test]
    async fn contribution_increments_balance_once_per_payment_id() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let backer = context.user_cookie("backer").await;
        let campaign = context.active_campaign("creator", "Well").await;
        let uri = format!("/api/campaigns/{}/contribute", campaign.id);
        let payload = json!({
            "amount": "25.50",
            "paymentMethod": "crypto",
            "paymentId": "0xabc",
            "contributorEmail": "backer@example.com"
        });

        let (status, _, first) = send(context.router(), post_json(&uri, Some(&backer), payload.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["amount"], "25.50");
        assert_eq!(first["status"], "completed");
        assert_eq!(first["contributorId"], "backer");

        let (status, _, second) = send(context.router(), post_json(&uri, Some(&backer), payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["id"], first["id"]);

        let stored = context
            .database
            .campaigns()
            .fetch(&campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.current_amount.minor(), 2_550);
    }

    #[tokio::test]
    async fn contribution_errors_map_to_statuses() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let pending = context.campaign("creator", "Not yet approved").await;
        let payload = json!({ "amount": 10, "paymentMethod": "bank_transfer" });

        let (status, _, _) = send(
            context.router(),
            post_json("/api/campaigns/missing/contribute", None, payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = send(
            context.router(),
            post_json(&format!("/api/campaigns/{}/contribute", pending.id), None, payload),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "campaign_not_accepting");

        let (status, _, body) = send(
            context.router(),
            post_json(
                &format!("/api/campaigns/{}/contribute", pending.id),
                None,
                json!({ "amount": "0", "paymentMethod": "card" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn public_listing_hides_emails_and_anonymous_backers() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let backer = context.user_cookie("backer").await;
        let campaign = context.active_campaign("creator", "Park").await;
        let uri = format!("/api/campaigns/{}/contribute", campaign.id);

        send(
            context.router(),
            post_json(
                &uri,
                Some(&backer),
                json!({
                    "amount": "5.00",
                    "paymentMethod": "crypto",
                    "paymentId": "a",
                    "contributorEmail": "backer@example.com",
                    "contributorName": "Backer",
                    "anonymous": true
                }),
            ),
        )
        .await;
        send(
            context.router(),
            post_json(
                &uri,
                None,
                json!({
                    "amount": "7.00",
                    "paymentMethod": "bank_transfer",
                    "paymentId": "b",
                    "contributorEmail": "named@example.com",
                    "contributorName": "Named"
                }),
            ),
        )
        .await;

        let (status, _, body) = send(
            context.router(),
            get(&format!("/api/campaigns/{}/contributions", campaign.id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        for entry in listed {
            assert!(entry["contributorEmail"].is_null());
        }
        let anonymous = listed.iter().find(|c| c["amount"] == "5.00").unwrap();
        assert!(anonymous["contributorName"].is_null());
        assert!(anonymous["contributorId"].is_null());
        assert!(anonymous["paymentId"].is_null());
        let named = listed.iter().find(|c| c["amount"] == "7.00").unwrap();
        assert_eq!(named["contributorName"], "Named");

        let (status, _, body) = send(context.router(), get("/api/users/contributions", Some(&backer))).await;
        assert_eq!(status, StatusCode::OK);
        let mine = body.as_array().unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["contributorEmail"], "backer@example.com");
    }

    #[tokio::test]
    async fn repeated_payment_id_reveals_nothing_to_strangers() {
        let context = TestContext::new().await;
        context.user("creator", UserRole::User).await;
        let backer = context.user_cookie("backer").await;
        let campaign = context.active_campaign("creator", "Library").await;
        let other = context.active_campaign("creator", "Bridge").await;
        let uri = format!("/api/campaigns/{}/contribute", campaign.id);

        let (status, _, _) = send(
            context.router(),
            post_json(
                &uri,
                Some(&backer),
                json!({
                    "amount": "12.00",
                    "paymentMethod": "crypto",
                    "paymentId": "secret-tx",
                    "contributorEmail": "hidden@example.com",
                    "contributorName": "Hidden",
                    "anonymous": true
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let replay = json!({ "amount": "1", "paymentMethod": "crypto", "paymentId": "secret-tx" });
        let (status, _, body) = send(context.router(), post_json(&uri, None, replay.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["contributorEmail"].is_null());
        assert!(body["contributorName"].is_null());
        assert!(body["contributorId"].is_null());
        assert!(body["paymentId"].is_null());

        let (status, _, body) = send(
            context.router(),
            post_json(&format!("/api/campaigns/{}/contribute", other.id), None, replay),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "duplicate_payment_id");

        let (status, _, body) = send(
            context.router(),
            post_json(
                &uri,
                Some(&backer),
                json!({ "amount": "12.00", "paymentMethod": "crypto", "paymentId": "secret-tx" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contributorEmail"], "hidden@example.com");

        for id in [&campaign.id, &other.id] {
            let stored = context.database.campaigns().fetch(id).await.unwrap().unwrap();
            let expected = if *id == campaign.id { 1_200 } else { 0 };
            assert_eq!(stored.current_amount.minor(), expected);
        }
    }
}
