use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use ulid::Ulid;

use capigrid_core::{
    types::{Contribution, ContributionStatus, PaymentMethod},
    validation::PaymentInitInput,
    Amount, AmountError,
};
use capigrid_gateway::{
    verify_webhook_signature, InitializeRequest, PaystackClient, PaystackError, Transaction,
};
use capigrid_storage::{
    ContributionError, Database, NewContribution, RecordOutcome, SettleContribution, SettleOutcome,
};

use crate::auth::optional_user_id;
use crate::contributions::ledger_problem;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const SIGNATURE_HEADER: &str = "x-paystack-signature";
const CHARGE_SUCCESS: &str = "charge.success";

#[derive(Debug, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Starts a card checkout: records a pending contribution under a fresh
/// reference, then asks Paystack for the hosted payment page.
pub async fn initialize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<PaymentInitInput>,
) -> Result<Json<Value>, ProblemResponse> {
    let paystack = require_paystack(&state)?;
    let valid = input.validate().map_err(ProblemResponse::validation)?;
    let contributor_id = optional_user_id(&state, &headers).await;
    let reference = format!("cg-{}", Ulid::new().to_string().to_lowercase());
    let ledger = state.storage().contributions();

    ledger
        .record(NewContribution {
            campaign_id: valid.campaign_id.clone(),
            contributor_id: contributor_id.clone(),
            amount: valid.amount,
            payment_method: PaymentMethod::Card,
            payment_id: Some(reference.clone()),
            contributor_email: Some(valid.email.clone()),
            contributor_name: valid.name.clone(),
            anonymous: valid.anonymous,
            reward_tier: None,
            status: ContributionStatus::Pending,
            created_at: state.now(),
        })
        .await
        .map_err(|err| {
            counter!("payments_initialize_total", "result" => "rejected").increment(1);
            ledger_problem(err, &valid.campaign_id)
        })?;

    let request = InitializeRequest {
        email: valid.email,
        amount: valid.amount.minor(),
        reference: reference.clone(),
        callback_url: format!("{}/campaigns/{}", state.settings().base_url, valid.campaign_id),
        metadata: json!({
            "campaignId": valid.campaign_id,
            "contributorId": contributor_id,
            "contributorName": valid.name,
            "anonymous": valid.anonymous,
        }),
    };

    match paystack.initialize(&request).await {
        Ok(data) => {
            info!(
                stage = "payments",
                %reference,
                campaign_id = %valid.campaign_id,
                amount = %valid.amount,
                "checkout initialized"
            );
            counter!("payments_initialize_total", "result" => "ok").increment(1);
            Ok(Json(json!({
                "status": true,
                "message": "Authorization URL created",
                "data": data,
            })))
        }
        Err(err) => {
            warn!(stage = "payments", %reference, error = %err, "checkout initialization failed");
            if let Err(mark_err) = ledger.mark_failed(&reference).await {
                error!(stage = "payments", %reference, error = %mark_err, "failed to mark checkout as failed");
            }
            match err {
                PaystackError::Rejected { message } => {
                    counter!("payments_initialize_total", "result" => "gateway_rejected").increment(1);
                    Err(ProblemResponse::new(StatusCode::BAD_REQUEST, "payment_rejected", message))
                }
                PaystackError::Status { .. } => {
                    counter!("payments_initialize_total", "result" => "gateway_rejected").increment(1);
                    Err(ProblemResponse::new(
                        StatusCode::BAD_REQUEST,
                        "payment_rejected",
                        "Payment initialization failed",
                    ))
                }
                PaystackError::Http(_) | PaystackError::Url(_) => {
                    counter!("payments_initialize_total", "result" => "gateway_error").increment(1);
                    Err(gateway_unavailable())
                }
            }
        }
    }
}

/// Confirms a checkout with Paystack and applies it to the ledger.
pub async fn verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    let paystack = require_paystack(&state)?;
    let reference = body
        .reference
        .as_deref()
        .map(str::trim)
        .filter(|reference| !reference.is_empty())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_reference",
                "Payment reference is required",
            )
        })?;

    let transaction = fetch_transaction(paystack, reference).await?;
    if !transaction.is_success() {
        if transaction.is_failed() || transaction.status == "abandoned" {
            if let Err(err) = state.storage().contributions().mark_failed(reference).await {
                error!(stage = "payments", %reference, error = %err, "failed to mark contribution as failed");
            }
        }
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "payment_verification_failed",
            format!("Payment verification failed: status {}", transaction.status),
        ));
    }

    let contribution = apply_successful_charge(state.storage(), &transaction, state.now(), "verify")
        .await
        .map_err(|err| match err {
            SettlementError::Ledger(err) => {
                let campaign_id = transaction.checkout_metadata().campaign_id.unwrap_or_default();
                ledger_problem(err, &campaign_id)
            }
            other => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "payment_verification_failed",
                other.to_string(),
            ),
        })?;

    Ok(Json(json!({
        "contribution": contribution,
        "payment": transaction,
    })))
}

/// Paystack webhook. Only a storage failure is answered with 5xx so the
/// gateway retries; payloads that can never apply are logged and acknowledged.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProblemResponse> {
    let start = Instant::now();
    let paystack = require_paystack(&state)?;

    let signature_ok = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|signature| verify_webhook_signature(paystack.secret_key(), &body, signature));
    if !signature_ok {
        counter!("paystack_invalid_signature_total").increment(1);
        histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
        warn!(stage = "payments", "rejected webhook with invalid signature");
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "signature verification failed",
        ));
    }

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|err| {
        histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    let label = if event.event == CHARGE_SUCCESS { CHARGE_SUCCESS } else { "other" };
    counter!("paystack_webhook_total", "event" => label).increment(1);

    if event.event != CHARGE_SUCCESS {
        info!(stage = "payments", event = %event.event, "webhook event acknowledged");
        histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
        return Ok(StatusCode::OK);
    }

    let transaction: Transaction = serde_json::from_value(event.data).map_err(|err| {
        histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            format!("charge payload is malformed: {err}"),
        )
    })?;

    let result = apply_successful_charge(state.storage(), &transaction, state.now(), "webhook").await;
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    match result {
        Ok(_) => Ok(StatusCode::OK),
        Err(err) if err.is_permanent() => {
            error!(
                stage = "payments",
                reference = %transaction.reference,
                error = %err,
                "captured charge could not be applied to the ledger"
            );
            Ok(StatusCode::OK)
        }
        Err(err) => {
            error!(stage = "payments", reference = %transaction.reference, error = %err, "failed to apply charge");
            Err(ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "failed to apply charge",
            ))
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("transaction amount is invalid: {0}")]
    Amount(#[from] AmountError),
    #[error("transaction amount must be positive")]
    ZeroAmount,
    #[error("transaction metadata does not name a campaign")]
    MissingCampaign,
    #[error(transparent)]
    Ledger(#[from] ContributionError),
}

impl SettlementError {
    /// `true` when retrying the same charge can never succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Ledger(ContributionError::Database(_)))
    }
}

/// Applies a charge Paystack reported as successful.
///
/// A pending (or failed) contribution with the same reference is settled at
/// the confirmed amount. A reference never seen before is recorded as a new
/// completed contribution using the campaign named in the checkout metadata.
pub async fn apply_successful_charge(
    database: &Database,
    transaction: &Transaction,
    now: DateTime<Utc>,
    source: &'static str,
) -> Result<Contribution, SettlementError> {
    let amount = Amount::from_minor(transaction.amount)?;
    if amount == Amount::ZERO {
        return Err(SettlementError::ZeroAmount);
    }
    let reference = transaction.reference.as_str();
    let ledger = database.contributions();

    if let Some(existing) = ledger.fetch_by_payment_id(reference).await? {
        if existing.status == ContributionStatus::Pending && existing.amount != amount {
            warn!(
                stage = "ledger",
                %reference,
                requested = %existing.amount,
                confirmed = %amount,
                "confirmed amount differs from checkout amount"
            );
        }
    }

    let settled = ledger
        .settle(SettleContribution {
            payment_id: reference.to_string(),
            confirmed_amount: amount,
            settled_at: now,
        })
        .await?;

    match settled {
        SettleOutcome::Settled {
            contribution,
            campaign_total,
        } => {
            info!(
                stage = "ledger",
                %reference,
                %source,
                campaign_id = %contribution.campaign_id,
                amount = %contribution.amount,
                campaign_total = %campaign_total,
                "payment settled"
            );
            counter!("ledger_settlements_total", "source" => source, "outcome" => "settled").increment(1);
            Ok(contribution)
        }
        SettleOutcome::AlreadySettled(contribution) => {
            info!(stage = "ledger", %reference, %source, "payment already settled");
            counter!("ledger_settlements_total", "source" => source, "outcome" => "already_settled")
                .increment(1);
            Ok(contribution)
        }
        SettleOutcome::NotFound => {
            let metadata = transaction.checkout_metadata();
            let campaign_id = metadata.campaign_id.ok_or(SettlementError::MissingCampaign)?;
            let outcome = ledger
                .record(NewContribution {
                    campaign_id,
                    contributor_id: metadata.contributor_id,
                    amount,
                    payment_method: PaymentMethod::Card,
                    payment_id: Some(reference.to_string()),
                    contributor_email: transaction
                        .customer
                        .as_ref()
                        .and_then(|customer| customer.email.clone()),
                    contributor_name: metadata.contributor_name,
                    anonymous: metadata.anonymous,
                    reward_tier: None,
                    status: ContributionStatus::Completed,
                    created_at: now,
                })
                .await?;
            let label = match &outcome {
                RecordOutcome::Recorded { campaign_total, contribution } => {
                    info!(
                        stage = "ledger",
                        %reference,
                        %source,
                        campaign_id = %contribution.campaign_id,
                        campaign_total = %campaign_total,
                        "unknown reference recorded as completed contribution"
                    );
                    "recorded"
                }
                RecordOutcome::Duplicate(_) => "duplicate",
            };
            counter!("ledger_settlements_total", "source" => source, "outcome" => label).increment(1);
            Ok(outcome.contribution().clone())
        }
    }
}

async fn fetch_transaction(paystack: &PaystackClient, reference: &str) -> Result<Transaction, ProblemResponse> {
    paystack.verify(reference).await.map_err(|err| {
        warn!(stage = "payments", %reference, error = %err, "transaction lookup failed");
        match err {
            PaystackError::Rejected { .. } | PaystackError::Status { .. } => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "payment_verification_failed",
                "Payment verification failed",
            ),
            PaystackError::Http(_) | PaystackError::Url(_) => gateway_unavailable(),
        }
    })
}

fn require_paystack(state: &AppState) -> Result<&PaystackClient, ProblemResponse> {
    state.paystack().ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "payments_unavailable",
            "Payment service not configured",
        )
    })
}

fn gateway_unavailable() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::BAD_GATEWAY,
        "payment_gateway_unavailable",
        "Payment gateway could not be reached",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use hmac::{Hmac, Mac};
    use httpmock::prelude::*;
    use sha2::Sha512;

    use capigrid_core::types::{Campaign, UserRole};

    use crate::router::test_support::{post_json, send, TestContext};

    fn sign(body: &str) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(b"sk_test").expect("mac");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn webhook_request(body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn charge_event(reference: &str, amount: i64, campaign_id: &str) -> String {
        json!({
            "event": "charge.success",
            "data": {
                "reference": reference,
                "status": "success",
                "amount": amount,
                "currency": "NGN",
                "customer": { "email": "payer@example.com" },
                "metadata": { "campaignId": campaign_id }
            }
        })
        .to_string()
    }

    async fn setup(server: &MockServer) -> (TestContext, Campaign) {
        let context = TestContext::new().await.with_paystack(server);
        context.user("creator", UserRole::User).await;
        let campaign = context.active_campaign("creator", "Borehole").await;
        (context, campaign)
    }

    async fn pending(context: &TestContext, campaign: &Campaign, reference: &str, minor: i64) {
        context
            .database
            .contributions()
            .record(NewContribution {
                campaign_id: campaign.id.clone(),
                contributor_id: None,
                amount: Amount::from_minor(minor).unwrap(),
                payment_method: PaymentMethod::Card,
                payment_id: Some(reference.into()),
                contributor_email: Some("payer@example.com".into()),
                contributor_name: None,
                anonymous: false,
                reward_tier: None,
                status: ContributionStatus::Pending,
                created_at: context.now,
            })
            .await
            .expect("pending");
    }

    async fn balance(context: &TestContext, campaign: &Campaign) -> i64 {
        context
            .database
            .campaigns()
            .fetch(&campaign.id)
            .await
            .unwrap()
            .unwrap()
            .current_amount
            .minor()
    }

    #[tokio::test]
    async fn payments_are_unavailable_without_paystack() {
        let context = TestContext::new().await;
        let (status, _, body) = send(
            context.router(),
            post_json("/api/payments/verify", None, json!({ "reference": "r" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"], "Payment service not configured");
    }

    #[tokio::test]
    async fn initialize_records_pending_checkout() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        let callback = format!("http://localhost:5000/campaigns/{}", campaign.id);
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/transaction/initialize")
                    .body_contains("\"amount\":150000")
                    .body_contains(&callback)
                    .body_contains(&campaign.id);
                then.status(200).json_body(json!({
                    "status": true,
                    "message": "Authorization URL created",
                    "data": {
                        "authorization_url": "https://checkout.paystack.com/xyz",
                        "access_code": "xyz",
                        "reference": "echo"
                    }
                }));
            })
            .await;

        let (status, _, body) = send(
            context.router(),
            post_json(
                "/api/payments/initialize",
                None,
                json!({ "amount": "1500", "email": "payer@example.com", "campaignId": campaign.id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        mock.assert_async().await;
        assert_eq!(body["status"], true);
        assert_eq!(body["data"]["authorization_url"], "https://checkout.paystack.com/xyz");

        let stored = context
            .database
            .contributions()
            .list_for_campaign(&campaign.id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ContributionStatus::Pending);
        assert_eq!(stored[0].payment_method, PaymentMethod::Card);
        assert!(stored[0].payment_id.as_deref().unwrap().starts_with("cg-"));
        assert_eq!(balance(&context, &campaign).await, 0);
    }

    #[tokio::test]
    async fn rejected_initialize_marks_checkout_failed() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/transaction/initialize");
                then.status(200)
                    .json_body(json!({ "status": false, "message": "Invalid Email Address Passed" }));
            })
            .await;

        let (status, _, body) = send(
            context.router(),
            post_json(
                "/api/payments/initialize",
                None,
                json!({ "amount": 20, "email": "payer@example.com", "campaignId": campaign.id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Invalid Email Address Passed");

        let stored = context
            .database
            .contributions()
            .list_for_campaign(&campaign.id)
            .await
            .unwrap();
        assert_eq!(stored[0].status, ContributionStatus::Failed);
    }

    #[tokio::test]
    async fn initialize_validates_and_checks_campaign() {
        let server = MockServer::start_async().await;
        let (context, _) = setup(&server).await;

        let (status, _, body) = send(
            context.router(),
            post_json("/api/payments/initialize", None, json!({ "amount": "5" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"].as_array().unwrap().len() >= 2);

        let (status, _, _) = send(
            context.router(),
            post_json(
                "/api/payments/initialize",
                None,
                json!({ "amount": "5", "email": "payer@example.com", "campaignId": "missing" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn verify_settles_pending_checkout_once() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        pending(&context, &campaign, "ref-1", 5_000).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transaction/verify/ref-1");
                then.status(200).json_body(json!({
                    "status": true,
                    "message": "Verification successful",
                    "data": {
                        "reference": "ref-1",
                        "status": "success",
                        "amount": 5000,
                        "metadata": { "campaignId": campaign.id }
                    }
                }));
            })
            .await;

        for _ in 0..2 {
            let (status, _, body) = send(
                context.router(),
                post_json("/api/payments/verify", None, json!({ "reference": "ref-1" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["contribution"]["status"], "completed");
            assert_eq!(body["contribution"]["amount"], "50.00");
            assert_eq!(body["payment"]["reference"], "ref-1");
        }
        assert_eq!(balance(&context, &campaign).await, 5_000);
    }

    #[tokio::test]
    async fn verify_records_unknown_reference_from_metadata() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transaction/verify/walk-in");
                then.status(200).json_body(json!({
                    "status": true,
                    "message": "Verification successful",
                    "data": {
                        "reference": "walk-in",
                        "status": "success",
                        "amount": 12_000,
                        "customer": { "email": "walkin@example.com" },
                        "metadata": { "campaignId": campaign.id }
                    }
                }));
            })
            .await;

        let (status, _, body) = send(
            context.router(),
            post_json("/api/payments/verify", None, json!({ "reference": "walk-in" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contribution"]["paymentMethod"], "card");
        assert_eq!(body["contribution"]["contributorEmail"], "walkin@example.com");
        assert_eq!(balance(&context, &campaign).await, 12_000);
    }

    #[tokio::test]
    async fn verify_failed_charge_marks_checkout_failed() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        pending(&context, &campaign, "ref-f", 900).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transaction/verify/ref-f");
                then.status(200).json_body(json!({
                    "status": true,
                    "message": "Verification successful",
                    "data": { "reference": "ref-f", "status": "failed", "amount": 900 }
                }));
            })
            .await;

        let (status, _, body) = send(
            context.router(),
            post_json("/api/payments/verify", None, json!({ "reference": "ref-f" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "payment_verification_failed");
        let stored = context
            .database
            .contributions()
            .fetch_by_payment_id("ref-f")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ContributionStatus::Failed);

        let (status, _, _) = send(
            context.router(),
            post_json("/api/payments/verify", None, json!({ "reference": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        let body = charge_event("ref-w", 1_000, &campaign.id);

        let (status, _, _) = send(context.router(), webhook_request(&body, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = send(context.router(), webhook_request(&body, Some("deadbeef"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(balance(&context, &campaign).await, 0);
    }

    #[tokio::test]
    async fn webhook_retries_are_counted_once() {
        let server = MockServer::start_async().await;
        let (context, campaign) = setup(&server).await;
        pending(&context, &campaign, "ref-w", 1_000).await;
        let body = charge_event("ref-w", 1_000, &campaign.id);
        let signature = sign(&body);

        for _ in 0..3 {
            let (status, _, _) = send(context.router(), webhook_request(&body, Some(&signature))).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(balance(&context, &campaign).await, 1_000);

        let other = json!({ "event": "transfer.success", "data": {} }).to_string();
        let (status, _, _) = send(context.router(), webhook_request(&other, Some(&sign(&other)))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_for_unknown_campaign_is_acknowledged() {
        let server = MockServer::start_async().await;
        let (context, _) = setup(&server).await;
        let body = charge_event("ref-lost", 1_000, "no-such-campaign");

        let (status, _, _) = send(context.router(), webhook_request(&body, Some(&sign(&body)))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(context
            .database
            .contributions()
            .fetch_by_payment_id("ref-lost")
            .await
            .unwrap()
            .is_none());
    }
}
