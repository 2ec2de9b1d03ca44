//! Username/password administrators and the moderation endpoints they use.
//!
//! Admin accounts are separate from OIDC users. A session may carry both an
//! OIDC identity and an admin id at the same time.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use capigrid_core::{
    password::verify_password,
    totp,
    types::{Campaign, PlatformStats},
    validation::AdminLoginInput,
};
use capigrid_storage::{AdminCredential, CampaignError};

use crate::auth::require_user;
use crate::campaigns::campaign_not_found;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::session::{self, SessionData};

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<AdminLoginInput>,
) -> Result<Response, ProblemResponse> {
    let credentials = input.validate().map_err(ProblemResponse::validation)?;

    let admin = state
        .storage()
        .admins()
        .fetch_by_username(&credentials.username)
        .await
        .map_err(|err| {
            error!(stage = "admin", error = %err, "failed to load admin");
            ProblemResponse::internal("failed to load admin")
        })?;
    let Some(admin) = admin.filter(|admin| admin.is_active) else {
        counter!("admin_login_total", "result" => "invalid_credentials").increment(1);
        return Err(invalid_credentials());
    };

    let hash = admin.password_hash.clone();
    let password = credentials.password;
    let password_ok = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
        .await
        .map_err(|err| {
            error!(stage = "admin", error = %err, "password verification task failed");
            ProblemResponse::internal("failed to verify credentials")
        })?;
    if !password_ok {
        warn!(stage = "admin", username = %admin.username, "admin password rejected");
        counter!("admin_login_total", "result" => "invalid_credentials").increment(1);
        return Err(invalid_credentials());
    }

    let now = state.now();
    if let Some(secret) = admin.two_factor_secret.as_deref() {
        let Some(code) = credentials.two_factor_code.as_deref() else {
            counter!("admin_login_total", "result" => "two_factor_required").increment(1);
            return Err(ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "two_factor_required",
                "Two-factor authentication code required",
            ));
        };
        let valid = totp::verify(secret, code, now, totp::DEFAULT_WINDOW).map_err(|err| {
            error!(stage = "admin", username = %admin.username, error = %err, "stored two-factor secret is unusable");
            ProblemResponse::internal("failed to verify two-factor code")
        })?;
        if !valid {
            counter!("admin_login_total", "result" => "invalid_two_factor").increment(1);
            return Err(ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "invalid_two_factor",
                "Invalid two-factor authentication code",
            ));
        }
    }

    if let Err(err) = state.storage().admins().touch_last_login(&admin.id, now).await {
        warn!(stage = "admin", admin_id = %admin.id, error = %err, "failed to record last login");
    }

    // Fresh session id on privilege change; an OIDC sign-in is carried over.
    let previous = session::load(&state, &headers).await?;
    let user = previous.as_ref().and_then(|s| s.data.user.clone());
    if let Some(previous) = previous {
        session::destroy(&state, &previous.sid).await?;
    }
    let created = session::create(
        &state,
        SessionData {
            user,
            admin_id: Some(admin.id.clone()),
        },
    )
    .await?;

    info!(stage = "admin", admin_id = %admin.id, username = %admin.username, "admin signed in");
    counter!("admin_login_total", "result" => "ok").increment(1);

    let body = json!({
        "message": "Login successful",
        "admin": {
            "id": admin.id,
            "username": admin.username,
            "email": admin.email,
        },
    });
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session::set_cookie(&state, &created.sid))],
        Json(body),
    )
        .into_response())
}

/// Drops the admin privilege. The OIDC identity in the same session survives.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ProblemResponse> {
    let body = Json(json!({ "message": "Logout successful" }));
    let Some(mut current) = session::load(&state, &headers).await? else {
        return Ok((StatusCode::OK, body).into_response());
    };

    if current.data.user.is_some() {
        current.data.admin_id = None;
        session::save(&state, &current).await?;
        return Ok((StatusCode::OK, body).into_response());
    }

    session::destroy(&state, &current.sid).await?;
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session::clear_cookie(&state))],
        body,
    )
        .into_response())
}

pub async fn check(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ProblemResponse> {
    let admin = require_admin(&state, &headers).await?;
    Ok(Json(json!({
        "isAdmin": true,
        "admin": {
            "id": admin.id,
            "username": admin.username,
            "email": admin.email,
        },
    })))
}

/// Resolves the signed-in administrator. Unknown or deactivated accounts answer 401.
pub async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AdminCredential, ProblemResponse> {
    let admin_id = session::load(state, headers)
        .await?
        .and_then(|current| current.data.admin_id)
        .ok_or_else(ProblemResponse::unauthorized)?;
    active_admin(state, &admin_id)
        .await?
        .ok_or_else(ProblemResponse::unauthorized)
}

async fn active_admin(state: &AppState, admin_id: &str) -> Result<Option<AdminCredential>, ProblemResponse> {
    let admin = state.storage().admins().fetch(admin_id).await.map_err(|err| {
        error!(stage = "admin", error = %err, "failed to load admin");
        ProblemResponse::internal("failed to load admin")
    })?;
    Ok(admin.filter(|admin| admin.is_active))
}

/// Platform totals, open to an admin session or an OIDC user holding the admin role.
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PlatformStats>, ProblemResponse> {
    let admin_id = session::load(&state, &headers)
        .await?
        .and_then(|current| current.data.admin_id);
    let admin_session = match admin_id {
        Some(admin_id) => active_admin(&state, &admin_id).await?.is_some(),
        None => false,
    };
    if !admin_session {
        let current = require_user(&state, &headers).await?;
        if !current.user.is_admin() {
            return Err(ProblemResponse::forbidden("Admin access required"));
        }
    }

    let stats = state.storage().analytics().platform_stats().await.map_err(|err| {
        error!(stage = "admin", error = %err, "failed to compute platform stats");
        ProblemResponse::internal("failed to compute platform stats")
    })?;
    Ok(Json(stats))
}

pub async fn pending_campaigns(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Campaign>>, ProblemResponse> {
    require_admin(&state, &headers).await?;
    let campaigns = state
        .storage()
        .campaigns()
        .list_pending()
        .await
        .map_err(|err| moderation_problem(err, "failed to list pending campaigns"))?;
    Ok(Json(campaigns))
}

pub async fn approve(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Campaign>, ProblemResponse> {
    let admin = require_admin(&state, &headers).await?;
    let campaign = state
        .storage()
        .campaigns()
        .approve(&campaign_id, &admin.id, state.now())
        .await
        .map_err(|err| moderation_problem(err, "failed to approve campaign"))?;
    info!(stage = "admin", %campaign_id, admin_id = %admin.id, "campaign approved");
    Ok(Json(campaign))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Campaign>, ProblemResponse> {
    let admin = require_admin(&state, &headers).await?;
    let campaign = state
        .storage()
        .campaigns()
        .reject(&campaign_id, &admin.id, state.now())
        .await
        .map_err(|err| moderation_problem(err, "failed to reject campaign"))?;
    info!(stage = "admin", %campaign_id, admin_id = %admin.id, "campaign rejected");
    Ok(Json(campaign))
}

fn moderation_problem(err: CampaignError, detail: &'static str) -> ProblemResponse {
    match err {
        CampaignError::NotFound => campaign_not_found(),
        CampaignError::InvalidTransition { status } => ProblemResponse::new(
            StatusCode::CONFLICT,
            "invalid_transition",
            format!("Campaign is {status}, expected pending"),
        ),
        other => {
            error!(stage = "admin", error = %other, "{detail}");
            ProblemResponse::internal(detail)
        }
    }
}

fn invalid_credentials() -> ProblemResponse {
    ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_credentials", "Invalid credentials")
}
