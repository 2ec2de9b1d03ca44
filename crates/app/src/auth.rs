use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Duration;
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use ulid::Ulid;
use url::form_urlencoded;

use capigrid_core::types::User;
use capigrid_gateway::{AuthorizeUrlParams, IdTokenClaims, OidcError};
use capigrid_storage::{NewLoginState, NewUser, UserError};

use crate::problem::ProblemResponse;
use crate::router::{AppState, OidcLogin};
use crate::session::{self, OidcIdentity, Session, SessionData};

const OIDC_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];
const LOGIN_STATE_TTL_MINUTES: i64 = 10;
const ERROR_REDIRECT_PATH: &str = "/login-error";
const CODE_VERIFIER_LEN: usize = 64;
const NONCE_LEN: usize = 32;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Signed-in platform user together with the session that carries them.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub session: Session,
    pub user: User,
}

pub async fn login(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let oidc = require_oidc(&state)?;
    let now = state.now();

    let state_value = Ulid::new().to_string();
    let nonce = random_token(NONCE_LEN);
    let code_verifier = random_token(CODE_VERIFIER_LEN);
    let code_challenge = compute_code_challenge(&code_verifier);

    let authorize_url = oidc
        .client
        .authorize_url(&AuthorizeUrlParams {
            state: &state_value,
            nonce: &nonce,
            redirect_uri: &oidc.callback_url,
            code_challenge: &code_challenge,
            scopes: OIDC_SCOPES,
            prompt: Some("login"),
            connection: oidc.connection.as_deref(),
        })
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to build authorize url");
            counter!("oidc_login_total", "result" => "discovery_failed").increment(1);
            ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "identity_provider_unavailable",
                "failed to reach the identity provider",
            )
        })?;

    state
        .storage()
        .login_states()
        .insert(&NewLoginState {
            state: state_value,
            nonce,
            code_verifier,
            return_to: None,
            created_at: now,
            expires_at: now + Duration::minutes(LOGIN_STATE_TTL_MINUTES),
        })
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to persist login state");
            ProblemResponse::internal("failed to persist login state")
        })?;

    counter!("oidc_login_total", "result" => "started").increment(1);
    Ok(redirect_found(authorize_url.as_str()))
}

pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ProblemResponse> {
    let oidc = require_oidc(&state)?;

    let Some(state_param) = query.state.as_deref() else {
        return Ok(error_redirect("missing_state"));
    };

    let login_state = state
        .storage()
        .login_states()
        .consume(state_param, state.now())
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to consume login state");
            ProblemResponse::internal("failed to load login state")
        })?;
    let Some(login_state) = login_state else {
        warn!(stage = "auth", "unknown or expired login state");
        return Ok(error_redirect("state_not_found"));
    };

    if let Some(error_code) = query.error.as_deref() {
        warn!(
            stage = "auth",
            error = error_code,
            description = query.error_description.as_deref(),
            "identity provider returned error"
        );
        counter!("oidc_login_total", "result" => "provider_error").increment(1);
        return Ok(error_redirect(error_code));
    }

    let code = match query.code.as_deref() {
        Some(code) if !code.is_empty() => code,
        _ => return Ok(error_redirect("missing_code")),
    };

    let tokens = match oidc
        .client
        .exchange_code(code, &login_state.code_verifier, &oidc.callback_url)
        .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!(stage = "auth", error = %err, "failed to exchange authorization code");
            counter!("oidc_login_total", "result" => "exchange_failed").increment(1);
            return Ok(error_redirect("exchange_failed"));
        }
    };

    let claims = match verify_claims(oidc, tokens.id_token.as_deref(), &login_state.nonce).await {
        Ok(claims) => claims,
        Err(err) => {
            warn!(stage = "auth", error = %err, "id token rejected");
            counter!("oidc_login_total", "result" => "invalid_id_token").increment(1);
            return Ok(error_redirect("invalid_id_token"));
        }
    };

    let now = state.now();
    let user = match state
        .storage()
        .users()
        .upsert(&NewUser {
            id: claims.sub.clone(),
            email: claims.email.clone(),
            first_name: claims.first_name().map(str::to_string),
            last_name: claims.family_name.clone(),
            profile_image_url: claims.picture.clone(),
            now,
        })
        .await
    {
        Ok(user) => user,
        Err(UserError::EmailTaken) => {
            warn!(stage = "auth", sub = %claims.sub, "email already belongs to another account");
            counter!("oidc_login_total", "result" => "email_taken").increment(1);
            return Ok(error_redirect("email_taken"));
        }
        Err(err) => {
            error!(stage = "auth", error = %err, "failed to upsert user");
            return Err(ProblemResponse::internal("failed to store user"));
        }
    };

    // Replace any previous session so the id changes on login. An admin
    // sign-in in the same browser is kept.
    let previous = session::load(&state, &headers).await?;
    let admin_id = previous.as_ref().and_then(|s| s.data.admin_id.clone());
    if let Some(previous) = previous {
        session::destroy(&state, &previous.sid).await?;
    }
    let created = session::create(
        &state,
        SessionData {
            user: Some(OidcIdentity {
                sub: user.id.clone(),
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: tokens.expires_at(now),
            }),
            admin_id,
        },
    )
    .await?;

    info!(stage = "auth", user_id = %user.id, "user signed in");
    counter!("oidc_login_total", "result" => "success").increment(1);

    let target = login_state.return_to.unwrap_or_else(|| "/".to_string());
    let mut response = redirect_found(&target);
    response
        .headers_mut()
        .insert(header::SET_COOKIE, session::set_cookie(&state, &created.sid));
    Ok(response)
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ProblemResponse> {
    if let Some(sid) = session::session_id(&headers) {
        session::destroy(&state, &sid).await?;
    }

    let base_url = state.settings().base_url.clone();
    let target = match state.oidc() {
        Some(oidc) => match oidc.client.end_session_url(&base_url).await {
            Ok(url) => url.to_string(),
            Err(err) => {
                warn!(stage = "auth", error = %err, "failed to build logout url");
                base_url
            }
        },
        None => base_url,
    };

    let mut response = redirect_found(&target);
    response
        .headers_mut()
        .insert(header::SET_COOKIE, session::clear_cookie(&state));
    Ok(response)
}

pub async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<User>, ProblemResponse> {
    let current = require_user(&state, &headers).await?;
    Ok(Json(current.user))
}

/// Resolves the signed-in user, refreshing an expired access token when a
/// refresh token is available. Answers 401 otherwise.
pub async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<CurrentUser, ProblemResponse> {
    let Some(mut session) = session::load(state, headers).await? else {
        return Err(ProblemResponse::unauthorized());
    };
    let Some(identity) = session.data.user.clone() else {
        return Err(ProblemResponse::unauthorized());
    };

    let now = state.now();
    if now > identity.expires_at {
        let (Some(refresh_token), Some(oidc)) = (identity.refresh_token.as_deref(), state.oidc()) else {
            return Err(ProblemResponse::unauthorized());
        };

        let tokens = oidc.client.refresh_token(refresh_token).await.map_err(|err| {
            warn!(stage = "auth", sub = %identity.sub, error = %err, "access token refresh failed");
            ProblemResponse::unauthorized()
        })?;
        session.data.user = Some(OidcIdentity {
            sub: identity.sub.clone(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone().or(identity.refresh_token.clone()),
            expires_at: tokens.expires_at(now),
        });
        session::save(state, &session).await?;
        info!(stage = "auth", sub = %identity.sub, "access token refreshed");
    }

    let user = state
        .storage()
        .users()
        .fetch(&identity.sub)
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to load user");
            ProblemResponse::internal("failed to load user")
        })?
        .ok_or_else(ProblemResponse::unauthorized)?;

    Ok(CurrentUser { session, user })
}

/// Id of the signed-in user when there is one with a live access token. Never fails the request.
pub async fn optional_user_id(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let session = session::load(state, headers).await.ok().flatten()?;
    let identity = session.data.user?;
    if state.now() > identity.expires_at {
        return None;
    }
    match state.storage().users().fetch(&identity.sub).await {
        Ok(Some(user)) => Some(user.id),
        Ok(None) => None,
        Err(err) => {
            warn!(stage = "auth", error = %err, "failed to resolve optional user");
            None
        }
    }
}

fn require_oidc(state: &AppState) -> Result<&OidcLogin, ProblemResponse> {
    state.oidc().ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "oidc_unavailable",
            "sign-in is not configured",
        )
    })
}

async fn verify_claims(
    oidc: &OidcLogin,
    id_token: Option<&str>,
    nonce: &str,
) -> Result<IdTokenClaims, OidcError> {
    let id_token = id_token.ok_or(OidcError::MissingIdToken)?;
    oidc.client.verify_id_token(id_token, nonce).await
}

fn redirect_found(location: &str) -> Response {
    let mut response = Redirect::temporary(location).into_response();
    *response.status_mut() = StatusCode::FOUND;
    response
}

fn error_redirect(reason: &str) -> Response {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    serializer.append_pair("reason", reason);
    redirect_found(&format!("{ERROR_REDIRECT_PATH}?{}", serializer.finish()))
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn compute_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
