//! Server-side sessions keyed by an opaque cookie.
//!
//! The cookie only carries a random session id; the payload lives in the
//! `sessions` table and expires with it.

use axum::http::{header, HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::problem::ProblemResponse;
use crate::router::AppState;

pub const SESSION_COOKIE: &str = "capigrid.sid";
const SESSION_ID_BYTES: usize = 32;

/// Payload stored for each session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<OidcIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
}

/// Tokens of the signed-in OIDC user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcIdentity {
    pub sub: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub sid: String,
    pub data: SessionData,
}

/// Extracts the session id from the `Cookie` header(s).
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Loads the active session referenced by the request cookie.
pub async fn load(state: &AppState, headers: &HeaderMap) -> Result<Option<Session>, ProblemResponse> {
    let Some(sid) = session_id(headers) else {
        return Ok(None);
    };

    let stored = state
        .storage()
        .sessions()
        .fetch_active(&sid, state.now())
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to load session");
            ProblemResponse::internal("failed to load session")
        })?;
    let Some(stored) = stored else {
        return Ok(None);
    };

    match serde_json::from_str::<SessionData>(&stored.data_json) {
        Ok(data) => Ok(Some(Session {
            sid: stored.sid,
            data,
        })),
        Err(err) => {
            // Unreadable payloads are treated as signed out.
            error!(stage = "auth", error = %err, "discarding malformed session payload");
            Ok(None)
        }
    }
}

/// Persists a brand new session and returns it. Callers replace any previous
/// session so ids are never reused across a privilege change.
pub async fn create(state: &AppState, data: SessionData) -> Result<Session, ProblemResponse> {
    let sid = generate_session_id();
    let now = state.now();
    let data_json = encode(&data)?;

    state
        .storage()
        .sessions()
        .insert(&sid, &data_json, expires_at(state, now), now)
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to persist session");
            ProblemResponse::internal("failed to create session")
        })?;

    Ok(Session { sid, data })
}

/// Writes the payload back and slides the expiry forward.
pub async fn save(state: &AppState, session: &Session) -> Result<(), ProblemResponse> {
    let data_json = encode(&session.data)?;
    state
        .storage()
        .sessions()
        .update_data(&session.sid, &data_json, expires_at(state, state.now()))
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to update session");
            ProblemResponse::internal("failed to update session")
        })?;
    Ok(())
}

pub async fn destroy(state: &AppState, sid: &str) -> Result<(), ProblemResponse> {
    state.storage().sessions().delete(sid).await.map_err(|err| {
        error!(stage = "auth", error = %err, "failed to delete session");
        ProblemResponse::internal("failed to delete session")
    })?;
    Ok(())
}

pub fn set_cookie(state: &AppState, sid: &str) -> HeaderValue {
    let max_age = state.settings().session_ttl.as_secs();
    cookie_header(
        format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}"),
        state.settings().secure_cookies,
    )
}

pub fn clear_cookie(state: &AppState) -> HeaderValue {
    cookie_header(
        format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"),
        state.settings().secure_cookies,
    )
}

fn cookie_header(mut value: String, secure: bool) -> HeaderValue {
    if secure {
        value.push_str("; Secure");
    }
    // Session ids are base64url, so the header is always visible ASCII.
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn expires_at(state: &AppState, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::from_std(state.settings().session_ttl).unwrap_or_else(|_| Duration::days(7))
}

fn encode(data: &SessionData) -> Result<String, ProblemResponse> {
    serde_json::to_string(data).map_err(|err| {
        error!(stage = "auth", error = %err, "failed to encode session payload");
        ProblemResponse::internal("failed to encode session")
    })
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
