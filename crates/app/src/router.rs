use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use capigrid_gateway::{OidcClient, PaystackClient};
use capigrid_storage::Database;
use capigrid_util::AppConfig;

use crate::{admin, auth, campaigns, contributions, payments, telemetry};

/// Request-independent settings the handlers need.
#[derive(Debug, Clone)]
pub struct WebSettings {
    /// Public origin without a trailing slash.
    pub base_url: String,
    pub session_ttl: Duration,
    pub secure_cookies: bool,
}

impl WebSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            session_ttl: config.session_ttl,
            secure_cookies: config.environment.is_production(),
        }
    }
}

/// OIDC relying-party wiring: the client plus the values sent on every login.
#[derive(Clone)]
pub struct OidcLogin {
    pub client: OidcClient,
    pub callback_url: String,
    pub connection: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    settings: Arc<WebSettings>,
    oidc: Option<OidcLogin>,
    paystack: Option<PaystackClient>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, settings: WebSettings) -> Self {
        Self {
            metrics,
            storage,
            settings: Arc::new(settings),
            oidc: None,
            paystack: None,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_oidc(mut self, oidc: OidcLogin) -> Self {
        self.oidc = Some(oidc);
        self
    }

    pub fn with_paystack(mut self, paystack: PaystackClient) -> Self {
        self.paystack = Some(paystack);
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_settings(mut self, settings: WebSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn settings(&self) -> &WebSettings {
        &self.settings
    }

    pub fn oidc(&self) -> Option<&OidcLogin> {
        self.oidc.as_ref()
    }

    pub fn paystack(&self) -> Option<&PaystackClient> {
        self.paystack.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/login", get(auth::login))
        .route("/api/callback", get(auth::callback))
        .route("/api/logout", get(auth::logout))
        .route("/api/auth/user", get(auth::current_user))
        .route("/api/campaigns", get(campaigns::list).post(campaigns::create))
        .route("/api/campaigns/search", get(campaigns::search))
        .route("/api/campaigns/:id", get(campaigns::get_one))
        .route("/api/campaigns/:id/contribute", post(contributions::contribute))
        .route("/api/campaigns/:id/contributions", get(contributions::list_for_campaign))
        .route(
            "/api/campaigns/:id/updates",
            get(campaigns::list_updates).post(campaigns::create_update),
        )
        .route(
            "/api/campaigns/:id/comments",
            get(campaigns::list_comments).post(campaigns::create_comment),
        )
        .route("/api/campaigns/:id/analytics", get(campaigns::analytics))
        .route("/api/users/campaigns", get(campaigns::list_mine))
        .route("/api/users/contributions", get(contributions::list_mine))
        .route("/api/payments/initialize", post(payments::initialize))
        .route("/api/payments/verify", post(payments::verify))
        .route("/api/payments/webhook", post(payments::webhook))
        .route("/api/admin/login", post(admin::login))
        .route("/api/admin/logout", post(admin::logout))
        .route("/api/admin/check", get(admin::check))
        .route("/api/admin/stats", get(admin::stats))
        .route("/api/admin/campaigns/pending", get(admin::pending_campaigns))
        .route("/api/admin/campaigns/:id/approve", post(admin::approve))
        .route("/api/admin/campaigns/:id/reject", post(admin::reject))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
