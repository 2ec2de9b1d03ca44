//! Structured logging and the Prometheus recorder.

use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use capigrid_util::AppConfig;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

enum Series {
    Counter,
    Histogram,
}

/// Every series the service emits, with its help text.
const SERIES: &[(Series, &str, &str)] = &[
    (
        Series::Counter,
        "contributions_recorded_total",
        "Direct contributions processed, labelled by payment method and outcome",
    ),
    (
        Series::Counter,
        "ledger_settlements_total",
        "Gateway-confirmed payments applied to the ledger, labelled by source and outcome",
    ),
    (
        Series::Counter,
        "payments_initialize_total",
        "Card checkout initialisations, labelled by result",
    ),
    (
        Series::Counter,
        "paystack_webhook_total",
        "Paystack webhook deliveries with a valid signature, labelled by event",
    ),
    (
        Series::Counter,
        "paystack_invalid_signature_total",
        "Paystack webhook deliveries rejected for a missing or invalid signature",
    ),
    (
        Series::Histogram,
        "webhook_ack_latency_seconds",
        "Seconds taken to acknowledge a Paystack webhook",
    ),
    (Series::Counter, "admin_login_total", "Admin login attempts, labelled by result"),
    (Series::Counter, "oidc_login_total", "OIDC login steps, labelled by result"),
    (
        Series::Counter,
        "payments_reconciled_total",
        "Stale pending card contributions checked against Paystack, labelled by result",
    ),
    (
        Series::Counter,
        "db_ttl_deleted_total",
        "Expired rows removed by maintenance sweeps, labelled by table",
    ),
    (
        Series::Histogram,
        "db_checkpoint_seconds",
        "Duration of WAL checkpoints in seconds",
    ),
    (
        Series::Counter,
        "db_busy_total",
        "SQLite busy conditions hit by maintenance, labelled by operation",
    ),
];

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: JSON lines in production, pretty output elsewhere.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let production = config.environment.is_production();

    let json_layer = production.then(|| {
        tracing_fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .json()
    });
    let pretty_layer = (!production).then(|| {
        tracing_fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .event_format(tracing_fmt::format().pretty())
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "app",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once per process and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut installed = METRICS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    for (kind, name, help) in SERIES {
        match kind {
            Series::Counter => describe_counter!(*name, *help),
            Series::Histogram => describe_histogram!(*name, *help),
        }
    }
    START_TIME.get_or_init(Instant::now);

    *installed = Some(handle.clone());
    Ok(handle)
}

/// Recorder output followed by the build info and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1",
        build_git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");

    body
}
