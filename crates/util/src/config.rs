use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://capigrid.db?mode=rwc";
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_PAYSTACK_BASE_URL: &str = "https://api.paystack.co/";
const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONCILE_AFTER_SECS: u64 = 15 * 60;
const DEFAULT_ABANDON_AFTER_SECS: u64 = 24 * 60 * 60;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }
}

impl Environment {
    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns `true` for production deployments (secure cookies, JSON logs).
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// OpenID Connect relying party settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
    /// Auth0 connection hint forwarded on the authorize request.
    pub connection: Option<String>,
}

/// Paystack API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaystackSettings {
    pub secret_key: String,
    pub base_url: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Public origin of the site, used for payment callbacks and logout redirects.
    pub base_url: String,
    pub session_ttl: Duration,
    pub oidc: Option<OidcSettings>,
    pub paystack: Option<PaystackSettings>,
    pub maintenance_interval: Duration,
    pub reconcile_after: Duration,
    pub abandon_after: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment: Environment = non_empty_var("APP_ENV")
            .as_deref()
            .unwrap_or("development")
            .parse()?;
        let bind_addr: SocketAddr = non_empty_var("APP_BIND_ADDR")
            .as_deref()
            .unwrap_or(DEFAULT_BIND_ADDR)
            .parse()
            .map_err(ConfigError::BindAddress)?;

        let database_url = non_empty_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let base_url = non_empty_var("BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let oidc = oidc_from_env()?;
        if oidc.is_none() && environment.is_production() {
            return Err(ConfigError::Missing("OIDC_ISSUER"));
        }

        let paystack = non_empty_var("PAYSTACK_SECRET_KEY").map(|secret_key| PaystackSettings {
            secret_key,
            base_url: non_empty_var("PAYSTACK_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PAYSTACK_BASE_URL.to_string()),
        });

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            base_url,
            session_ttl: seconds_var("SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?,
            oidc,
            paystack,
            maintenance_interval: seconds_var(
                "MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )?,
            reconcile_after: seconds_var("PAYMENT_RECONCILE_AFTER_SECS", DEFAULT_RECONCILE_AFTER_SECS)?,
            abandon_after: seconds_var("PAYMENT_ABANDON_AFTER_SECS", DEFAULT_ABANDON_AFTER_SECS)?,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn seconds_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match non_empty_var(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidNumber { name, value: raw }),
            Ok(secs) => Ok(Duration::from_secs(secs)),
        },
    }
}

fn oidc_from_env() -> Result<Option<OidcSettings>, ConfigError> {
    const REQUIRED: [&str; 4] = [
        "OIDC_ISSUER",
        "OIDC_CLIENT_ID",
        "OIDC_CLIENT_SECRET",
        "OIDC_CALLBACK_URL",
    ];
    let values: Vec<Option<String>> = REQUIRED.iter().map(|name| non_empty_var(name)).collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }
    if let Some(index) = values.iter().position(Option::is_none) {
        return Err(ConfigError::Missing(REQUIRED[index]));
    }

    let mut values = values.into_iter().flatten();
    let mut next = || values.next().unwrap_or_default();
    Ok(Some(OidcSettings {
        issuer: next(),
        client_id: next(),
        client_secret: next(),
        callback_url: next(),
        connection: non_empty_var("OIDC_CONNECTION"),
    }))
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive number of seconds (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
