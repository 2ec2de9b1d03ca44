mod admin;
mod auth;
mod campaigns;
mod contributions;
mod maintenance;
mod payments;
mod problem;
mod router;
mod session;
mod telemetry;

use std::{net::SocketAddr, time::Duration};

use reqwest::Client;
use tracing::{info, warn};

use capigrid_gateway::{OidcClient, PaystackClient};
use capigrid_storage::Database;
use capigrid_util::{load_env_file, AppConfig};

use crate::maintenance::{MaintenanceSettings, MaintenanceWorker};
use crate::router::{OidcLogin, WebSettings};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    if let Some(path) = env_file {
        info!(stage = "app", path = %path.display(), "loaded environment file");
    }

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", database_url = %config.database_url, "database ready");

    let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;

    let mut state = router::AppState::new(metrics, database.clone(), WebSettings::from_config(&config));

    match &config.oidc {
        Some(oidc) => {
            let client = OidcClient::new(
                &oidc.issuer,
                oidc.client_id.clone(),
                oidc.client_secret.clone(),
                http.clone(),
            )?;
            info!(stage = "app", issuer = %oidc.issuer, "OIDC login enabled");
            state = state.with_oidc(OidcLogin {
                client,
                callback_url: oidc.callback_url.clone(),
                connection: oidc.connection.clone(),
            });
        }
        None => warn!(stage = "app", "OIDC_ISSUER not set; user login is disabled"),
    }

    let paystack = match &config.paystack {
        Some(settings) => {
            let client = PaystackClient::new(settings.secret_key.clone(), &settings.base_url, http.clone())?;
            info!(stage = "app", base_url = %settings.base_url, "Paystack payments enabled");
            state = state.with_paystack(client.clone());
            Some(client)
        }
        None => {
            warn!(stage = "app", "PAYSTACK_SECRET_KEY not set; card payments are disabled");
            None
        }
    };

    MaintenanceWorker::new(database, paystack, MaintenanceSettings::from_config(&config)).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
