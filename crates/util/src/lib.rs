//! Process-level helpers shared by the server and the operator CLI.

pub mod config;

use std::path::PathBuf;

pub use config::{
    AppConfig, ConfigError, Environment, OidcSettings, PaystackSettings, DEFAULT_BIND_ADDR,
};

/// Reads `.env` from the working directory or its ancestors, if one exists,
/// and returns the path that was applied.
pub fn load_env_file() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Serialises tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
