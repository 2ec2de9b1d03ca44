//! Operator commands that run against the database directly.

use std::error::Error;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};

use capigrid_core::{
    password::hash_password,
    totp,
    types::{User, UserRole},
};
use capigrid_storage::{AdminCredential, Database, NewAdmin, UserError};
use capigrid_util::{config::DEFAULT_DATABASE_URL, load_env_file};

const GENERATED_PASSWORD_LEN: usize = 20;
const TOTP_ISSUER: &str = "Capigrid";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an administrator, or reset the credentials of an existing one
    CreateAdmin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        /// Generated when omitted
        #[arg(long)]
        password: Option<String>,
        /// Skip the TOTP second factor
        #[arg(long)]
        no_2fa: bool,
    },
    /// Give an existing OIDC user the admin role
    GrantAdmin {
        #[arg(long)]
        user_id: String,
    },
}

/// What `create-admin` needs to print; secrets are shown exactly once.
struct CreatedAdmin {
    admin: AdminCredential,
    generated_password: Option<String>,
    provisioning_uri: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    load_env_file();
    let cli = Cli::parse();

    let database = Database::connect(&cli.database).await?;
    database.run_migrations().await?;

    match cli.command {
        Commands::CreateAdmin {
            username,
            email,
            password,
            no_2fa,
        } => {
            let created = create_admin(&database, username, email, password, !no_2fa, Utc::now()).await?;
            println!("Admin {} saved (id {})", created.admin.username, created.admin.id);
            if let Some(password) = &created.generated_password {
                println!("Password: {password}");
            }
            if let (Some(secret), Some(uri)) = (&created.admin.two_factor_secret, &created.provisioning_uri) {
                println!("TOTP secret: {secret}");
                println!("{uri}");
            }
        }
        Commands::GrantAdmin { user_id } => {
            let user = grant_admin(&database, &user_id, Utc::now()).await?;
            println!("User {} now has role {}", user.id, user.role.as_str());
        }
    }

    Ok(())
}

async fn create_admin(
    database: &Database,
    username: String,
    email: String,
    password: Option<String>,
    two_factor: bool,
    now: DateTime<Utc>,
) -> Result<CreatedAdmin, Box<dyn Error>> {
    let (password, generated_password) = match password {
        Some(password) => (password, None),
        None => {
            let password = generate_password();
            (password.clone(), Some(password))
        }
    };
    let password_hash = hash_password(&password)?;
    let secret = two_factor.then(totp::generate_secret);

    let admin = database
        .admins()
        .upsert(&NewAdmin {
            username,
            email,
            password_hash,
            two_factor_secret: secret,
            now,
        })
        .await?;
    let provisioning_uri = admin
        .two_factor_secret
        .as_deref()
        .map(|secret| totp::provisioning_uri(secret, &admin.username, TOTP_ISSUER));

    Ok(CreatedAdmin {
        admin,
        generated_password,
        provisioning_uri,
    })
}

async fn grant_admin(database: &Database, user_id: &str, now: DateTime<Utc>) -> Result<User, UserError> {
    database.users().set_role(user_id, UserRole::Admin, now).await
}

fn generate_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use capigrid_core::password::verify_password;
    use capigrid_storage::NewUser;

    async fn database() -> Database {
        let database = Database::connect("sqlite::memory:").await.expect("connect");
        database.run_migrations().await.expect("migrations");
        database
    }

    #[tokio::test]
    async fn create_admin_generates_password_and_totp_secret() {
        let database = database().await;
        let now = Utc::now();

        let created = create_admin(&database, "ops".into(), "ops@example.com".into(), None, true, now)
            .await
            .expect("create admin");

        let password = created.generated_password.expect("generated password");
        assert_eq!(password.len(), GENERATED_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        let secret = created.admin.two_factor_secret.clone().expect("totp secret");
        let uri = created.provisioning_uri.expect("provisioning uri");
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains(&secret));
        assert!(uri.contains("Capigrid"));
        let code = totp::code_at(&secret, now).expect("code");
        assert!(totp::verify(&secret, &code, now, 1).expect("verify"));

        let stored = database
            .admins()
            .fetch_by_username("ops")
            .await
            .expect("fetch")
            .expect("stored admin");
        assert!(verify_password(&stored.password_hash, &password));
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn create_admin_resets_an_existing_admin_without_2fa() {
        let database = database().await;
        let now = Utc::now();
        let first = create_admin(&database, "ops".into(), "ops@example.com".into(), None, true, now)
            .await
            .expect("first");

        let second = create_admin(
            &database,
            "ops".into(),
            "ops@example.com".into(),
            Some("correct horse".into()),
            false,
            now,
        )
        .await
        .expect("second");

        assert_eq!(second.admin.id, first.admin.id);
        assert!(second.generated_password.is_none());
        assert!(second.admin.two_factor_secret.is_none());
        assert!(second.provisioning_uri.is_none());
        assert!(verify_password(&second.admin.password_hash, "correct horse"));
    }

    #[tokio::test]
    async fn grant_admin_promotes_existing_users_only() {
        let database = database().await;
        let now = Utc::now();
        database
            .users()
            .upsert(&NewUser {
                id: "auth0|42".into(),
                email: Some("ada@example.com".into()),
                first_name: Some("Ada".into()),
                last_name: None,
                profile_image_url: None,
                now,
            })
            .await
            .expect("user");

        let user = grant_admin(&database, "auth0|42", now).await.expect("grant");
        assert_eq!(user.role, UserRole::Admin);

        let err = grant_admin(&database, "missing", now).await.unwrap_err();
        assert!(matches!(err, UserError::NotFound));
    }
}
