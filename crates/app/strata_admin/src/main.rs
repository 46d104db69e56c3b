//! Strata catalog administration.
//!
//! Out-of-band operations the API never performs: bootstrapping the catalog
//! schema and managing the monitoring credential pool. Prints results as
//! JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use strata_core::codec::SecretCodec;
use strata_core::config::CatalogConfig;
use strata_core::models::MonitoringCredential;
use strata_core::repo::CATALOG_TABLES;
use strata_core::store::PgRecordStore;
use strata_core::RepositoryContext;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the administration tool.
#[derive(Parser, Debug)]
#[command(name = "strata_admin", about = "Strata catalog administration", version)]
struct Args {
    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "STRATA_MAX_CONNECTIONS")]
    max_connections: Option<u32>,

    /// File holding the secret encryption key.
    #[arg(long, env = "STRATA_ENCRYPTION_KEY_FILE")]
    encryption_key_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade every catalog table and wait until it is ready.
    Schema,

    /// Manage the monitoring credential pool.
    #[command(subcommand)]
    Credentials(CredentialCommand),
}

#[derive(Subcommand, Debug)]
enum CredentialCommand {
    /// Add an available credential to the pool.
    Add {
        #[arg(long)]
        access_key: String,
        #[arg(long, env = "STRATA_CREDENTIAL_SECRET_KEY", hide_env_values = true)]
        secret_key: String,
    },
    /// Replace the secret key of a credential, keeping its state.
    Rotate {
        access_key: String,
        #[arg(long, env = "STRATA_CREDENTIAL_SECRET_KEY", hide_env_values = true)]
        secret_key: String,
    },
    /// Revoke a credential and detach it from its cluster.
    Revoke { access_key: String },
    /// Delete a credential that is not in use.
    Delete { access_key: String },
    /// List the pool.
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,strata_core=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = CatalogConfig::from_env();
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    if let Some(n) = args.max_connections {
        config.max_connections = n;
    }
    if let Some(path) = args.encryption_key_file {
        config.encryption_key_file = path;
    }

    info!(max_connections = config.max_connections, "connecting to catalog database");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    let mut store = PgRecordStore::new(pool, CATALOG_TABLES);
    if let Some(page_size) = config.page_size {
        store = store.with_page_size(page_size);
    }
    let codec = SecretCodec::from_key_file(&config.encryption_key_file)?;
    let ctx = RepositoryContext::new(Arc::new(store), codec, &config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match args.command {
        Command::Schema => {
            ctx.ensure_schema(&config.schema, &cancel).await?;
            info!(tables = CATALOG_TABLES.len(), "catalog schema is ready");
        }
        Command::Credentials(command) => run_credentials(&ctx, command).await?,
    }
    Ok(())
}

async fn run_credentials(
    ctx: &RepositoryContext,
    command: CredentialCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CredentialCommand::Add {
            access_key,
            secret_key,
        } => {
            let credential = MonitoringCredential::new(access_key, secret_key);
            ctx.add_monitoring_credential(&credential).await?;
            println!("{}", serde_json::json!({"added": credential.access_key}));
        }
        CredentialCommand::Rotate {
            access_key,
            secret_key,
        } => {
            ctx.update_monitoring_credential(&access_key, &secret_key)
                .await?;
            println!("{}", serde_json::json!({"rotated": access_key}));
        }
        CredentialCommand::Revoke { access_key } => {
            ctx.revoke_monitoring_credential(&access_key).await?;
            println!("{}", serde_json::json!({"revoked": access_key}));
        }
        CredentialCommand::Delete { access_key } => {
            ctx.delete_monitoring_credential(&access_key).await?;
            println!("{}", serde_json::json!({"deleted": access_key}));
        }
        CredentialCommand::List => {
            let pool: Vec<_> = ctx
                .list_monitoring_credentials()
                .await?
                .into_iter()
                .map(|c| {
                    serde_json::json!({
                        "accessKey": c.access_key,
                        "state": c.state().to_string(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&pool)?);
        }
    }
    Ok(())
}
