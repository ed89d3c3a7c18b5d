// ABOUTME: CLI entry point for pg-provisioner
// ABOUTME: Parses commands, wires cancellation, and maps outcomes to exit codes

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pg_provisioner::commands::{self, Outcome, EXIT_FAILURE};
use pg_provisioner::config::{self, DbConfig, ProvisionConfig};
use pg_provisioner::postgres::Database;
use pg_provisioner::utils;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pg-provisioner")]
#[command(about = "Versioned schema migrations and per-service access control for PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Path to a provisioning plan (TOML); the built-in drive schema when omitted
    #[arg(long, global = true, env = "PROVISION_CONFIG")]
    config: Option<PathBuf>,
    /// Cancel the operation after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Full connection URL; overrides the individual connection flags
    #[arg(long, global = true, env = "DATABASE_URL")]
    url: Option<String>,
    #[arg(long, global = true, env = "DB_HOST", default_value = "localhost")]
    host: String,
    #[arg(long, global = true, env = "DB_PORT", default_value_t = 5432)]
    port: u16,
    #[arg(long, global = true, env = "DB_USER", default_value = "postgres")]
    user: String,
    #[arg(long, global = true, env = "DB_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long, global = true, env = "DB_NAME", default_value = "postgres")]
    dbname: String,
    /// disable, prefer, require, verify-ca or verify-full
    #[arg(long, global = true, env = "DB_SSLMODE", default_value = "disable")]
    sslmode: String,
    /// Maximum open connections in the pool
    #[arg(long, global = true, default_value_t = config::DEFAULT_MAX_OPEN_CONNS)]
    max_open_conns: usize,
}

impl ConnectionArgs {
    fn to_db_config(&self) -> Result<DbConfig> {
        let mut config = match &self.url {
            Some(url) => DbConfig::from_url(url)?,
            None => DbConfig {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                password: self.password.clone(),
                dbname: self.dbname.clone(),
                ssl_mode: self.sslmode.parse()?,
                ..DbConfig::default()
            },
        };
        config.max_open_conns = self.max_open_conns;
        Ok(config.with_defaults())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create extensions, apply pending migrations, and re-apply schema fixtures
    Migrate,
    /// Create service roles and grant their table privileges
    ProvisionRoles {
        /// Also enable row level security and install one policy per role/table
        #[arg(long)]
        enable_rls: bool,
    },
    /// Drop all managed tables in reverse dependency order
    Reset {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
        /// Also drop the migration ledger so the next migrate starts from scratch
        #[arg(long)]
        include_ledger: bool,
    },
    /// Reset (including the ledger), migrate, and provision roles
    Fresh {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show applied and pending migrations and missing tables
    Status,
}

fn load_plan(path: Option<&PathBuf>) -> Result<ProvisionConfig> {
    match path {
        Some(path) => config::load_from_file(path),
        None => Ok(ProvisionConfig::default()),
    }
}

fn watch_for_cancellation(cancel: &CancellationToken, timeout: Option<u64>) {
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠ Interrupt received, cancelling (in-flight transaction will roll back)...");
            token.cancel();
        }
    });

    if let Some(secs) = timeout {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::warn!("⚠ Timeout of {}s reached, cancelling...", secs);
            token.cancel();
        });
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut plan = load_plan(cli.config.as_ref())?;
    let db_config = cli
        .connection
        .to_db_config()
        .context("Invalid connection settings")?;

    let cancel = CancellationToken::new();
    watch_for_cancellation(&cancel, cli.timeout);

    let db = Database::open(db_config).await?;

    let result = match cli.command {
        Commands::Migrate => commands::migrate(&db, &plan, &cancel).await.map(ExitCode::from),
        Commands::ProvisionRoles { enable_rls } => {
            plan.enable_rls |= enable_rls;
            commands::provision_roles(&db, &plan, &cancel)
                .await
                .map(ExitCode::from)
        }
        Commands::Reset { yes, include_ledger } => {
            commands::reset(&db, &plan, yes, include_ledger, &cancel)
                .await
                .map(ExitCode::from)
        }
        Commands::Fresh { yes } => commands::fresh(&db, &plan, yes, &cancel)
            .await
            .map(ExitCode::from),
        Commands::Status => commands::status(&db, &plan, &cancel).await.map(|report| {
            let outcome = if report.is_up_to_date() {
                Outcome::NothingToDo
            } else {
                Outcome::Applied(report.pending.len() + report.missing_tables.len())
            };
            ExitCode::from(outcome)
        }),
    };

    db.close();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("✗ {}", utils::error_chain(&e));
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
