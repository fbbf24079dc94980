mod config;
mod server;
#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use edgemesh_core::events::EventBus;
use edgemesh_core::ids::TaskId;
use edgemesh_core::reaper::{self, ReaperConfig};
use edgemesh_core::store::Store;
use edgemesh_core::token;
use edgemesh_db::{pool, store::PgStore};

use config::EdgeMeshConfig;

#[derive(Parser)]
#[command(name = "edgemesh", about = "Control plane for a fleet of pull-based worker nodes")]
struct Cli {
    /// Database URL (overrides EDGEMESH_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an edgemesh config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/edgemesh")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the edgemesh database (requires config file or env vars)
    DbInit,
    /// Run the HTTP control plane
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 7878)]
        port: u16,
    },
    /// Token issuance helpers
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Print the bootstrap token workers present at `node.register`
    Bootstrap,
    /// Mint an admin token for an operator
    Admin {
        /// Identity to embed in the token (for audit logging)
        subject: String,
        /// Time to live, in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
    /// Mint a single-use job token scoped to one task id, for `task.submit`
    Job {
        /// Task id the token is scoped to
        task_id: uuid::Uuid,
    },
}

/// Execute the `edgemesh init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        auth: config::AuthSection {
            bootstrap_secret: config::generate_secret(),
            node_token_secret: config::generate_secret(),
            job_token_secret: config::generate_secret(),
            admin_secret: config::generate_secret(),
        },
        scheduling: config::SchedulingSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.bootstrap_secret = {}...", &cfg.auth.bootstrap_secret[..8]);
    println!("  auth.node_token_secret = {}...", &cfg.auth.node_token_secret[..8]);
    println!("  auth.job_token_secret = {}...", &cfg.auth.job_token_secret[..8]);
    println!("  auth.admin_secret = {}...", &cfg.auth.admin_secret[..8]);
    println!();
    println!("Next: run `edgemesh db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `edgemesh db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = EdgeMeshConfig::resolve(cli_db_url)?;

    println!("Initializing edgemesh database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("edgemesh db-init complete.");
    Ok(())
}

/// Execute the `edgemesh serve` command: start the HTTP control plane and
/// its background timeout reaper.
async fn cmd_serve(cli_db_url: Option<&str>, bind: &str, port: u16) -> anyhow::Result<()> {
    let resolved = EdgeMeshConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(db_pool.clone()));
    let events = Arc::new(EventBus::new(resolved.ring_capacity));
    let state = Arc::new(server::AppState::new(store.clone(), events, &resolved));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper_handle = reaper::spawn(
        store,
        state.lifecycle.clone(),
        state.clock.clone(),
        ReaperConfig { interval: resolved.reaper_interval },
        shutdown_rx,
    );

    let result = server::run_serve(state, bind, port).await;

    let _ = shutdown_tx.send(true);
    reaper_handle.await.context("reaper task panicked")?;
    db_pool.close().await;

    result
}

fn cmd_token(command: TokenCommands, cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = EdgeMeshConfig::resolve(cli_db_url)?;
    let now_ms = chrono::Utc::now().timestamp_millis();

    match command {
        TokenCommands::Bootstrap => {
            println!("{}", token::issue_bootstrap_token(&resolved.bootstrap_secret));
        }
        TokenCommands::Admin { subject, ttl_secs } => {
            println!("{}", token::issue_admin_token(&resolved.admin_secret, &subject, now_ms, ttl_secs * 1000));
        }
        TokenCommands::Job { task_id } => {
            println!("{}", token::issue_job_token(&resolved.job_token_secret, TaskId::new(task_id)));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            cmd_serve(cli.database_url.as_deref(), &bind, port).await?;
        }
        Commands::Token { command } => {
            cmd_token(command, cli.database_url.as_deref())?;
        }
    }

    Ok(())
}
