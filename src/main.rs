//! # Drip — durable drip-campaign service
//!
//! Usage:
//!   drip serve                      # HTTP API + timer loop (default port 3000)
//!   drip serve --port 8080 --db ./drip.db
//!   drip log a@x.com                # Print the durable log of the latest run
//!   drip init                       # Write ~/.drip/config.toml with defaults

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use drip_core::{DripConfig, SubscriberId};
use drip_scheduler::{DurableLog, EngineSettings, ProcessRegistry, StateDb, SystemClock};

#[derive(Parser)]
#[command(
    name = "drip",
    version,
    about = "📬 Drip: per-subscriber email campaigns that survive restarts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the timer loop
    Serve {
        /// Config file (default: ~/.drip/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Override gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override state database path
        #[arg(long)]
        db: Option<String>,
    },
    /// Print the durable log of a subscriber's latest run
    Log {
        email: String,

        /// State database path (default: from config)
        #[arg(long)]
        db: Option<String>,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<DripConfig> {
    Ok(match path {
        Some(p) => DripConfig::load_from(&expand_path(p))?,
        None => DripConfig::load()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "drip=debug,drip_scheduler=debug,drip_gateway=debug,drip_channels=debug,tower_http=debug"
    } else {
        "drip=info,drip_scheduler=info,drip_gateway=info,drip_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { config, port, db } => serve(config.as_deref(), port, db.as_deref()).await,
        Commands::Log { email, db } => print_log(&email, db.as_deref()),
        Commands::Init { force } => init(force),
    }
}

async fn serve(config_path: Option<&str>, port: Option<u16>, db: Option<&str>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(db) = db {
        config.storage.db_path = db.to_string();
    }

    let db_path = config.storage.resolved_path();
    let db = Arc::new(StateDb::open(&db_path)?);
    let notifier = drip_channels::from_config(&config.notifier)?;
    let registry = Arc::new(ProcessRegistry::new(
        db,
        notifier,
        EngineSettings::from_config(&config),
        Arc::new(SystemClock),
    )?);

    println!("📬 Drip v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 API:       http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   🗄️  Database:  {}", db_path.display());
    println!("   ⏱️  Interval:  {}s", config.campaign.interval_secs);
    println!("   📮 Notifier:  {}", registry.notifier_name());
    println!();

    let report = registry.recover()?;
    if report.corrupt > 0 {
        tracing::warn!("⚠️ {} subscriber log(s) could not be replayed", report.corrupt);
    }

    let timers = tokio::spawn(registry.clone().run_timers());

    drip_gateway::start_server(&config.gateway, registry.clone(), shutdown_signal()).await?;

    registry.shutdown().await;
    timers.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("⚠️ Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown requested");
}

fn print_log(email: &str, db: Option<&str>) -> Result<()> {
    let db_path = match db {
        Some(p) => expand_path(p),
        None => DripConfig::load()?.storage.resolved_path(),
    };
    let id = SubscriberId::parse(email)?;
    let log = DurableLog::new(Arc::new(StateDb::open(&db_path)?));

    let Some((run, entries)) = log.latest(&id)? else {
        println!("No log for {id}");
        return Ok(());
    };

    println!("📜 {id}, run {run} ({} entries)", entries.len());
    for entry in entries {
        println!(
            "{:>5}  {:<17} {}  {}",
            entry.seq,
            entry.kind,
            entry.logical_time.to_rfc3339(),
            serde_json::to_string(&entry.details)?
        );
    }
    Ok(())
}

fn init(force: bool) -> Result<()> {
    let path = DripConfig::default_path();
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    DripConfig::default().save_to(&path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}
