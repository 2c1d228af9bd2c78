use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetscope::budget::check_budget;
use fleetscope::config::Config;
use fleetscope::db::AnalyticsDb;
use fleetscope::forge::{ForgeClient, GitHubForge};
use fleetscope::output::{ConsoleReporter, Reporter};
use fleetscope::store::StorePorts;
use fleetscope::sync::SyncEngine;
use fleetscope::throttle::Throttle;

#[derive(Parser)]
#[command(name = "fleetscope")]
#[command(about = "Repository-fleet analytics collector for GitHub organizations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Collect analytics for an organization
    Sync {
        /// Organization to sync (overrides the configured one)
        #[arg(long)]
        org: Option<String>,
    },

    /// Check the API budget for a sync without collecting
    Budget {
        /// Organization to estimate for
        #[arg(long)]
        org: Option<String>,
    },

    /// Show the latest sync run
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose)?;

    info!("Starting FleetScope v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(cli.config)?;

    // Execute command
    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Sync { org } => cmd_sync(org, &config).await,
        Commands::Budget { org } => cmd_budget(org, &config).await,
        Commands::Status => cmd_status(&config),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Resolve the organization from the flag or the configuration
fn resolve_org(flag: Option<String>, config: &Config) -> Result<String> {
    flag.or_else(|| config.github.organization.clone())
        .context("No organization given; pass --org or set github.organization in the config")
}

/// Cancellation token wired to Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling sync");
            trigger.cancel();
        }
    });

    cancel
}

/// Write a default configuration file
fn cmd_init(config: &Config) -> Result<()> {
    let config_path = Config::default_config_path()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(&config_path)?;

    println!("Configuration written to {:?}", config_path);
    println!("Set github.organization and export GITHUB_TOKEN, then run 'fleetscope sync'");

    Ok(())
}

/// Collect analytics for an organization
async fn cmd_sync(org_flag: Option<String>, config: &Config) -> Result<()> {
    let org = resolve_org(org_flag, config)?;
    let token = config.github_token()?;

    let forge: Arc<dyn ForgeClient> = Arc::new(GitHubForge::new(&token)?);
    let throttle = Arc::new(Throttle::new(config.throttle.clone()));
    let db = Arc::new(AnalyticsDb::open_at(config.database.path.clone().into())?);
    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);

    let stores = StorePorts {
        orgs: db.clone(),
        repos: db.clone(),
        snapshots: db.clone(),
        alerts: db.clone(),
        ci_snapshots: db.clone(),
        sync_runs: db,
    };

    let engine = SyncEngine::new(
        forge,
        throttle,
        stores,
        reporter,
        config.collector.clone(),
    );

    let cancel = cancel_on_ctrl_c();
    let summary = engine.sync_organization(&org, &cancel).await?;

    println!(
        "Sync run {} finished in {:.2}s: {}/{} repositories processed, {} snapshots written, {} unchanged",
        summary.run_id,
        summary.duration.as_secs_f64(),
        summary.repos_processed,
        summary.total_repositories,
        summary.snapshots_written,
        summary.snapshots_skipped
    );

    if summary.repos_failed > 0 {
        println!(
            "{} repositories failed; see 'fleetscope status' for the error log",
            summary.repos_failed
        );
    }

    Ok(())
}

/// Check the API budget without collecting
async fn cmd_budget(org_flag: Option<String>, config: &Config) -> Result<()> {
    let org = resolve_org(org_flag, config)?;
    let token = config.github_token()?;

    let forge = GitHubForge::new(&token)?;
    let status = forge.rate_limit().await?;
    let repos = forge.list_org_repos(&org).await?;

    let reporter = ConsoleReporter;
    let estimate = check_budget(&status, repos.len(), &reporter);

    println!(
        "Estimated cost for {} ({} repositories): {}..{} calls, {} GraphQL batches",
        org, estimate.repo_count, estimate.min_calls, estimate.max_calls, estimate.graphql_batches
    );

    Ok(())
}

/// Show the latest sync run
fn cmd_status(config: &Config) -> Result<()> {
    use fleetscope::store::SyncRunStore;

    let db = AnalyticsDb::open_at(config.database.path.clone().into())?;

    match SyncRunStore::get_latest(&db)? {
        Some(run) => {
            println!("Latest sync run #{}", run.id);
            println!("  Status:    {}", run.status.as_str());
            println!("  Type:      {}", run.sync_type);
            if let Some(org) = &run.org_filter {
                println!("  Org:       {}", org);
            }
            println!("  Started:   {}", run.started_at.to_rfc3339());
            if let Some(completed) = run.completed_at {
                println!("  Completed: {}", completed.to_rfc3339());
                println!("  Duration:  {} ms", run.duration_ms);
            }
            println!("  Processed: {}", run.repos_processed);
            println!("  Failed:    {}", run.repos_failed);
            if !run.last_processed_repo.is_empty() {
                println!("  Last repo: {}", run.last_processed_repo);
            }

            if !run.errors.is_empty() {
                println!("  Errors:");
                for entry in &run.errors {
                    println!(
                        "    [{}] {}: {}",
                        entry.timestamp.to_rfc3339(),
                        entry.repo,
                        entry.message
                    );
                }
            }
        }
        None => {
            println!("No sync runs recorded yet");
        }
    }

    Ok(())
}
