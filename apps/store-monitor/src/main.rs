use account_store::adapters::{
    CachedPlanCatalog, SqlitePlanCatalog, SqliteTokenStore, SqliteUsageLedger,
    SqliteUserRepository,
};
use account_store::domain::usage::PeriodKey;
use account_store::domain::user::UserId;
use account_store::services::health::Severity;
use account_store::services::{HealthMonitor, IntegrityChecker, QuotaEvaluator};
use account_store::{ConnectionManager, PlanCatalog, StoreConfig, UsageLedger, UserRepository};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Define a generic error type for the main function
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "store-monitor", version, about = "Maintenance and diagnostics for the account store")]
struct Cli {
    /// Overrides DATABASE_URL from the environment / .env
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the health checks once; exits non-zero on any issue
    Check,
    /// Run the health checks periodically until Ctrl-C
    Monitor {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
    /// Write a consistent copy of the database
    Backup {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Back up, VACUUM and REINDEX, then re-check
    Repair,
    /// Force a full WAL checkpoint
    Checkpoint,
    /// List the active subscription plans
    Plans,
    /// Show quota status for a user
    Quota {
        user_id: i64,
        /// Period as YYYY-MM (defaults to the current month)
        #[arg(long)]
        period: Option<String>,
    },
    /// Show the integrity snapshot and usage breakdown for a user
    Inspect { user_id: i64 },
}

/// Handles wired once at start-up and shared by every command.
struct Services {
    conn: ConnectionManager,
    users: Arc<dyn UserRepository>,
    ledger: Arc<dyn UsageLedger>,
    plans: Arc<dyn PlanCatalog>,
    checker: IntegrityChecker,
    quota: QuotaEvaluator,
    health: HealthMonitor,
}

impl Services {
    fn new(conn: ConnectionManager, config: &StoreConfig) -> Self {
        let users: Arc<dyn UserRepository> = Arc::new(SqliteUserRepository::new(conn.clone()));
        let tokens = Arc::new(SqliteTokenStore::from_config(conn.clone(), config));
        let ledger: Arc<dyn UsageLedger> = Arc::new(SqliteUsageLedger::new(conn.clone()));
        let plans: Arc<dyn PlanCatalog> = Arc::new(CachedPlanCatalog::new(
            Arc::new(SqlitePlanCatalog::new(conn.clone())),
            config.plan_cache_ttl,
        ));
        Self {
            checker: IntegrityChecker::new(users.clone(), tokens),
            quota: QuotaEvaluator::new(users.clone(), ledger.clone(), plans.clone()),
            health: HealthMonitor::new(conn.clone()),
            conn,
            users,
            ledger,
            plans,
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Returns whether the command succeeded; errors are infrastructure failures.
async fn run(cli: Cli, services: &Services) -> Result<bool, BoxError> {
    match cli.command {
        Command::Check => {
            let report = services.health.check().await?;
            print_json(&report)?;
            Ok(report.is_healthy())
        }
        Command::Monitor { interval_secs } => {
            monitor(&services.health, Duration::from_secs(interval_secs.max(1))).await?;
            Ok(true)
        }
        Command::Backup { output } => {
            let path = services.health.backup(output.as_deref()).await?;
            println!("{}", path.display());
            Ok(true)
        }
        Command::Repair => {
            let report = services.health.repair().await?;
            print_json(&report)?;
            Ok(report.after.worst() != Some(Severity::Critical))
        }
        Command::Checkpoint => {
            let report = services.conn.force_durability_sync().await?;
            print_json(&report)?;
            Ok(true)
        }
        Command::Plans => {
            print_json(&services.plans.list_plans().await?)?;
            Ok(true)
        }
        Command::Quota { user_id, period } => {
            let period = match period {
                Some(raw) => PeriodKey::parse(&raw)?,
                None => PeriodKey::current(),
            };
            let status = services.quota.check_quota_in(UserId(user_id), period).await?;
            print_json(&status)?;
            Ok(true)
        }
        Command::Inspect { user_id } => {
            let user_id = UserId(user_id);
            let Some(user) = services.users.find_by_id(user_id).await? else {
                warn!(user_id = %user_id, "No such user");
                return Ok(false);
            };
            let snapshot = services.checker.snapshot(&user).await;
            let usage = services
                .ledger
                .usage_breakdown(user_id, &PeriodKey::current())
                .await?;
            print_json(&serde_json::json!({
                "snapshot": snapshot,
                "usage_this_period": usage,
            }))?;
            Ok(true)
        }
    }
}

async fn monitor(health: &HealthMonitor, every: Duration) -> Result<(), BoxError> {
    info!(interval_secs = every.as_secs(), "Starting health monitoring loop");
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A failed round is logged; the next tick tries again.
                if let Err(e) = health.check().await {
                    error!("Health check failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping monitor.");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, BoxError> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize tracing (logging)
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(EnvFilter::from_default_env()) // Allow RUST_LOG
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    info!("Starting Store Monitor v{}...", env!("CARGO_PKG_VERSION"));

    // --- Configuration ---
    let mut config = StoreConfig::from_env()?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    info!(?config, "Loaded store configuration");

    // --- Database Setup & Migrations ---
    let conn = ConnectionManager::connect(&config).await?;
    if let Err(e) = conn.ensure_schema().await {
        error!("Store migration failed: {}", e);
        return Err(e.into());
    }

    let services = Services::new(conn.clone(), &config);
    let outcome = run(cli, &services).await;
    conn.close().await;
    Ok(if outcome? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
