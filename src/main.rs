use anyhow::{Context, Result};
use clap::Parser;
use metasearch_scheduler::config::{AppConfig, CliConfig, FileConfig};
use metasearch_scheduler::metrics;
use metasearch_scheduler::scheduler::registry::{CLUSTER_HEARTBEAT, HEALTHCHECK_SELF};
use metasearch_scheduler::scheduler::{TaskContext, TaskError, TaskHandler};
use metasearch_scheduler::{Scheduler, SchedulerStore, SqliteSchedulerStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir().context("Error resolving current directory")?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the scheduler database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Identifier of this node in lease rows and run history. Random if unset.
    #[clap(long)]
    pub node_id: Option<String>,

    /// Coordinate with other nodes through the shared database.
    #[clap(long)]
    pub cluster: bool,

    /// IANA timezone calendar schedules are evaluated in.
    #[clap(long)]
    pub timezone: Option<String>,

    /// How late a missed occurrence may still run, e.g. "30m".
    #[clap(long)]
    pub catch_up_window: Option<String>,

    /// Seconds between dispatcher ticks.
    #[clap(long)]
    pub tick_secs: Option<u64>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            node_id: self.node_id.clone(),
            cluster: self.cluster,
            timezone: self.timezone.clone(),
            catch_up_window: self.catch_up_window.clone(),
            tick_secs: self.tick_secs,
        }
    }
}

/// Handlers available in the standalone host. The remaining catalogue
/// entries belong to the full server and stay inert here.
fn host_handlers(
    store: &Arc<dyn SchedulerStore>,
    node_id: &str,
    cluster: bool,
) -> HashMap<String, Arc<dyn TaskHandler>> {
    let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();

    let health_store = Arc::clone(store);
    handlers.insert(
        HEALTHCHECK_SELF.to_string(),
        Arc::new(move |_ctx: &TaskContext| -> Result<(), TaskError> {
            health_store
                .ping()
                .map_err(|e| TaskError::failed(format!("database unreachable: {}", e)))
        }),
    );

    if cluster {
        let heartbeat_store = Arc::clone(store);
        let node_id = node_id.to_string();
        handlers.insert(
            CLUSTER_HEARTBEAT.to_string(),
            Arc::new(move |ctx: &TaskContext| -> Result<(), TaskError> {
                heartbeat_store
                    .ping()
                    .map_err(|e| TaskError::failed(format!("database unreachable: {}", e)))?;
                debug!("Heartbeat from node {} at {}", node_id, ctx.occurrence);
                Ok(())
            }),
        );
    }

    handlers
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    info!(
        "Starting scheduler-server {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("SCHEDULER_GIT_HASH")
    );

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    metrics::init_metrics();

    let db_path = config.scheduler_db_path();
    info!("Opening scheduler database at {:?}...", db_path);
    let store: Arc<dyn SchedulerStore> = Arc::new(SqliteSchedulerStore::new(&db_path)?);

    let settings = config.scheduler.clone();
    let scheduler = Scheduler::new(Arc::clone(&store), &config.node_id, settings.clone());
    scheduler
        .register_builtin_tasks(host_handlers(&store, &config.node_id, settings.cluster))
        .await?;
    scheduler.apply_task_flags(&settings.task_enabled).await;
    scheduler.set_timezone(&settings.timezone).await;
    scheduler.set_catch_up_window(settings.catch_up_window).await;
    scheduler.start()?;

    info!(
        "Node {} scheduling {} tasks",
        scheduler.node_id(),
        scheduler.get_tasks().await.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received Ctrl+C, shutting down...");

    scheduler.stop().await;
    debug!("Final metrics:\n{}", metrics::render_metrics());
    Ok(())
}
