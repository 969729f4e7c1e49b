//! PerovDash - live metrics dashboard for the 10k Perovskites collection
//!
//! Serves a single-page dashboard and a JSON endpoint whose metrics are
//! recomputed from the BigQuery warehouse on every request.
//!
//! Exit codes:
//!   0 - Clean shutdown
//!   1 - Startup error (bad config, cannot bind, etc.)

mod api;
mod auth;
mod cli;
mod config;
mod metrics;
mod models;
#[cfg(test)]
mod test_support;
mod warehouse;

use anyhow::{Context, Result};
use api::AppState;
use auth::AuthGate;
use cli::Args;
use config::{Config, CONFIG_FILE};
use metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use warehouse::{BigQueryClient, QueryCatalog, Warehouse};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // No logging needed to write a file
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("PerovDash v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run_server(args).await {
        error!("Server failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle --init-config: generate a default .perovdash.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to set the warehouse project, limits and ORCID login.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Build everything from the merged config and serve until Ctrl-C.
async fn run_server(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let catalog = QueryCatalog::new(&config.catalog_params())?;
    info!(
        "Query catalogue ready: {} queries against {}",
        catalog.queries().len(),
        config.warehouse.table_prefix
    );

    let warehouse: Arc<dyn Warehouse> = Arc::new(BigQueryClient::new(config.bigquery())?);
    let collector = MetricsCollector::new(
        catalog,
        config.shape_limits(),
        Duration::from_secs(config.warehouse.timeout_seconds),
    );

    let gate = AuthGate::from_config(&config.auth)?;
    if gate.is_some() {
        info!("ORCID login enabled for the dashboard page");
    }

    let state = AppState {
        warehouse,
        collector: Arc::new(collector),
        refresh_interval_seconds: config.server.refresh_interval_seconds,
        auth: gate,
    };

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    println!("📊 Dashboard listening on http://{}", config.server.bind);
    println!("   Warehouse: {}", config.warehouse.billing_project);
    println!("   Refresh: every {}s", config.server.refresh_interval_seconds);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
