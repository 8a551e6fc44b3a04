//! Modbus TCP gateway service
//!
//! Serves the shared register memory over Modbus TCP and exposes the HTTP
//! control plane next to it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info, Level};

use common::logging::LogConfig;
use mbsrv::api::{create_api_routes, AppState};
use mbsrv::{AppConfig, DriverManager};

/// Command-line arguments for mbsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mbsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus TCP Gateway Service",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, env = "MBSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - check configuration and point map, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    common::logging::init_with_config(LogConfig {
        service_name: "mbsrv".to_string(),
        level: level.parse().unwrap_or(Level::INFO),
        enable_json: config.logging.json,
        enable_api_log: true,
    })
    .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    if args.validate {
        DriverManager::new(config.clone())?;
        println!("{}", config.to_yaml()?);
        info!("Validation completed successfully");
        return Ok(());
    }

    let api_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid api listen address")?;
    let auto_start = config.lifecycle.auto_start;

    let driver = Arc::new(DriverManager::new(config)?);
    if auto_start {
        // The API stays up so the driver can be started later
        if let Err(e) = driver.start().await {
            error!("Initial driver start failed: {}", e);
        }
    }
    let _watchdog = driver.spawn_watchdog();

    let shutdown = common::shutdown::shutdown_token();
    let app = create_api_routes(AppState::new(driver.clone()));
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API on {}", api_addr))?;
    info!("HTTP API listening on {}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("API server error")?;

    driver.shutdown().await?;
    info!("mbsrv stopped");
    Ok(())
}
