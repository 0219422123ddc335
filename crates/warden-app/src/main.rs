//! Warden - policy core of an intercepting TLS/HTTP proxy.
//!
//! Runs the proxy with the configured policy service, an in-memory policy
//! store seeded from the config file, and a SQLite activity log.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_core::{ActivityLog, FanoutActivityLog, TracingActivityLog, WardenConfig};
use warden_proxy::{HttpPolicyApi, ProxyConfig, ProxyServer};
use warden_storage::{MemoryStore, PolicyView, SqliteActivityLog};

/// How often expired policy keys are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Warden intercepting proxy
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Config file (TOML). Defaults to warden.toml in the platform config dir.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "warden", "Warden")
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warden={0},warden_core={0},warden_proxy={0},warden_storage={0},warn",
            log_level
        ))
    });

    let log_dir = project_dirs().map(|dirs| dirs.data_dir().join("logs"));
    if let Some(log_dir) = log_dir.filter(|_| !args.no_log_file) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("warden")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    if !args.no_log_file {
        tracing::warn!("File logging unavailable, using console only");
    }
    None
}

/// Reads the config named on the command line, else the default file if it
/// exists, else built-in defaults.
fn load_config(args: &Args) -> anyhow::Result<WardenConfig> {
    let path = args.config.clone().or_else(|| {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("warden.toml"))
            .filter(|p| p.exists())
    });

    let mut config = match path {
        Some(path) => WardenConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            tracing::info!("No config file, using defaults");
            WardenConfig::default()
        }
    };

    if let Some(listen) = args.listen {
        config = config.with_listen_addr(listen);
    }
    config.validate()?;
    Ok(config)
}

/// Tracing always; SQLite when the database opens.
fn activity_log(config: &WardenConfig) -> (Arc<dyn ActivityLog>, Option<SqliteActivityLog>) {
    let fanout = FanoutActivityLog::new().with_sink(Arc::new(TracingActivityLog));

    let sqlite = match &config.activity_db {
        Some(path) => SqliteActivityLog::with_path(path),
        None => SqliteActivityLog::new(),
    };
    match sqlite {
        Ok(log) => (Arc::new(fanout.with_sink(Arc::new(log.clone()))), Some(log)),
        Err(e) => {
            tracing::warn!("Activity database unavailable, logging only: {}", e);
            (Arc::new(fanout), None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Warden...");
    tracing::debug!("Args: {:?}", args);

    let config = Arc::new(load_config(&args)?);

    let store = Arc::new(MemoryStore::new());
    let policy = PolicyView::new(store.clone(), config.default_security_level);
    for client in &config.clients {
        policy.seed_client(client);
        tracing::info!("Seeded policy for client {}", client.addr);
    }

    let (activity, activity_db) = activity_log(&config);
    let retention = chrono::Duration::days(i64::from(config.activity_retention_days));

    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purged = purge_store.purge_expired();
            if purged > 0 {
                tracing::debug!("Purged {} expired policy keys", purged);
            }
            if let Some(db) = &activity_db {
                if let Err(e) = db.prune(retention) {
                    tracing::warn!("Failed to prune activity database: {}", e);
                }
            }
        }
    });

    let api = Arc::new(HttpPolicyApi::new(&config.api)?);
    tracing::info!("Policy service at {}", api.base_url());

    let proxy_config = ProxyConfig::new(config.clone(), policy, api, activity)?;
    let server = ProxyServer::new(proxy_config)?;
    tracing::info!("CA certificate: {:?}", server.ca_cert_path());

    let handle = server.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Warden shutting down");
    handle.stop().await;
    Ok(())
}
