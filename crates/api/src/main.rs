use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fusion_api::config::ServerConfig;
use fusion_api::router::build_app_router;
use fusion_api::state::AppState;
use fusion_core::config::ConfigError;
use fusion_engine::{DreamManager, EngineConfig, EngineError, ManagerDeps};
use fusion_events::BroadcastHub;
use fusion_worker::{WorkerConfig, WorkerSupervisor};

const DEFAULT_LOG_FILTER: &str =
    "fusion_api=info,fusion_engine=info,fusion_worker=info,tower_http=info";

/// Anything that stops the server from coming up.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to load settings: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid HOST address: {0}")]
    Addr(#[from] AddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Configuration (needed before tracing to pick the log format) ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fusion-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), StartupError> {
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let engine_config = EngineConfig::from_env()?;
    tokio::fs::create_dir_all(engine_config.images_dir()).await?;
    tracing::info!(data_dir = %engine_config.data_dir.display(), "Using data directory");

    // --- Database ---
    let pool = fusion_db::create_pool(&engine_config.database_url).await?;
    fusion_db::health_check(&pool).await?;
    fusion_db::run_migrations(&pool).await?;
    tracing::info!("Database ready");

    // --- Settings and devices ---
    let devices = engine_config.device_set();
    let settings = DreamManager::load_settings(&pool, &devices).await?;
    tracing::info!(
        devices = ?devices.names(),
        ready = settings.is_ready(&engine_config.data_dir, &devices),
        "Settings loaded"
    );

    // --- Worker ---
    let hub = Arc::new(BroadcastHub::default());
    let worker_config = WorkerConfig::from_env(&engine_config.data_dir)?;
    tracing::info!(program = %worker_config.program.display(), "Worker configured");
    let worker = WorkerSupervisor::start(worker_config, settings.clone(), Arc::clone(&hub));

    // --- Dream manager ---
    let manager = DreamManager::new(
        ManagerDeps {
            worker,
            hub,
            pool: pool.clone(),
            data_dir: engine_config.data_dir.clone(),
            devices,
        },
        settings,
    );

    // --- Router ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        manager: Arc::clone(&manager),
    };
    let app = build_app_router(state, &config)?;

    // --- Start server ---
    let addr = SocketAddr::new(config.host.parse::<IpAddr>()?, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    manager.shutdown().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix). If a handler cannot
/// be installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
