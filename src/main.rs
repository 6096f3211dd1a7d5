//! keymanager server binary
//!
//! # Usage
//!
//! ```bash
//! # Start the server
//! KEYMANAGER_MASTER_PASSWORD=your_password keymanager
//!
//! # Or with a config file
//! keymanager --config /etc/keymanager/config.toml
//! ```

use clap::Parser;
use keymanager::api::{router, AppState, AuthService};
use keymanager::config::{Config, LoggingConfig};
use keymanager::keystore::{Eip2335Decryptor, KeyLoader, KeyStore};
use keymanager::persistence::FileStore;
use keymanager::security::disable_core_dumps;
use keymanager::slashing::SlashingProtectionStore;
use keymanager::{KeyManager, KeyManagerError, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "keymanager", version, about = "Validator key manager")]
struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, env = "KEYMANAGER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    init_logging(&config.logging);
    info!("Starting keymanager v{}", VERSION);

    if config.security.disable_core_dumps {
        if let Err(e) = disable_core_dumps() {
            warn!("Could not disable core dumps: {}", e);
        }
    }

    let master_password = config.master_password()?;
    let genesis_validators_root = config.genesis_validators_root()?;

    // Stores
    let key_files = Arc::new(FileStore::open(&config.storage.keys_dir)?);
    let record_files = Arc::new(FileStore::open(&config.storage.slashing_dir)?);

    let slashing = Arc::new(SlashingProtectionStore::open(
        record_files,
        genesis_validators_root,
    )?);
    info!(
        "Slashing protection loaded: {} records for genesis root {}",
        slashing.len(),
        genesis_validators_root
    );

    let key_store = Arc::new(KeyStore::new(
        key_files.clone(),
        master_password,
        config.kdf_cost(),
    ));

    // Keys from previous runs, then operator-managed readonly keystores
    let decryptor = Arc::new(Eip2335Decryptor);
    let loader = KeyLoader::new(
        key_files,
        key_store.clone(),
        slashing.clone(),
        decryptor.clone(),
    );

    info!("Loading keys from {:?}", config.storage.keys_dir);
    let loaded = loader.load_persisted()?;
    info!("Loaded {} keys into memory", loaded.len());

    if let (Some(keystores_dir), Some(secrets_dir)) =
        (&config.readonly.keystores_dir, &config.readonly.secrets_dir)
    {
        let readonly = loader.load_readonly(keystores_dir, secrets_dir)?;
        info!("Loaded {} readonly keys from {:?}", readonly.len(), keystores_dir);
    }

    let manager = Arc::new(KeyManager::new(key_store, slashing, decryptor));

    let auth_service = if config.auth.enabled {
        Arc::new(AuthService::load_or_create(&config.auth.token_path)?)
    } else {
        Arc::new(AuthService::disabled())
    };
    if !auth_service.is_auth_required() {
        warn!("API authentication is disabled");
    }

    let state = Arc::new(AppState::new(manager, auth_service));
    let app = router(state, config.server.max_body_bytes);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        KeyManagerError::ConfigError(format!("Cannot listen on {}: {}", addr, e))
    })?;

    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| KeyManagerError::InternalError(e.to_string()))?;

    info!("Server shut down gracefully");
    Ok(())
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
