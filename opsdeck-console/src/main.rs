use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

mod client;
mod config;
mod error;
mod http;
mod logging;
mod manager;
mod metrics;
mod replay;
mod session;
mod transcript;
mod workspace;

use config::{Args, Config};
use http::AppState;
use manager::SessionManager;
use metrics::Metrics;
use workspace::WorkspaceStore;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::resolve(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = logging::init(&config.log_dir, "opsdeck-console");

    if let Err(err) = std::fs::create_dir_all(&config.storage_path) {
        error!(event = "storage_create_failed", error = %err, path = %config.storage_path.display());
        std::process::exit(1);
    }

    let metrics = Arc::new(Metrics::new());
    let manager = SessionManager::new(config.clone(), metrics.clone());
    let workspace = match WorkspaceStore::load(
        config.storage_path.join("workspace.json"),
        manager.idle_timeout_handle(),
    ) {
        Ok(workspace) => workspace,
        Err(err) => {
            error!(event = "workspace_load_failed", error = %err);
            std::process::exit(1);
        }
    };
    manager.set_detach_hook(workspace.clone()).await;

    let state = Arc::new(AppState {
        manager: manager.clone(),
        workspace,
        metrics,
        expect_proxy: config.expect_proxy,
    });
    let app = http::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", addr = %config.bind_addr, error = %err);
            std::process::exit(1);
        }
    };
    info!(event = "console_start", addr = %config.bind_addr, max_concurrent = config.max_concurrent);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "console_shutdown");
    };
    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "serve_error", error = %err);
    }

    manager.close_all().await;
}
