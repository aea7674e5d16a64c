use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

mod config;
mod error;
mod events;
mod http;
mod logging;
mod model;
mod processor;
mod prompt;
mod ratelimit;
mod registry;
mod report;
mod runner;
mod service;
mod settings;
mod store;

use config::{Args, Config};
use events::EventHub;
use http::AppState;
use model::ProcessorState;
use processor::Processor;
use ratelimit::RateLimitManager;
use registry::ProcessRegistry;
use service::InvestigationService;
use settings::SettingsManager;
use store::IssueStore;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(event = "fatal", error = %err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::resolve(Args::parse());
    let _log_guard = logging::init(&config.log_dir, "opsdeck-triage");

    let store = Arc::new(
        IssueStore::open(config.issues_dir.clone())
            .with_context(|| format!("open issue store at {}", config.issues_dir.display()))?,
    );
    let registry = Arc::new(ProcessRegistry::new());
    let events = Arc::new(EventHub::new());
    let settings = Arc::new(SettingsManager::load(config.agent_settings_path.clone()));
    let ratelimit = Arc::new(RateLimitManager::new(store.clone()));
    let processor_state = Arc::new(StdMutex::new(ProcessorState::default()));

    let service = InvestigationService::new(
        store,
        registry,
        events,
        settings,
        ratelimit,
        processor_state.clone(),
        config.clone(),
    );
    let processor = Arc::new(Processor::new(processor_state, service.clone()));
    tokio::spawn(processor.clone().run_loop());

    let state = Arc::new(AppState {
        service,
        processor,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(event = "triage_start", addr = %config.bind_addr, issues_dir = %config.issues_dir.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "triage_shutdown");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve")?;
    Ok(())
}
