mod error;
mod handlers;
mod metrics;
mod routes;
mod submitter;

use anyhow::Context;
use axum::Router;
use sandrun_common::config::Config;
use sandrun_common::redis::RedisJobStore;
use sandrun_common::store::JobStore;
use sandrun_engine::docker::DockerEnvironment;
use sandrun_engine::{CodeRunner, DispatchSettings, Dispatcher, LanguageRegistry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::submitter::{DirectSubmitter, QueuedSubmitter, Submitter};

pub struct AppState {
    /// Path used by POST /api/execute, chosen at startup
    pub submitter: Arc<dyn Submitter>,
    pub direct: DirectSubmitter,
    /// `None` when the API started without a reachable queue
    pub store: Option<Arc<dyn JobStore>>,
    pub runner: Arc<dyn CodeRunner>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Sandrun API booting...");

    let config = Config::from_env().context("Invalid configuration")?;

    let registry = LanguageRegistry::load_or_builtin(&config.languages_config)?
        .with_environment_overrides(|name| std::env::var(name).ok());
    info!(languages = ?registry.supported_names(), "Loaded language recipes");

    let docker = DockerEnvironment::connect().context("Failed to connect to Docker")?;
    let runner: Arc<dyn CodeRunner> = Arc::new(Dispatcher::new(
        Arc::new(registry),
        Arc::new(docker),
        DispatchSettings::from_config(&config),
    ));

    let store = connect_queue(&config).await;
    let submitter: Arc<dyn Submitter> = match &store {
        Some(store) => Arc::new(QueuedSubmitter::new(store.clone(), runner.clone())),
        None => Arc::new(DirectSubmitter::new(runner.clone())),
    };
    info!(mode = submitter.mode(), "Submission mode selected");

    let state = Arc::new(AppState {
        submitter,
        direct: DirectSubmitter::new(runner.clone()),
        store,
        runner,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_addr))?;

    info!("HTTP server listening on {}", config.api_addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}

/// Connect to Redis; `None` puts the API in direct mode
async fn connect_queue(config: &Config) -> Option<Arc<dyn JobStore>> {
    let store = match RedisJobStore::connect(&config.redis_url, config.queue_timeout, config.result_ttl).await {
        Ok(store) => store,
        Err(e) => {
            warn!(redis_url = %config.redis_url, error = %e, "Job queue unavailable, executing directly");
            return None;
        }
    };
    if let Err(e) = store.ping().await {
        warn!(redis_url = %config.redis_url, error = %e, "Job queue not answering, executing directly");
        return None;
    }
    info!("Connected to Redis: {}", config.redis_url);
    Some(Arc::new(store))
}
