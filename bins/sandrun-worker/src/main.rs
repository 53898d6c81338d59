mod health;
mod pool;

use anyhow::Context;
use sandrun_common::config::Config;
use sandrun_common::redis::RedisJobStore;
use sandrun_engine::docker::DockerEnvironment;
use sandrun_engine::{DispatchSettings, Dispatcher, Environment, LanguageRegistry};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pool::WorkerPool;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Sandrun Worker booting...");

    let config = Config::from_env().context("Invalid configuration")?;

    let registry = LanguageRegistry::load_or_builtin(&config.languages_config)
        .map_err(|e| {
            error!("Failed to load language configurations: {:#}", e);
            e
        })?
        .with_environment_overrides(|name| std::env::var(name).ok());
    info!(languages = ?registry.supported_names(), "Loaded language recipes");

    let environment: Arc<dyn Environment> =
        Arc::new(DockerEnvironment::connect().context("Failed to connect to Docker")?);
    probe_environments(&registry, environment.as_ref()).await;

    let store = RedisJobStore::connect(&config.redis_url, config.queue_timeout, config.result_ttl)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    info!("Connected to Redis: {}", config.redis_url);

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        environment,
        DispatchSettings::from_config(&config),
    );
    let pool = WorkerPool::new(Arc::new(store), Arc::new(dispatcher), config.worker_concurrency);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = tokio::spawn(health::serve(
        config.worker_health_addr.clone(),
        pool.stats(),
        pool.size(),
        shutdown_rx.clone(),
    ));

    let workers = pool.spawn(shutdown_rx);
    info!(
        workers = pool.size(),
        timeout_secs = config.execution_timeout.as_secs(),
        "Ready to execute jobs"
    );

    signal::ctrl_c().await.context("Failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, finishing jobs in hand...");
    let _ = shutdown_tx.send(true);

    futures_util::future::join_all(workers).await;
    match health.await {
        Ok(Err(e)) => warn!(error = %e, "Health endpoint stopped with an error"),
        Err(e) => warn!(error = %e, "Health endpoint task failed"),
        Ok(Ok(())) => {}
    }

    let stats = pool.stats().snapshot();
    info!(claimed = stats.claimed, completed = stats.completed, "Worker shutdown complete");
    Ok(())
}

/// Warn about configured environments that are not reachable; the worker still starts
async fn probe_environments(registry: &LanguageRegistry, environment: &dyn Environment) {
    for recipe in registry.recipes() {
        for id in &recipe.environments {
            match environment.probe(id).await {
                Ok(()) => info!(language = %recipe.language, environment = %id, "Environment ready"),
                Err(e) => warn!(language = %recipe.language, environment = %id, error = %e, "Environment unavailable"),
            }
        }
    }
}
