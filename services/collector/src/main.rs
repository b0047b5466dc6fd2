//! homewatt collector service

use std::sync::Arc;

use anyhow::Context;
use common::{wait_for_shutdown, Parser, ServiceArgs};
use homewatt_state::StateCache;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use collector::api::{self, ApiState};
use collector::runtime::{abort_modules, build_modules, init_modules, start_modules};
use collector::sink::connect_lazy;
use collector::{CollectorConfig, CollectorMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();
    common::logging::init_with_config(args.log_config("collector"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "homewatt collector {} loading {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );
    let mut config = CollectorConfig::load(&args.config)?;
    if let Some(listen) = &args.status_listen {
        config.service.status_listen = listen.clone();
    }
    config.validate()?;

    if args.validate {
        info!(
            "Configuration valid: {} module(s): {}",
            config.module_names().len(),
            config.module_names().join(", ")
        );
        return Ok(());
    }

    let metrics = Arc::new(CollectorMetrics::new()?);
    metrics.record_start();
    let cache = StateCache::new();

    let pool = match &config.timescaledb {
        Some(db) => Some(connect_lazy(db)?),
        None => {
            warn!("No timescaledb section configured, records are cached only");
            None
        },
    };

    let modules = build_modules(&config, &cache, &metrics, pool.as_ref());
    let mut modules = init_modules(modules).await;
    if modules.is_empty() {
        warn!("No module initialized successfully");
    }
    start_modules(&mut modules);

    let listener = TcpListener::bind(&config.service.status_listen)
        .await
        .with_context(|| format!("Failed to bind status API to {}", config.service.status_listen))?;
    info!("Status API listening on {}", config.service.status_listen);

    let app = api::router(ApiState {
        cache: cache.clone(),
        metrics: metrics.clone(),
    });
    let stop = CancellationToken::new();
    let server = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let shutdown = async move { stop.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("Status API failed: {}", e);
            }
        })
    };

    let signal = wait_for_shutdown().await;
    info!("Received {}, shutting down", signal);

    abort_modules(&mut modules).await;
    stop.cancel();
    if let Err(e) = server.await {
        warn!("Status API task ended abnormally: {}", e);
    }
    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("Collector stopped");
    Ok(())
}
