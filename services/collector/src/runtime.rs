//! Module assembly and process-wide lifecycle
//!
//! Builds one module per configured device, initializes them independently
//! (a failed device is dropped, the rest carry on) and starts and stops the
//! survivors together.

use std::sync::Arc;

use homewatt_link::LinkObserver;
use homewatt_state::StateCache;
use sqlx::postgres::PgPool;
use tracing::{error, info, warn};

use crate::config::CollectorConfig;
use crate::devices::fronius::{FroniusClient, FroniusWriter};
use crate::devices::hafnertec::{HafnertecClient, HafnertecWriter};
use crate::devices::senec::{SenecClient, SenecWriter};
use crate::devices::solvis::{SolvisClient, SolvisUpdater, SolvisWriter};
use crate::devices::weather::{WeatherModule, WeatherWriter};
use crate::metrics::CollectorMetrics;
use crate::module::{Initializable, Module, Named, Startable};
use crate::polling::PollingModule;
use crate::sink::{DiscardSink, RecordSink, TimescaleSink, TimescaleWriter};
use crate::updater::PollingUpdater;

pub type BoxedModule = Box<dyn Module>;

/// TimescaleDB sink when a pool exists, otherwise records are only cached
fn sink_for<R, W>(pool: Option<&PgPool>, writer: W) -> Arc<dyn RecordSink<R>>
where
    R: Send + Sync + 'static,
    W: TimescaleWriter<R>,
{
    match pool {
        Some(pool) => Arc::new(TimescaleSink::new(pool.clone(), writer)),
        None => Arc::new(DiscardSink),
    }
}

/// Construct every configured module in a fixed order
///
/// Nothing touches the network here; connections open in `init()`.
pub fn build_modules(
    config: &CollectorConfig,
    cache: &StateCache,
    metrics: &Arc<CollectorMetrics>,
    pool: Option<&PgPool>,
) -> Vec<BoxedModule> {
    let observer: Arc<dyn LinkObserver> = metrics.clone();
    let mut modules: Vec<BoxedModule> = Vec::new();

    if let Some(fronius) = &config.fronius {
        let client = FroniusClient::new(fronius).with_observer(observer.clone());
        modules.push(Box::new(PollingModule::new(
            client,
            sink_for(pool, FroniusWriter),
            cache.clone(),
            metrics.clone(),
            fronius.poll_interval,
        )));
    }

    if let Some(senec) = &config.senec {
        let client = SenecClient::new(senec).with_observer(observer.clone());
        modules.push(Box::new(PollingModule::new(
            client,
            sink_for(pool, SenecWriter),
            cache.clone(),
            metrics.clone(),
            senec.poll_interval,
        )));
    }

    if let Some(hafnertec) = &config.hafnertec {
        let client = HafnertecClient::new(hafnertec).with_observer(observer.clone());
        modules.push(Box::new(PollingModule::new(
            client,
            sink_for(pool, HafnertecWriter),
            cache.clone(),
            metrics.clone(),
            hafnertec.poll_interval,
        )));
    }

    if let Some(solvis) = &config.solvis {
        let client = SolvisClient::tcp(solvis, Some(observer.clone()));
        let conn = client.connection();
        modules.push(Box::new(PollingModule::new(
            client,
            sink_for(pool, SolvisWriter),
            cache.clone(),
            metrics.clone(),
            solvis.poll_interval,
        )));

        if let Some(updater) = &solvis.updater {
            modules.push(Box::new(PollingUpdater::new(
                SolvisUpdater::new(updater, conn),
                cache.clone(),
                metrics.clone(),
                updater.poll_interval,
            )));
        }
    }

    if let Some(weather) = &config.weather {
        modules.push(Box::new(WeatherModule::new(
            weather,
            sink_for(pool, WeatherWriter),
            cache.clone(),
            metrics.clone(),
        )));
    }

    modules
}

/// Initialize each module, keeping only those that succeeded
pub async fn init_modules(modules: Vec<BoxedModule>) -> Vec<BoxedModule> {
    let mut ready = Vec::with_capacity(modules.len());
    for mut module in modules {
        match module.init().await {
            Ok(()) => ready.push(module),
            Err(e) => error!(
                module = %module.name(),
                code = e.error_code(),
                "Initialization failed, module disabled: {}",
                e
            ),
        }
    }
    ready
}

/// Start every module; one that refuses to start is logged and skipped
pub fn start_modules(modules: &mut [BoxedModule]) -> usize {
    let mut started = 0;
    for module in modules.iter_mut() {
        match module.start() {
            Ok(()) => started += 1,
            Err(e) => warn!(module = %module.name(), "Not started: {}", e),
        }
    }
    info!("{} of {} modules running", started, modules.len());
    started
}

/// Stop every module and wait for its worker
pub async fn abort_modules(modules: &mut [BoxedModule]) {
    for module in modules.iter_mut() {
        module.abort().await;
    }
    info!("All modules stopped");
}
