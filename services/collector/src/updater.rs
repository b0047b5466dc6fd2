//! Periodic actions driven by cached state
//!
//! An updater shares the polling module's schedule (absolute ticks, missed
//! ticks skipped, failures logged) but reads from the state cache and pushes
//! something outward instead of persisting a record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::HomewattResult;
use homewatt_state::StateCache;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::lifecycle::{ModuleState, Worker};
use crate::metrics::CollectorMetrics;
use crate::module::{Initializable, Named, Startable};

#[async_trait]
pub trait UpdateAction: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self) -> HomewattResult<()>;

    async fn apply(&self, cache: &StateCache) -> HomewattResult<()>;
}

pub struct PollingUpdater<A: UpdateAction> {
    shared: Arc<UpdaterShared<A>>,
    interval: Duration,
    worker: Worker,
}

struct UpdaterShared<A> {
    action: A,
    cache: StateCache,
    metrics: Arc<CollectorMetrics>,
}

impl<A: UpdateAction> UpdaterShared<A> {
    async fn update_once(&self) -> HomewattResult<()> {
        let mut timer = self.metrics.start_query(self.action.name());
        self.action.apply(&self.cache).await?;
        timer.success();
        Ok(())
    }
}

impl<A: UpdateAction> PollingUpdater<A> {
    pub fn new(action: A, cache: StateCache, metrics: Arc<CollectorMetrics>, interval: Duration) -> Self {
        let worker = Worker::new(action.name());
        Self {
            shared: Arc::new(UpdaterShared {
                action,
                cache,
                metrics,
            }),
            interval,
            worker,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.worker.state()
    }

    pub async fn update_once(&self) -> HomewattResult<()> {
        self.shared.update_once().await
    }
}

async fn run_loop<A: UpdateAction>(shared: Arc<UpdaterShared<A>>, interval: Duration, cancel: CancellationToken) {
    let name = shared.action.name().to_string();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(updater = %name, "Updating every {:?}", interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        match shared.update_once().await {
            Ok(()) => debug!(updater = %name, "Update applied"),
            Err(e) => error!(updater = %name, code = e.error_code(), "Update failed: {}", e),
        }
    }
}

impl<A: UpdateAction> Named for PollingUpdater<A> {
    fn name(&self) -> &str {
        self.shared.action.name()
    }
}

#[async_trait]
impl<A: UpdateAction> Initializable for PollingUpdater<A> {
    async fn init(&mut self) -> HomewattResult<()> {
        self.shared.action.init().await?;
        self.worker.mark_initialized();
        Ok(())
    }
}

#[async_trait]
impl<A: UpdateAction> Startable for PollingUpdater<A> {
    fn start(&mut self) -> HomewattResult<()> {
        let shared = self.shared.clone();
        let interval = self.interval;
        self.worker
            .spawn(move |cancel| run_loop(shared, interval, cancel))
    }

    async fn abort(&mut self) {
        self.worker.abort().await;
    }

    async fn wait(&mut self) {
        self.worker.wait().await;
    }
}
