//! Fixed-interval polling module
//!
//! `PollingModule` turns any [`DeviceClient`] into a [`Module`](crate::module::Module).
//! The worker wakes on absolute ticks (`start + n * interval`). A cycle that
//! overruns the interval is followed by one immediate cycle and the missed
//! ticks are dropped rather than replayed. Each successful record is written
//! to the state cache under the client's name first, then handed to the sink.
//! Failures of any kind are logged and the loop carries on with the next tick.

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
use crate::module::{DeviceClient, Initializable, Named, Startable};
use crate::sink::RecordSink;

pub struct PollingModule<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    shared: Arc<PollingShared<C, S>>,
    interval: Duration,
    worker: Worker,
}

struct PollingShared<C, S> {
    client: C,
    sink: S,
    cache: StateCache,
    metrics: Arc<CollectorMetrics>,
}

impl<C, S> PollingShared<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    async fn poll_once(&self) -> HomewattResult<()> {
        let name = self.client.name();

        let record = {
            let mut timer = self.metrics.start_query(name);
            let record = self.client.query().await?;
            timer.success();
            record
        };

        self.cache.put_json(name, &record)?;
        self.sink.write(&record).await
    }
}

impl<C, S> PollingModule<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    pub fn new(
        client: C,
        sink: S,
        cache: StateCache,
        metrics: Arc<CollectorMetrics>,
        interval: Duration,
    ) -> Self {
        let worker = Worker::new(client.name());
        Self {
            shared: Arc::new(PollingShared {
                client,
                sink,
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

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn client(&self) -> &C {
        &self.shared.client
    }

    /// One query, cache update and sink write, outside the timer loop
    pub async fn poll_once(&self) -> HomewattResult<()> {
        self.shared.poll_once().await
    }
}

async fn run_loop<C, S>(shared: Arc<PollingShared<C, S>>, interval: Duration, cancel: CancellationToken)
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    let name = shared.client.name().to_string();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(module = %name, "Polling every {:?}", interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        // The query itself is never interrupted; a stop request is seen
        // once the cycle has finished.
        match shared.poll_once().await {
            Ok(()) => debug!(module = %name, "Poll cycle complete"),
            Err(e) => error!(module = %name, code = e.error_code(), "Poll cycle failed: {}", e),
        }
    }

    debug!(module = %name, "Polling loop exited");
}

impl<C, S> Named for PollingModule<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    fn name(&self) -> &str {
        self.shared.client.name()
    }
}

#[async_trait]
impl<C, S> Initializable for PollingModule<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
    async fn init(&mut self) -> HomewattResult<()> {
        self.shared.sink.prepare().await?;
        self.shared.client.init().await?;
        self.worker.mark_initialized();
        info!(module = %self.shared.client.name(), "Initialized");
        Ok(())
    }
}

#[async_trait]
impl<C, S> Startable for PollingModule<C, S>
where
    C: DeviceClient,
    S: RecordSink<C::Record>,
{
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
