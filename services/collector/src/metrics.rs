//! Prometheus metrics for the collector
//!
//! One `CollectorMetrics` is built in `main` and handed to every module,
//! updater and connection as an `Arc`. Nothing here is global.

use std::time::Instant;

use errors::{HomewattError, HomewattResult};
use homewatt_link::{LinkEvent, LinkObserver};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub struct CollectorMetrics {
    registry: Registry,
    queries_total: IntCounterVec,
    query_latency: HistogramVec,
    starts_total: IntCounter,
    build_info: IntGaugeVec,
    link_events_total: IntCounterVec,
}

fn metric_error(e: prometheus::Error) -> HomewattError {
    HomewattError::Internal(format!("metrics: {}", e))
}

impl CollectorMetrics {
    pub fn new() -> HomewattResult<Self> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("homewatt_queries_total", "Device queries by outcome"),
            &["service", "result"],
        )
        .map_err(metric_error)?;

        let query_latency = HistogramVec::new(
            HistogramOpts::new(
                "homewatt_query_latency_seconds",
                "Duration of one device round-trip",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["service"],
        )
        .map_err(metric_error)?;

        let starts_total = IntCounter::new("homewatt_starts_total", "Process starts")
            .map_err(metric_error)?;

        let build_info = IntGaugeVec::new(
            Opts::new("homewatt_build_info", "Build information"),
            &["version"],
        )
        .map_err(metric_error)?;

        let link_events_total = IntCounterVec::new(
            Opts::new(
                "homewatt_link_events_total",
                "Connection lifecycle events (init, reinit, failures)",
            ),
            &["connection", "event"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(queries_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(query_latency.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(starts_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(build_info.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(link_events_total.clone()))
            .map_err(metric_error)?;

        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        Ok(Self {
            registry,
            queries_total,
            query_latency,
            starts_total,
            build_info,
            link_events_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Begin timing one query for `service`; counted as a failure unless
    /// [`QueryTimer::success`] is called before the timer drops
    pub fn start_query(&self, service: &str) -> QueryTimer<'_> {
        QueryTimer {
            metrics: self,
            service: service.to_string(),
            started: Instant::now(),
            succeeded: false,
        }
    }

    pub fn record_start(&self) {
        self.starts_total.inc();
    }

    pub fn query_count(&self, service: &str, result: &str) -> u64 {
        self.queries_total
            .with_label_values(&[service, result])
            .get()
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> HomewattResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| HomewattError::Internal(e.to_string()))
    }

    #[cfg(test)]
    fn build_version(&self) -> i64 {
        self.build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .get()
    }
}

impl LinkObserver for CollectorMetrics {
    fn on_event(&self, connection: &str, event: LinkEvent) {
        self.link_events_total
            .with_label_values(&[connection, event.as_str()])
            .inc();
    }
}

impl std::fmt::Debug for CollectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorMetrics").finish_non_exhaustive()
    }
}

/// Scoped query timer, records latency and outcome on drop
pub struct QueryTimer<'a> {
    metrics: &'a CollectorMetrics,
    service: String,
    started: Instant,
    succeeded: bool,
}

impl QueryTimer<'_> {
    pub fn success(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for QueryTimer<'_> {
    fn drop(&mut self) {
        let result = if self.succeeded { "success" } else { "failure" };
        self.metrics
            .queries_total
            .with_label_values(&[&self.service, result])
            .inc();
        self.metrics
            .query_latency
            .with_label_values(&[&self.service])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_timer_counts_outcomes() {
        let metrics = CollectorMetrics::new().unwrap();
        {
            let mut timer = metrics.start_query("fronius");
            timer.success();
        }
        {
            let _timer = metrics.start_query("fronius");
        }
        {
            let _timer = metrics.start_query("fronius");
        }

        assert_eq!(metrics.query_count("fronius", "success"), 1);
        assert_eq!(metrics.query_count("fronius", "failure"), 2);
        assert_eq!(
            metrics
                .query_latency
                .with_label_values(&["fronius"])
                .get_sample_count(),
            3
        );
    }

    #[test]
    fn test_render_exposition() {
        let metrics = CollectorMetrics::new().unwrap();
        metrics.record_start();
        metrics.start_query("senec").success();
        metrics.on_event("solvis", LinkEvent::Reinitialized);

        let text = metrics.render().unwrap();
        assert!(text.contains("homewatt_starts_total 1"));
        assert!(text.contains("homewatt_queries_total"));
        assert!(text.contains("homewatt_query_latency_seconds_bucket"));
        assert!(text.contains("event=\"reinitialized\""));
        assert_eq!(metrics.build_version(), 1);
    }

    #[test]
    fn test_registries_are_independent() {
        let a = CollectorMetrics::new().unwrap();
        let b = CollectorMetrics::new().unwrap();
        a.record_start();
        assert!(a.render().unwrap().contains("homewatt_starts_total 1"));
        assert!(b.render().unwrap().contains("homewatt_starts_total 0"));
    }
}
