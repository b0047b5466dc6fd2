//! homewatt collector
//!
//! Polls home-energy and climate devices on independent schedules, keeps the
//! latest record of each in a shared [`StateCache`](homewatt_state::StateCache)
//! and persists every record to TimescaleDB.

pub mod api;
pub mod config;
pub mod devices;
pub mod lifecycle;
pub mod metrics;
pub mod module;
pub mod polling;
pub mod runtime;
pub mod sink;
pub mod updater;

pub use config::CollectorConfig;
pub use lifecycle::ModuleState;
pub use metrics::CollectorMetrics;
pub use module::{DeviceClient, Initializable, Module, Named, Startable};
pub use polling::PollingModule;
pub use sink::{DiscardSink, RecordSink, TimescaleSink, TimescaleWriter};
pub use updater::{PollingUpdater, UpdateAction};
