//! Module capabilities
//!
//! A module is anything the entrypoint can initialize, start and stop: a
//! polling module driving a [`DeviceClient`], an updater, or a push receiver.
//! Device code only implements [`DeviceClient`] (or [`crate::updater::UpdateAction`]);
//! scheduling, persistence and caching live in the generic wrappers.

use async_trait::async_trait;
use errors::HomewattResult;
use serde::Serialize;

/// Stable identifier, also the state cache key
pub trait Named {
    fn name(&self) -> &str;
}

#[async_trait]
pub trait Initializable {
    /// Prepare persistence and connect; must succeed before `start()`
    async fn init(&mut self) -> HomewattResult<()>;
}

#[async_trait]
pub trait Startable {
    /// Spawn the module's single worker task
    fn start(&mut self) -> HomewattResult<()>;

    /// Request a cooperative stop and wait for the worker to exit.
    /// Calling it again is a no-op.
    async fn abort(&mut self);

    /// Wait for the worker to exit without requesting a stop
    async fn wait(&mut self);
}

/// Everything the entrypoint needs from a module
pub trait Module: Named + Initializable + Startable + Send {}

impl<T> Module for T where T: Named + Initializable + Startable + Send {}

/// One external device producing typed records
///
/// `query()` performs exactly one round-trip (possibly several requests
/// merged into one record). Transport and payload failures come back as
/// errors; they never panic out of the call.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    type Record: Serialize + Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn init(&self) -> HomewattResult<()>;

    async fn query(&self) -> HomewattResult<Self::Record>;
}
