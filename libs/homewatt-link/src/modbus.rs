//! Modbus/TCP connection wrapper
//!
//! The wrapper owns at most one live session. `execute()` takes the lock,
//! runs the liveness probe, reconnects once if the probe fails, and then runs
//! the callback against the session, all inside one critical section. A
//! concurrent `execute()` can never observe a half-torn-down session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{HomewattError, HomewattResult};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::{notify, ConnectionState, LinkEvent, LinkObserver};

/// Register read used to check that a session is still alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LivenessProbe {
    pub address: u16,
    #[serde(default = "default_probe_count")]
    pub count: u16,
}

fn default_probe_count() -> u16 {
    2
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    0xFF
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusSettings {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// No probe means the session is assumed live
    #[serde(default)]
    pub probe: Option<LivenessProbe>,
    #[serde(default)]
    pub retry: BackoffPolicy,
    /// Applies to connect and to every register operation
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ModbusSettings {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            unit_id: default_unit_id(),
            probe: None,
            retry: BackoffPolicy::default(),
            timeout: default_timeout(),
        }
    }

    pub fn with_probe(mut self, address: u16, count: u16) -> Self {
        self.probe = Some(LivenessProbe { address, count });
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Register operations available to `execute()` callbacks
#[async_trait]
pub trait ModbusSession: Send {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> HomewattResult<Vec<u16>>;

    async fn read_input_registers(&mut self, address: u16, count: u16) -> HomewattResult<Vec<u16>>;

    async fn write_single_register(&mut self, address: u16, value: u16) -> HomewattResult<()>;

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> HomewattResult<()>;
}

/// Opens sessions; dropping a session closes it
#[async_trait]
pub trait ModbusConnector: Send + Sync {
    type Session: ModbusSession + 'static;

    async fn connect(&self, settings: &ModbusSettings) -> HomewattResult<Self::Session>;
}

/// tokio-modbus TCP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

pub struct TcpSession {
    ctx: tokio_modbus::client::Context,
    endpoint: String,
    timeout: Duration,
}

impl TcpSession {
    fn op_error(&self, op: &str, e: std::io::Error) -> HomewattError {
        HomewattError::Modbus(format!("{}: {} failed: {}", self.endpoint, op, e))
    }
}

#[async_trait]
impl ModbusConnector for TcpConnector {
    type Session = TcpSession;

    async fn connect(&self, settings: &ModbusSettings) -> HomewattResult<TcpSession> {
        let endpoint = settings.endpoint();
        let addr: SocketAddr = tokio::net::lookup_host((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| HomewattError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: format!("cannot resolve host: {}", e),
            })?
            .next()
            .ok_or_else(|| HomewattError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: "host resolved to no address".to_string(),
            })?;

        debug!("Connecting to Modbus TCP server at {}", addr);
        let ctx = match timeout(
            settings.timeout,
            tokio_modbus::client::tcp::connect_slave(addr, Slave(settings.unit_id)),
        )
        .await
        {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                return Err(HomewattError::ConnectionFailed {
                    endpoint,
                    reason: e.to_string(),
                })
            },
            Err(_) => return Err(HomewattError::Timeout(endpoint)),
        };

        Ok(TcpSession {
            ctx,
            endpoint,
            timeout: settings.timeout,
        })
    }
}

#[async_trait]
impl ModbusSession for TcpSession {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> HomewattResult<Vec<u16>> {
        let outcome = timeout(self.timeout, self.ctx.read_holding_registers(address, count)).await;
        match outcome {
            Ok(result) => result.map_err(|e| self.op_error("read holding registers", e)),
            Err(_) => Err(HomewattError::Timeout(self.endpoint.clone())),
        }
    }

    async fn read_input_registers(&mut self, address: u16, count: u16) -> HomewattResult<Vec<u16>> {
        let outcome = timeout(self.timeout, self.ctx.read_input_registers(address, count)).await;
        match outcome {
            Ok(result) => result.map_err(|e| self.op_error("read input registers", e)),
            Err(_) => Err(HomewattError::Timeout(self.endpoint.clone())),
        }
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> HomewattResult<()> {
        let outcome = timeout(self.timeout, self.ctx.write_single_register(address, value)).await;
        match outcome {
            Ok(result) => result.map_err(|e| self.op_error("write single register", e)),
            Err(_) => Err(HomewattError::Timeout(self.endpoint.clone())),
        }
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> HomewattResult<()> {
        let outcome = timeout(self.timeout, self.ctx.write_multiple_registers(address, values)).await;
        match outcome {
            Ok(result) => result.map_err(|e| self.op_error("write multiple registers", e)),
            Err(_) => Err(HomewattError::Timeout(self.endpoint.clone())),
        }
    }
}

struct ModbusState<S> {
    /// Set by the first successful `init()`, never cleared
    initialized: bool,
    session: Option<S>,
    state: ConnectionState,
}

/// Mutex-guarded Modbus session with probe-driven reconnect
pub struct ModbusConnection<C: ModbusConnector = TcpConnector> {
    settings: ModbusSettings,
    connector: C,
    inner: Mutex<ModbusState<C::Session>>,
    observer: Option<Arc<dyn LinkObserver>>,
}

impl ModbusConnection<TcpConnector> {
    pub fn tcp(settings: ModbusSettings) -> Self {
        Self::with_connector(settings, TcpConnector)
    }
}

impl<C: ModbusConnector> ModbusConnection<C> {
    pub fn with_connector(settings: ModbusSettings, connector: C) -> Self {
        Self {
            settings,
            connector,
            inner: Mutex::new(ModbusState {
                initialized: false,
                session: None,
                state: ConnectionState::Uninitialized,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ModbusSettings {
        &self.settings
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Connect using the retry policy; a no-op while a session is live
    pub async fn init(&self) -> HomewattResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            return Ok(());
        }
        match self.connect(&mut inner).await {
            Ok(()) => {
                inner.initialized = true;
                notify(&self.observer, &self.settings.name, LinkEvent::Initialized);
                Ok(())
            },
            Err(e) => {
                notify(&self.observer, &self.settings.name, LinkEvent::InitFailed);
                Err(e)
            },
        }
    }

    async fn connect(&self, inner: &mut ModbusState<C::Session>) -> HomewattResult<()> {
        inner.state = ConnectionState::Initializing;
        inner.session = None;

        let result =
            retry_with_backoff(&self.settings.retry, || self.connector.connect(&self.settings)).await;

        match result {
            Ok(session) => {
                info!(
                    "[{}] Modbus connection to {} established",
                    self.settings.name,
                    self.settings.endpoint()
                );
                inner.session = Some(session);
                inner.state = ConnectionState::Ready;
                Ok(())
            },
            Err(e) => {
                warn!(
                    "[{}] Unable to connect to {}: {}",
                    self.settings.name,
                    self.settings.endpoint(),
                    e
                );
                inner.state = ConnectionState::Failed;
                Err(e)
            },
        }
    }

    /// Reconnect if the session is gone or the probe read fails
    async fn ensure_live(&self, inner: &mut ModbusState<C::Session>) -> HomewattResult<()> {
        let healthy = match (inner.session.as_mut(), self.settings.probe) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(session), Some(probe)) => {
                match session.read_holding_registers(probe.address, probe.count).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("[{}] Liveness probe failed, reconnecting: {}", self.settings.name, e);
                        false
                    },
                }
            },
        };

        if healthy {
            return Ok(());
        }

        self.connect(inner).await?;
        notify(&self.observer, &self.settings.name, LinkEvent::Reinitialized);
        Ok(())
    }

    /// Run `f` against the live session under the connection lock
    ///
    /// Call as `conn.execute(|session| Box::pin(async move { ... }))`. A
    /// transport error returned by `f` drops the session so the next call
    /// reconnects; it is not retried within this call.
    pub async fn execute<T, F>(&self, f: F) -> HomewattResult<T>
    where
        F: for<'s> FnOnce(&'s mut C::Session) -> BoxFuture<'s, HomewattResult<T>>,
    {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            return Err(HomewattError::NotInitialized(self.settings.name.clone()));
        }

        self.ensure_live(&mut inner).await?;

        let session = match inner.session.as_mut() {
            Some(session) => session,
            None => return Err(HomewattError::NotInitialized(self.settings.name.clone())),
        };

        let result = f(session).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                warn!("[{}] Dropping Modbus session after error: {}", self.settings.name, e);
                inner.session = None;
                inner.state = ConnectionState::Failed;
                notify(&self.observer, &self.settings.name, LinkEvent::RequestFailed);
            }
        }
        result
    }
}

impl<C: ModbusConnector> std::fmt::Debug for ModbusConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("name", &self.settings.name)
            .field("endpoint", &self.settings.endpoint())
            .field("probe", &self.settings.probe)
            .finish()
    }
}
