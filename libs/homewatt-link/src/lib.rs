//! Device connection layer for homewatt
//!
//! Two connection flavors share one contract: `init()` establishes the
//! session, `execute()` runs a callback against the live session while holding
//! the connection's lock, and a detected failure leads to one transparent
//! re-initialization on the next call.
//!
//! Callbacks passed to `execute()` must never call back into the same
//! connection. The lock is not reentrant and such a call deadlocks.

pub mod http;
pub mod modbus;
pub mod registers;
pub mod retry;

use std::fmt;
use std::sync::Arc;

pub use http::{BasicAuth, HttpConnection, HttpSettings, RequestMethod};
pub use modbus::{
    LivenessProbe, ModbusConnection, ModbusConnector, ModbusSession, ModbusSettings, TcpConnector,
    TcpSession,
};
pub use retry::{retry_with_backoff, BackoffPolicy};

/// Lifecycle of a connection's underlying session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `init()` never ran
    Uninitialized,
    /// `init()` or a reinit is in progress
    Initializing,
    /// Session established and usable
    Ready,
    /// Last init or request failed; a previously ready connection reinitializes on next use
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Initialized,
    InitFailed,
    Reinitialized,
    RequestFailed,
}

impl LinkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::InitFailed => "init_failed",
            Self::Reinitialized => "reinitialized",
            Self::RequestFailed => "request_failed",
        }
    }
}

/// Receives lifecycle events from connections, e.g. to count reinitializations
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, connection: &str, event: LinkEvent);
}

pub(crate) fn notify(observer: &Option<Arc<dyn LinkObserver>>, name: &str, event: LinkEvent) {
    if let Some(observer) = observer {
        observer.on_event(name, event);
    }
}
