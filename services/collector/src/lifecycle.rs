//! Worker task ownership shared by modules and updaters

use std::fmt;
use std::future::Future;

use errors::{HomewattError, HomewattResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Constructed,
    Initialized,
    Running,
    Aborting,
    Stopped,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Constructed => "constructed",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Aborting => "aborting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Owns at most one spawned task and its stop token
pub struct Worker {
    name: String,
    state: ModuleState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ModuleState::Constructed,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn mark_initialized(&mut self) {
        if self.state == ModuleState::Constructed {
            self.state = ModuleState::Initialized;
        }
    }

    /// `Ok` only between `init()` and the first `start()`
    pub fn ensure_startable(&self) -> HomewattResult<()> {
        match self.state {
            ModuleState::Initialized => Ok(()),
            ModuleState::Constructed => Err(HomewattError::NotInitialized(self.name.clone())),
            state => Err(HomewattError::Internal(format!(
                "{} cannot start while {}",
                self.name, state
            ))),
        }
    }

    /// Spawn the worker; `body` receives the token it must observe between cycles
    pub fn spawn<F, Fut>(&mut self, body: F) -> HomewattResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_startable()?;

        let task = body(self.cancel.clone());
        self.handle = Some(tokio::spawn(task));
        self.state = ModuleState::Running;
        info!("[{}] started", self.name);
        Ok(())
    }

    pub async fn abort(&mut self) {
        if self.state == ModuleState::Stopped {
            return;
        }
        self.state = ModuleState::Aborting;
        self.cancel.cancel();
        self.join().await;
        info!("[{}] stopped", self.name);
    }

    pub async fn wait(&mut self) {
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("[{}] worker ended abnormally: {}", self.name, e);
            }
        }
        debug!("[{}] worker joined", self.name);
        self.state = ModuleState::Stopped;
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_requires_init() {
        let mut worker = Worker::new("fronius");
        let err = worker.spawn(|_| async {}).unwrap_err();
        assert!(matches!(err, HomewattError::NotInitialized(_)));
        assert_eq!(worker.state(), ModuleState::Constructed);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let mut worker = Worker::new("senec");
        worker.mark_initialized();
        worker
            .spawn(|cancel| async move { cancel.cancelled().await })
            .unwrap();
        assert_eq!(worker.state(), ModuleState::Running);
        assert!(worker.spawn(|_| async {}).is_err());
        worker.abort().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_is_idempotent() {
        let ticks = Arc::new(AtomicU32::new(0));
        let seen = ticks.clone();
        let mut worker = Worker::new("solvis");
        worker.mark_initialized();
        worker
            .spawn(move |cancel| async move {
                while !cancel.is_cancelled() {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        worker.abort().await;
        assert_eq!(worker.state(), ModuleState::Stopped);
        let after = ticks.load(Ordering::SeqCst);

        worker.abort().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
        assert_eq!(worker.state(), ModuleState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_returns_when_body_finishes() {
        let mut worker = Worker::new("weather");
        worker.mark_initialized();
        worker.spawn(|_| async {}).unwrap();
        worker.wait().await;
        assert_eq!(worker.state(), ModuleState::Stopped);
    }

    #[tokio::test]
    async fn test_abort_before_start() {
        let mut worker = Worker::new("idle");
        worker.abort().await;
        assert_eq!(worker.state(), ModuleState::Stopped);
    }
}
