//! Persistence sinks for device records
//!
//! A sink receives every record a module produces. [`TimescaleSink`] wraps
//! each write in its own transaction and commits only when the writer
//! succeeded. [`DiscardSink`] stands in when no database is configured.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{HomewattError, HomewattResult};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use tracing::{debug, info, warn};

use crate::config::TimescaleConfig;

/// Destination for a module's records
#[async_trait]
pub trait RecordSink<R>: Send + Sync + 'static
where
    R: Send + Sync + 'static,
{
    /// Idempotent schema preparation, called from the module's `init()`
    async fn prepare(&self) -> HomewattResult<()>;

    async fn write(&self, record: &R) -> HomewattResult<()>;
}

#[async_trait]
impl<R, S> RecordSink<R> for Arc<S>
where
    R: Send + Sync + 'static,
    S: RecordSink<R> + ?Sized,
{
    async fn prepare(&self) -> HomewattResult<()> {
        (**self).prepare().await
    }

    async fn write(&self, record: &R) -> HomewattResult<()> {
        (**self).write(record).await
    }
}

/// Table-specific SQL for one record type
#[async_trait]
pub trait TimescaleWriter<R>: Send + Sync + 'static
where
    R: Send + Sync + 'static,
{
    /// Create tables and hypertables if they do not exist
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()>;

    /// Insert one record using the caller's transaction
    async fn write(&self, conn: &mut PgConnection, record: &R) -> HomewattResult<()>;
}

/// Lazily connecting pool for the configured database
///
/// No connection is opened here; the first `prepare()` or `write()` does.
pub fn connect_lazy(config: &TimescaleConfig) -> HomewattResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(&config.connection_url())?;
    info!(
        "TimescaleDB pool configured for {}:{}/{}",
        config.host, config.port, config.database
    );
    Ok(pool)
}

pub struct TimescaleSink<R, W> {
    pool: PgPool,
    writer: W,
    _record: PhantomData<fn(&R)>,
}

impl<R, W> TimescaleSink<R, W>
where
    R: Send + Sync + 'static,
    W: TimescaleWriter<R>,
{
    pub fn new(pool: PgPool, writer: W) -> Self {
        Self {
            pool,
            writer,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R, W> RecordSink<R> for TimescaleSink<R, W>
where
    R: Send + Sync + 'static,
    W: TimescaleWriter<R>,
{
    async fn prepare(&self) -> HomewattResult<()> {
        self.writer.prepare(&self.pool).await
    }

    async fn write(&self, record: &R) -> HomewattResult<()> {
        let mut tx = self.pool.begin().await?;
        match self.writer.write(&mut *tx, record).await {
            Ok(()) => {
                tx.commit().await?;
                debug!("record committed");
                Ok(())
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("rollback failed: {}", rollback);
                }
                Err(e)
            },
        }
    }
}

/// Accepts and drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl<R> RecordSink<R> for DiscardSink
where
    R: Send + Sync + 'static,
{
    async fn prepare(&self) -> HomewattResult<()> {
        Ok(())
    }

    async fn write(&self, _record: &R) -> HomewattResult<()> {
        Ok(())
    }
}

/// Run each statement of a schema script in order
pub async fn execute_schema(pool: &PgPool, statements: &[&str]) -> HomewattResult<()> {
    for statement in statements {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| HomewattError::Persistence(format!("schema preparation failed: {}", e)))?;
    }
    Ok(())
}

/// Hypertable conversion for `table`, safe to repeat
pub fn hypertable(table: &str) -> String {
    format!(
        "SELECT create_hypertable('{}', 'time', if_not_exists => TRUE)",
        table
    )
}
