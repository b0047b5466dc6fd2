//! Hafnertec pellet stove controller
//!
//! The controller has no API. Its web UI polls a schematic fragment, a flat
//! list of absolutely positioned `<div>`s, and each reading sits at a fixed
//! position in that list.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{protocol_error, HomewattError, HomewattResult};
use homewatt_link::{HttpConnection, HttpSettings, LinkObserver};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::PgConnection;
use tracing::{debug, warn};

use super::read_text;
use crate::config::HafnertecConfig;
use crate::module::DeviceClient;
use crate::sink::{execute_schema, hypertable, TimescaleWriter};

pub const SCHEMATIC_PATH: &str = "schematic_files/9.cgi";

// Positions in the schematic fragment
const CHAMBER: usize = 1;
const HEATING_SHARE: usize = 2;
const FLOW: usize = 3;
const RETURN: usize = 4;
const THROUGHPUT: usize = 5;
const FAN: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HafnertecRecord {
    pub timestamp: DateTime<Utc>,
    /// Combustion chamber, °C
    pub chamber_temperature: f64,
    /// Share of heat going to the heating circuit, %
    pub heating_share: f64,
    /// Flow, °C
    pub flow_temperature: f64,
    /// Return, °C
    pub return_temperature: f64,
    /// Pump throughput, %
    pub throughput: f64,
    /// Fan speed, %
    pub fan: f64,
}

/// First number in a display string such as `"18.8°"` or `"90.0 %"`
///
/// A sign directly in front of the first digit is kept. Text without a
/// number reads as 0.
pub fn parse_numeric(text: &str) -> f64 {
    let (Some(first), Some(last)) = (
        text.find(|c: char| c.is_ascii_digit()),
        text.rfind(|c: char| c.is_ascii_digit()),
    ) else {
        warn!("[hafnertec] Could not find number in '{}'", text.trim());
        return 0.0;
    };

    let start = match text[..first].chars().last() {
        Some('-') | Some('+') => first - 1,
        _ => first,
    };

    text[start..=last].parse().unwrap_or_else(|_| {
        warn!("[hafnertec] Could not parse number in '{}'", text.trim());
        0.0
    })
}

/// Text content of every `<div>` in document order
pub fn div_texts(html: &str) -> HomewattResult<Vec<String>> {
    let div = Regex::new(r"(?is)<div\b[^>]*>(.*?)</div>")
        .map_err(|e| HomewattError::Internal(format!("div pattern: {}", e)))?;
    Ok(div
        .captures_iter(html)
        .map(|c| c.get(1).map_or("", |m| m.as_str()).trim().to_string())
        .collect())
}

/// Parse the schematic fragment into a record
pub fn parse_schematic(html: &str) -> HomewattResult<HafnertecRecord> {
    let divs = div_texts(html)?;
    if divs.len() <= FAN {
        return Err(protocol_error!(
            "hafnertec",
            "expected at least {} fields in schematic, got {}",
            FAN + 1,
            divs.len()
        ));
    }

    let at = |position: usize| parse_numeric(&divs[position]);
    Ok(HafnertecRecord {
        timestamp: Utc::now(),
        chamber_temperature: at(CHAMBER),
        heating_share: at(HEATING_SHARE),
        flow_temperature: at(FLOW),
        return_temperature: at(RETURN),
        throughput: at(THROUGHPUT),
        fan: at(FAN),
    })
}

pub struct HafnertecClient {
    name: String,
    conn: HttpConnection,
}

impl HafnertecClient {
    pub fn new(config: &HafnertecConfig) -> Self {
        let settings = HttpSettings::new(&config.name, &config.host, SCHEMATIC_PATH)
            .with_timeout(config.timeout)
            .with_basic_auth(&config.user, config.password.clone());
        Self {
            name: config.name.clone(),
            conn: HttpConnection::new(settings),
        }
    }

    pub fn with_observer(self, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            name: self.name,
            conn: self.conn.with_observer(observer),
        }
    }
}

#[async_trait]
impl DeviceClient for HafnertecClient {
    type Record = HafnertecRecord;

    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> HomewattResult<()> {
        self.conn.init().await
    }

    async fn query(&self) -> HomewattResult<HafnertecRecord> {
        let record = self
            .conn
            .execute(|response| async move { parse_schematic(&read_text(response).await?) })
            .await?;
        debug!(
            "[{}] Chamber temperature {:.1} °C",
            self.name, record.chamber_temperature
        );
        Ok(record)
    }
}

/// Rows in the `hafnertec` hypertable
#[derive(Debug, Default)]
pub struct HafnertecWriter;

#[async_trait]
impl TimescaleWriter<HafnertecRecord> for HafnertecWriter {
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()> {
        let hypertable = hypertable("hafnertec");
        execute_schema(
            pool,
            &[
                r#"CREATE TABLE IF NOT EXISTS hafnertec (
                    time TIMESTAMPTZ NOT NULL,
                    chamber_temperature DOUBLE PRECISION,
                    heating_share DOUBLE PRECISION,
                    flow_temperature DOUBLE PRECISION,
                    return_temperature DOUBLE PRECISION,
                    throughput DOUBLE PRECISION,
                    fan DOUBLE PRECISION
                )"#,
                hypertable.as_str(),
            ],
        )
        .await
    }

    async fn write(&self, conn: &mut PgConnection, record: &HafnertecRecord) -> HomewattResult<()> {
        sqlx::query(
            r#"INSERT INTO hafnertec (
                time, chamber_temperature, heating_share, flow_temperature,
                return_temperature, throughput, fan
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(record.timestamp)
        .bind(record.chamber_temperature)
        .bind(record.heating_share)
        .bind(record.flow_temperature)
        .bind(record.return_temperature)
        .bind(record.throughput)
        .bind(record.fan)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
