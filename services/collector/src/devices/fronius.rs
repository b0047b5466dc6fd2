//! Fronius inverter with attached battery storage (Solar API v1)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{protocol_error, HomewattResult};
use homewatt_link::{HttpConnection, HttpSettings, LinkObserver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::PgConnection;

use super::{number, read_json, EnergySources};
use crate::config::FroniusConfig;
use crate::module::DeviceClient;
use crate::sink::{execute_schema, hypertable, TimescaleWriter};

pub const POWER_FLOW_PATH: &str = "solar_api/v1/GetPowerFlowRealtimeData.fcgi";
pub const STORAGE_PATH: &str = "solar_api/v1/GetStorageRealtimeData.cgi";

/// Instantaneous power at the site, in W
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerFlow {
    /// Positive while the house consumes
    pub house_consumption: f64,
    pub pv: f64,
    /// Positive while importing from the grid
    pub grid: f64,
    /// Positive while the battery discharges
    pub battery: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    /// Percent
    pub soc: f64,
    /// DC current, A
    pub current: f64,
    /// Cell temperature, °C
    pub temperature: f64,
    /// DC voltage, V
    pub voltage: f64,
}

/// AC output of one inverter, keyed by its device id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InverterPower {
    pub id: String,
    /// W
    pub power: f64,
    /// Hz, 0 when not reported
    pub frequency: f64,
}

/// Everything read from `GetPowerFlowRealtimeData`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerFlowData {
    pub power: PowerFlow,
    pub sources: EnergySources,
    pub inverters: Vec<InverterPower>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FroniusRecord {
    pub timestamp: DateTime<Utc>,
    pub power: PowerFlow,
    pub sources: EnergySources,
    pub inverters: Vec<InverterPower>,
    pub storage: StorageState,
}

fn data_section<'a>(body: &'a Value) -> HomewattResult<&'a Value> {
    let body = body
        .get("Body")
        .ok_or_else(|| protocol_error!("fronius", "unexpected JSON (no Body)"))?;
    body.get("Data")
        .ok_or_else(|| protocol_error!("fronius", "unexpected JSON (no Body.Data)"))
}

/// Parse `GetPowerFlowRealtimeData`; absent site and inverter values count as 0
pub fn parse_power_flow(body: &Value) -> HomewattResult<PowerFlowData> {
    let data = data_section(body)?;
    let site = data
        .get("Site")
        .ok_or_else(|| protocol_error!("fronius", "unexpected JSON (no Body.Data.Site)"))?;

    // P_Load is reported negative while the house consumes
    let power = PowerFlow {
        house_consumption: -number(site, "P_Load"),
        pv: number(site, "P_PV"),
        grid: number(site, "P_Grid"),
        battery: number(site, "P_Akku"),
    };
    let sources = EnergySources::split(power.grid, -power.battery);

    let mut inverters: Vec<InverterPower> = data
        .get("Inverters")
        .and_then(Value::as_object)
        .map(|inverters| {
            inverters
                .iter()
                .filter(|(_, inverter)| inverter.is_object())
                .map(|(id, inverter)| InverterPower {
                    id: id.clone(),
                    power: number(inverter, "P"),
                    frequency: number(inverter, "FREQ"),
                })
                .collect()
        })
        .unwrap_or_default();
    inverters.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(PowerFlowData {
        power,
        sources,
        inverters,
    })
}

/// Parse `GetStorageRealtimeData` for storage device 0
pub fn parse_storage(body: &Value) -> HomewattResult<StorageState> {
    let controller = data_section(body)?
        .get("0")
        .ok_or_else(|| protocol_error!("fronius", "no storage device 0"))?
        .get("Controller")
        .ok_or_else(|| protocol_error!("fronius", "storage device 0 has no Controller"))?;

    Ok(StorageState {
        soc: number(controller, "StateOfCharge_Relative"),
        current: number(controller, "Current_DC"),
        temperature: number(controller, "Temperature_Cell"),
        voltage: number(controller, "Voltage_DC"),
    })
}

/// Queries power flow and storage and merges both into one record
pub struct FroniusClient {
    name: String,
    power_flow: HttpConnection,
    storage: HttpConnection,
}

impl FroniusClient {
    pub fn new(config: &FroniusConfig) -> Self {
        let settings = |suffix: &str, path: &str| {
            HttpSettings::new(format!("{}-{}", config.name, suffix), &config.host, path)
                .with_timeout(config.timeout)
                .accept_invalid_certs(true)
        };
        Self {
            name: config.name.clone(),
            power_flow: HttpConnection::new(settings("powerflow", POWER_FLOW_PATH)),
            storage: HttpConnection::new(settings("storage", STORAGE_PATH)),
        }
    }

    pub fn with_observer(self, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            name: self.name,
            power_flow: self.power_flow.with_observer(observer.clone()),
            storage: self.storage.with_observer(observer),
        }
    }
}

#[async_trait]
impl DeviceClient for FroniusClient {
    type Record = FroniusRecord;

    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> HomewattResult<()> {
        self.power_flow.init().await?;
        self.storage.init().await
    }

    async fn query(&self) -> HomewattResult<FroniusRecord> {
        let name = self.name.as_str();
        let flow = self
            .power_flow
            .execute(|response| async move { parse_power_flow(&read_json(name, response).await?) })
            .await?;
        let storage = self
            .storage
            .execute(|response| async move { parse_storage(&read_json(name, response).await?) })
            .await?;

        Ok(FroniusRecord {
            timestamp: Utc::now(),
            power: flow.power,
            sources: flow.sources,
            inverters: flow.inverters,
            storage,
        })
    }
}

/// Rows in the `fronius` hypertable
#[derive(Debug, Default)]
pub struct FroniusWriter;

#[async_trait]
impl TimescaleWriter<FroniusRecord> for FroniusWriter {
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()> {
        let hypertable = hypertable("fronius");
        execute_schema(
            pool,
            &[
                r#"CREATE TABLE IF NOT EXISTS fronius (
                    time TIMESTAMPTZ NOT NULL,
                    house_consumption DOUBLE PRECISION,
                    pv DOUBLE PRECISION,
                    grid DOUBLE PRECISION,
                    battery DOUBLE PRECISION,
                    feed_in DOUBLE PRECISION,
                    grid_import DOUBLE PRECISION,
                    charging DOUBLE PRECISION,
                    discharging DOUBLE PRECISION,
                    inverters JSONB,
                    battery_soc DOUBLE PRECISION,
                    battery_current DOUBLE PRECISION,
                    battery_temperature DOUBLE PRECISION,
                    battery_voltage DOUBLE PRECISION
                )"#,
                hypertable.as_str(),
            ],
        )
        .await
    }

    async fn write(&self, conn: &mut PgConnection, record: &FroniusRecord) -> HomewattResult<()> {
        sqlx::query(
            r#"INSERT INTO fronius (
                time, house_consumption, pv, grid, battery,
                feed_in, grid_import, charging, discharging, inverters,
                battery_soc, battery_current, battery_temperature, battery_voltage
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(record.timestamp)
        .bind(record.power.house_consumption)
        .bind(record.power.pv)
        .bind(record.power.grid)
        .bind(record.power.battery)
        .bind(record.sources.feed_in)
        .bind(record.sources.grid_import)
        .bind(record.sources.charging)
        .bind(record.sources.discharging)
        .bind(Json(&record.inverters))
        .bind(record.storage.soc)
        .bind(record.storage.current)
        .bind(record.storage.temperature)
        .bind(record.storage.voltage)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
