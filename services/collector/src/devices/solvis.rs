//! Solvis heating controller over Modbus TCP
//!
//! Temperatures are holding registers in units of 0.1 °C. The room
//! temperature registers are writable and fed from the weather station's
//! indoor sensor by [`SolvisUpdater`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{protocol_error, HomewattResult};
use homewatt_link::registers::to_i16;
use homewatt_link::{
    LinkObserver, ModbusConnection, ModbusConnector, ModbusSession, ModbusSettings, TcpConnector,
};
use homewatt_state::StateCache;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::PgConnection;
use tracing::info;

use super::weather::WeatherRecord;
use crate::config::{SolvisConfig, SolvisUpdaterConfig};
use crate::module::DeviceClient;
use crate::sink::{execute_schema, hypertable, TimescaleWriter};
use crate::updater::UpdateAction;

/// Liveness probe read before every exchange
pub const PROBE_ADDRESS: u16 = 32770;
pub const PROBE_COUNT: u16 = 2;

pub const TEMPERATURE_BLOCK: u16 = 33024;
pub const TEMPERATURE_COUNT: u16 = 18;
pub const POWER_BLOCK: u16 = 33536;
pub const POWER_COUNT: u16 = 5;

/// Room temperature inputs of heating circuits 1 to 3
pub const ROOM_TEMPERATURE_REGISTERS: [u16; 3] = [34304, 34305, 34306];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvisRecord {
    pub timestamp: DateTime<Utc>,
    pub storage_top: f64,
    pub storage_bottom: f64,
    pub heating_buffer_top: f64,
    pub heating_buffer_bottom: f64,
    pub hot_water: f64,
    pub cold_water: f64,
    pub circulation: f64,
    /// Hot water draw, l/min
    pub flow_rate: f64,
    pub collector: f64,
    pub solar_flow: f64,
    pub solar_return: f64,
    pub solar_heat_exchanger: f64,
    /// Solar loop volume flow, l/h
    pub solar_volume_flow: f64,
    /// kW
    pub solar_power: f64,
    pub boiler: f64,
    /// kW
    pub boiler_power: f64,
    pub flow_circuit1: f64,
    pub flow_circuit2: f64,
    pub flow_circuit3: f64,
}

/// Build a record from the two register blocks
pub fn decode(temperatures: &[u16], power: &[u16]) -> HomewattResult<SolvisRecord> {
    if temperatures.len() < TEMPERATURE_COUNT as usize || power.len() < POWER_COUNT as usize {
        return Err(protocol_error!(
            "solvis",
            "could not retrieve all registers ({} of {}, {} of {})",
            temperatures.len(),
            TEMPERATURE_COUNT,
            power.len(),
            POWER_COUNT
        ));
    }

    let r = temperatures;
    let celsius = |i: usize| f64::from(to_i16(r[i])) / 10.0;
    let solar_delta = f64::from(to_i16(r[4])) - f64::from(to_i16(r[5]));

    Ok(SolvisRecord {
        timestamp: Utc::now(),
        storage_top: celsius(0),
        hot_water: celsius(1),
        storage_bottom: celsius(2),
        heating_buffer_top: celsius(3),
        solar_flow: celsius(4),
        solar_return: celsius(5),
        solar_heat_exchanger: celsius(6),
        collector: celsius(7),
        heating_buffer_bottom: celsius(8),
        circulation: celsius(10),
        flow_circuit1: celsius(11),
        flow_circuit2: celsius(12),
        boiler: celsius(13),
        cold_water: celsius(14),
        flow_circuit3: celsius(15),
        solar_volume_flow: f64::from(r[16]),
        flow_rate: f64::from(r[17]),
        solar_power: solar_delta * f64::from(r[16]) / 8600.0,
        boiler_power: f64::from(power[3]) / 1000.0,
    })
}

/// Register word for a room temperature in °C
pub fn room_temperature_word(celsius: f64) -> u16 {
    ((celsius * 10.0).round() as i16) as u16
}

/// Connection settings for the controller, probe included
pub fn modbus_settings(config: &SolvisConfig) -> ModbusSettings {
    let mut settings = ModbusSettings::new(&config.name, &config.host, config.port)
        .with_probe(PROBE_ADDRESS, PROBE_COUNT)
        .with_retry(config.retry);
    settings.unit_id = config.unit_id;
    settings.timeout = config.timeout;
    settings
}

pub struct SolvisClient<C: ModbusConnector = TcpConnector> {
    name: String,
    conn: Arc<ModbusConnection<C>>,
}

impl SolvisClient<TcpConnector> {
    pub fn tcp(config: &SolvisConfig, observer: Option<Arc<dyn LinkObserver>>) -> Self {
        let mut conn = ModbusConnection::tcp(modbus_settings(config));
        if let Some(observer) = observer {
            conn = conn.with_observer(observer);
        }
        Self::new(&config.name, Arc::new(conn))
    }
}

impl<C: ModbusConnector> SolvisClient<C> {
    pub fn new(name: impl Into<String>, conn: Arc<ModbusConnection<C>>) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    /// Handle for an updater writing to the same controller
    pub fn connection(&self) -> Arc<ModbusConnection<C>> {
        self.conn.clone()
    }
}

#[async_trait]
impl<C> DeviceClient for SolvisClient<C>
where
    C: ModbusConnector + 'static,
{
    type Record = SolvisRecord;

    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> HomewattResult<()> {
        self.conn.init().await
    }

    async fn query(&self) -> HomewattResult<SolvisRecord> {
        let (temperatures, power) = self
            .conn
            .execute(|session| {
                Box::pin(async move {
                    let temperatures = session
                        .read_holding_registers(TEMPERATURE_BLOCK, TEMPERATURE_COUNT)
                        .await?;
                    let power = session.read_holding_registers(POWER_BLOCK, POWER_COUNT).await?;
                    Ok((temperatures, power))
                })
            })
            .await?;
        decode(&temperatures, &power)
    }
}

/// Pushes the weather station's indoor temperature into the room temperature registers
pub struct SolvisUpdater<C: ModbusConnector = TcpConnector> {
    name: String,
    source: String,
    conn: Arc<ModbusConnection<C>>,
}

impl<C: ModbusConnector> SolvisUpdater<C> {
    pub fn new(config: &SolvisUpdaterConfig, conn: Arc<ModbusConnection<C>>) -> Self {
        Self {
            name: config.name.clone(),
            source: config.source.clone(),
            conn,
        }
    }
}

#[async_trait]
impl<C> UpdateAction for SolvisUpdater<C>
where
    C: ModbusConnector + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    /// No-op when the polling module already connected
    async fn init(&self) -> HomewattResult<()> {
        self.conn.init().await
    }

    async fn apply(&self, cache: &StateCache) -> HomewattResult<()> {
        let weather: WeatherRecord = cache.get_json(&self.source)?;
        let word = room_temperature_word(weather.indoor.temperature);
        info!(
            "[{}] Updating room temperature to {:.1}",
            self.name,
            f64::from(to_i16(word)) / 10.0
        );

        self.conn
            .execute(move |session| {
                Box::pin(async move {
                    for address in ROOM_TEMPERATURE_REGISTERS {
                        session.write_single_register(address, word).await?;
                    }
                    Ok(())
                })
            })
            .await
    }
}

#[derive(Debug, Default)]
pub struct SolvisWriter;

#[async_trait]
impl TimescaleWriter<SolvisRecord> for SolvisWriter {
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()> {
        let hypertable = hypertable("solvis");
        execute_schema(
            pool,
            &[
                r#"CREATE TABLE IF NOT EXISTS solvis (
                    time TIMESTAMPTZ NOT NULL,
                    storage_top DOUBLE PRECISION,
                    storage_bottom DOUBLE PRECISION,
                    heating_buffer_top DOUBLE PRECISION,
                    heating_buffer_bottom DOUBLE PRECISION,
                    hot_water DOUBLE PRECISION,
                    cold_water DOUBLE PRECISION,
                    circulation DOUBLE PRECISION,
                    flow_rate DOUBLE PRECISION,
                    collector DOUBLE PRECISION,
                    solar_flow DOUBLE PRECISION,
                    solar_return DOUBLE PRECISION,
                    solar_heat_exchanger DOUBLE PRECISION,
                    solar_volume_flow DOUBLE PRECISION,
                    solar_power DOUBLE PRECISION,
                    boiler DOUBLE PRECISION,
                    boiler_power DOUBLE PRECISION,
                    flow_circuit1 DOUBLE PRECISION,
                    flow_circuit2 DOUBLE PRECISION,
                    flow_circuit3 DOUBLE PRECISION
                )"#,
                hypertable.as_str(),
            ],
        )
        .await
    }

    async fn write(&self, conn: &mut PgConnection, record: &SolvisRecord) -> HomewattResult<()> {
        sqlx::query(
            r#"INSERT INTO solvis (
                time, storage_top, storage_bottom, heating_buffer_top, heating_buffer_bottom,
                hot_water, cold_water, circulation, flow_rate, collector,
                solar_flow, solar_return, solar_heat_exchanger, solar_volume_flow, solar_power,
                boiler, boiler_power, flow_circuit1, flow_circuit2, flow_circuit3
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            )"#,
        )
        .bind(record.timestamp)
        .bind(record.storage_top)
        .bind(record.storage_bottom)
        .bind(record.heating_buffer_top)
        .bind(record.heating_buffer_bottom)
        .bind(record.hot_water)
        .bind(record.cold_water)
        .bind(record.circulation)
        .bind(record.flow_rate)
        .bind(record.collector)
        .bind(record.solar_flow)
        .bind(record.solar_return)
        .bind(record.solar_heat_exchanger)
        .bind(record.solar_volume_flow)
        .bind(record.solar_power)
        .bind(record.boiler)
        .bind(record.boiler_power)
        .bind(record.flow_circuit1)
        .bind(record.flow_circuit2)
        .bind(record.flow_circuit3)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
