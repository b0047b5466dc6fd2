//! SENEC home battery (`/lala.cgi` JSON interface)
//!
//! The device answers a POST whose body names the wanted keys with empty
//! strings. Every returned value is a typed hex string such as `fl_43C80000`
//! (IEEE-754 single) or `u3_0000000B` (unsigned); `st_` strings carry text
//! and decode to 0.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{missing_field, protocol_error, HomewattResult};
use homewatt_link::{HttpConnection, HttpSettings, LinkObserver, RequestMethod};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::PgConnection;

use super::{read_json, EnergySources};
use crate::config::SenecConfig;
use crate::module::DeviceClient;
use crate::sink::{execute_schema, hypertable, TimescaleWriter};

pub const LALA_PATH: &str = "lala.cgi";

/// Sections and keys requested on every query
const REQUESTED: &[(&str, &[&str])] = &[
    ("PV1", &["POWER_RATIO", "MPP_CUR", "MPP_VOL", "MPP_POWER"]),
    ("PM1OBJ1", &["P_TOTAL", "FREQ", "U_AC", "I_AC", "P_AC"]),
    (
        "ENERGY",
        &[
            "GUI_BAT_DATA_FUEL_CHARGE",
            "GUI_BAT_DATA_POWER",
            "GUI_BAT_DATA_VOLTAGE",
            "GUI_HOUSE_POW",
            "GUI_GRID_POW",
            "GUI_INVERTER_POWER",
            "STAT_STATE",
            "STAT_HOURS_OF_OPERATION",
        ],
    ),
    ("BMS", &["NR_INSTALLED", "TOTAL_CURRENT"]),
    (
        "STATISTIC",
        &[
            "LIVE_GRID_IMPORT",
            "LIVE_GRID_EXPORT",
            "LIVE_HOUSE_CONS",
            "LIVE_PV_GEN",
        ],
    ),
    ("TEMPMEASURE", &["BATTERY_TEMP", "CASE_TEMP", "MCU_TEMP"]),
    ("FAN_SPEED", &["INV_LV"]),
];

const PHASES: usize = 3;
const TRACKERS: usize = 3;

/// Request body asking for every key the record needs
pub fn request_body() -> Value {
    let mut body = Map::new();
    for (section, keys) in REQUESTED {
        let fields: Map<String, Value> = keys
            .iter()
            .map(|key| (key.to_string(), Value::String(String::new())))
            .collect();
        body.insert(section.to_string(), Value::Object(fields));
    }
    Value::Object(body)
}

/// Decode one typed value
///
/// Returns `None` for malformed hex. Unknown prefixes, `st_` strings and
/// non-string values decode to 0.
pub fn decode_value(raw: &Value) -> Option<f64> {
    let Some(text) = raw.as_str() else {
        return Some(0.0);
    };
    if text.len() < 3 || !text.is_char_boundary(3) {
        return Some(0.0);
    }
    let (prefix, hex) = text.split_at(3);
    match prefix {
        "fl_" => u32::from_str_radix(hex, 16)
            .ok()
            .map(|bits| f64::from(f32::from_bits(bits))),
        "u1_" | "u3_" | "u6_" | "u8_" => u64::from_str_radix(hex, 16).ok().map(|v| v as f64),
        "i1_" | "i3_" | "i8_" => {
            let bits = hex.len() * 4;
            if bits == 0 || bits > 64 {
                return None;
            }
            let raw = u64::from_str_radix(hex, 16).ok()?;
            // Sign-extend from the width given by the digit count
            let shift = 64 - bits as u32;
            Some((((raw << shift) as i64) >> shift) as f64)
        },
        _ => Some(0.0),
    }
}

/// Reader over the response document
struct Fields<'a> {
    root: &'a Value,
}

impl<'a> Fields<'a> {
    fn section(&self, section: &str) -> HomewattResult<&'a Value> {
        self.root
            .get(section)
            .ok_or_else(|| missing_field!("senec", section))
    }

    fn value(&self, section: &str, key: &str) -> HomewattResult<f64> {
        let null = Value::Null;
        let raw = self.section(section)?.get(key).unwrap_or(&null);
        decode_value(raw).ok_or_else(|| {
            protocol_error!("senec", "malformed value {}.{}: {}", section, key, raw)
        })
    }

    fn indexed(&self, section: &str, key: &str, index: usize) -> HomewattResult<f64> {
        let null = Value::Null;
        let raw = self
            .section(section)?
            .get(key)
            .and_then(|v| v.get(index))
            .unwrap_or(&null);
        decode_value(raw).ok_or_else(|| {
            protocol_error!("senec", "malformed value {}.{}[{}]: {}", section, key, index, raw)
        })
    }
}

/// Instantaneous power, W
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SenecPower {
    pub house_consumption: f64,
    /// Positive while importing
    pub grid: f64,
    pub pv: f64,
    /// Positive while charging
    pub battery: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SenecBattery {
    pub soc: f64,
    pub power: f64,
    pub voltage: f64,
    pub temperature: f64,
}

/// Lifetime energy counters, Wh
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SenecTotals {
    pub grid_import: f64,
    pub grid_export: f64,
    pub consumption: f64,
    pub production: f64,
    /// Battery current, A
    pub current: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SenecSystem {
    pub pv_limit: i64,
    pub ac_power: f64,
    pub frequency: f64,
    pub state: i64,
    pub operating_hours: i64,
    pub battery_modules: i64,
    pub case_temperature: f64,
    pub mcu_temperature: f64,
    pub fan_speed: i64,
}

/// Current, voltage and power of one AC phase or one MPP tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenecRecord {
    pub timestamp: DateTime<Utc>,
    pub power: SenecPower,
    pub sources: EnergySources,
    pub battery: SenecBattery,
    pub totals: SenecTotals,
    pub system: SenecSystem,
    pub ac_phases: Vec<Channel>,
    pub mppt: Vec<Channel>,
}

pub fn parse_response(body: &Value) -> HomewattResult<SenecRecord> {
    let f = Fields { root: body };

    let battery_power = f.value("ENERGY", "GUI_BAT_DATA_POWER")?;
    let power = SenecPower {
        house_consumption: f.value("ENERGY", "GUI_HOUSE_POW")?,
        grid: f.value("ENERGY", "GUI_GRID_POW")?,
        pv: f.value("ENERGY", "GUI_INVERTER_POWER")?,
        battery: battery_power,
    };

    let battery = SenecBattery {
        soc: f.value("ENERGY", "GUI_BAT_DATA_FUEL_CHARGE")?,
        power: battery_power,
        voltage: f.value("ENERGY", "GUI_BAT_DATA_VOLTAGE")?,
        temperature: f.value("TEMPMEASURE", "BATTERY_TEMP")?,
    };

    // Statistic counters are reported in kWh
    let totals = SenecTotals {
        grid_import: f.value("STATISTIC", "LIVE_GRID_IMPORT")? * 1000.0,
        grid_export: f.value("STATISTIC", "LIVE_GRID_EXPORT")? * 1000.0,
        consumption: f.value("STATISTIC", "LIVE_HOUSE_CONS")? * 1000.0,
        production: f.value("STATISTIC", "LIVE_PV_GEN")? * 1000.0,
        current: f.value("BMS", "TOTAL_CURRENT")?,
    };

    let system = SenecSystem {
        pv_limit: f.value("PV1", "POWER_RATIO")? as i64,
        ac_power: f.value("PM1OBJ1", "P_TOTAL")?,
        frequency: f.value("PM1OBJ1", "FREQ")?,
        state: f.value("ENERGY", "STAT_STATE")? as i64,
        operating_hours: f.value("ENERGY", "STAT_HOURS_OF_OPERATION")? as i64,
        battery_modules: f.value("BMS", "NR_INSTALLED")? as i64,
        case_temperature: f.value("TEMPMEASURE", "CASE_TEMP")?,
        mcu_temperature: f.value("TEMPMEASURE", "MCU_TEMP")?,
        fan_speed: f.value("FAN_SPEED", "INV_LV")? as i64,
    };

    let ac_phases = (0..PHASES)
        .map(|i| -> HomewattResult<Channel> {
            Ok(Channel {
                current: f.indexed("PM1OBJ1", "I_AC", i)?,
                voltage: f.indexed("PM1OBJ1", "U_AC", i)?,
                power: f.indexed("PM1OBJ1", "P_AC", i)?,
            })
        })
        .collect::<HomewattResult<Vec<_>>>()?;

    let mppt = (0..TRACKERS)
        .map(|i| -> HomewattResult<Channel> {
            Ok(Channel {
                current: f.indexed("PV1", "MPP_CUR", i)?,
                voltage: f.indexed("PV1", "MPP_VOL", i)?,
                power: f.indexed("PV1", "MPP_POWER", i)?,
            })
        })
        .collect::<HomewattResult<Vec<_>>>()?;

    Ok(SenecRecord {
        timestamp: Utc::now(),
        sources: EnergySources::split(power.grid, power.battery),
        power,
        battery,
        totals,
        system,
        ac_phases,
        mppt,
    })
}

pub struct SenecClient {
    name: String,
    conn: HttpConnection,
}

impl SenecClient {
    pub fn new(config: &SenecConfig) -> Self {
        let settings = HttpSettings::new(&config.name, &config.host, LALA_PATH)
            .with_method(RequestMethod::Post)
            .with_body(request_body())
            .with_timeout(config.timeout)
            .accept_invalid_certs(config.accept_invalid_certs);
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
impl DeviceClient for SenecClient {
    type Record = SenecRecord;

    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> HomewattResult<()> {
        self.conn.init().await
    }

    async fn query(&self) -> HomewattResult<SenecRecord> {
        let name = self.name.as_str();
        self.conn
            .execute(|response| async move { parse_response(&read_json(name, response).await?) })
            .await
    }
}

/// Rows in the `senec` hypertable; phase and tracker readings go to JSONB columns
#[derive(Debug, Default)]
pub struct SenecWriter;

#[async_trait]
impl TimescaleWriter<SenecRecord> for SenecWriter {
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()> {
        let hypertable = hypertable("senec");
        execute_schema(
            pool,
            &[
                r#"CREATE TABLE IF NOT EXISTS senec (
                    time TIMESTAMPTZ NOT NULL,
                    house_consumption DOUBLE PRECISION,
                    pv DOUBLE PRECISION,
                    grid DOUBLE PRECISION,
                    battery DOUBLE PRECISION,
                    feed_in DOUBLE PRECISION,
                    grid_import DOUBLE PRECISION,
                    charging DOUBLE PRECISION,
                    discharging DOUBLE PRECISION,
                    battery_soc DOUBLE PRECISION,
                    battery_voltage DOUBLE PRECISION,
                    battery_temperature DOUBLE PRECISION,
                    total_grid_import DOUBLE PRECISION,
                    total_grid_export DOUBLE PRECISION,
                    total_consumption DOUBLE PRECISION,
                    total_production DOUBLE PRECISION,
                    total_current DOUBLE PRECISION,
                    pv_limit BIGINT,
                    ac_power DOUBLE PRECISION,
                    frequency DOUBLE PRECISION,
                    state BIGINT,
                    operating_hours BIGINT,
                    battery_modules BIGINT,
                    case_temperature DOUBLE PRECISION,
                    mcu_temperature DOUBLE PRECISION,
                    fan_speed BIGINT,
                    ac_phases JSONB,
                    mppt JSONB
                )"#,
                hypertable.as_str(),
            ],
        )
        .await
    }

    async fn write(&self, conn: &mut PgConnection, record: &SenecRecord) -> HomewattResult<()> {
        sqlx::query(
            r#"INSERT INTO senec (
                time, house_consumption, pv, grid, battery,
                feed_in, grid_import, charging, discharging,
                battery_soc, battery_voltage, battery_temperature,
                total_grid_import, total_grid_export, total_consumption, total_production, total_current,
                pv_limit, ac_power, frequency, state, operating_hours, battery_modules,
                case_temperature, mcu_temperature, fan_speed, ac_phases, mppt
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28
            )"#,
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
        .bind(record.battery.soc)
        .bind(record.battery.voltage)
        .bind(record.battery.temperature)
        .bind(record.totals.grid_import)
        .bind(record.totals.grid_export)
        .bind(record.totals.consumption)
        .bind(record.totals.production)
        .bind(record.totals.current)
        .bind(record.system.pv_limit)
        .bind(record.system.ac_power)
        .bind(record.system.frequency)
        .bind(record.system.state)
        .bind(record.system.operating_hours)
        .bind(record.system.battery_modules)
        .bind(record.system.case_temperature)
        .bind(record.system.mcu_temperature)
        .bind(record.system.fan_speed)
        .bind(Json(&record.ac_phases))
        .bind(Json(&record.mppt))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::HomewattError;
    use serde_json::json;

    #[test]
    fn test_decode_float() {
        assert_eq!(decode_value(&json!("fl_43C80000")), Some(400.0));
        assert_eq!(decode_value(&json!("fl_C2C80000")), Some(-100.0));
        assert_eq!(decode_value(&json!("fl_47F12000")), Some(123456.0));
    }

    #[test]
    fn test_decode_unsigned() {
        assert_eq!(decode_value(&json!("u8_64")), Some(100.0));
        assert_eq!(decode_value(&json!("u3_0000000B")), Some(11.0));
        assert_eq!(decode_value(&json!("u1_FFFF")), Some(65535.0));
    }

    #[test]
    fn test_decode_signed() {
        assert_eq!(decode_value(&json!("i1_FFFE")), Some(-2.0));
        assert_eq!(decode_value(&json!("i3_FFFFFFFF")), Some(-1.0));
        assert_eq!(decode_value(&json!("i8_7F")), Some(127.0));
        assert_eq!(decode_value(&json!("i8_80")), Some(-128.0));
    }

    #[test]
    fn test_decode_text_and_garbage() {
        assert_eq!(decode_value(&json!("st_ACTIVE")), Some(0.0));
        assert_eq!(decode_value(&json!(42)), Some(0.0));
        assert_eq!(decode_value(&Value::Null), Some(0.0));
        assert_eq!(decode_value(&json!("fl")), Some(0.0));
        assert_eq!(decode_value(&json!("fl_XYZ")), None);
        assert_eq!(decode_value(&json!("i1_")), None);
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body();
        assert_eq!(body["ENERGY"]["GUI_BAT_DATA_FUEL_CHARGE"], "");
        assert_eq!(body["PV1"]["MPP_POWER"], "");
        assert_eq!(body["FAN_SPEED"]["INV_LV"], "");
        assert_eq!(body.as_object().unwrap().len(), 7);
    }

    fn sample() -> Value {
        json!({
            "PV1": {
                "POWER_RATIO": "u8_46",
                "MPP_CUR": ["fl_40200000", "fl_3F800000", "fl_00000000"],
                "MPP_VOL": ["fl_43960000", "fl_43480000", "fl_00000000"],
                "MPP_POWER": ["fl_44BB8000", "fl_43480000", "fl_00000000"]
            },
            "PM1OBJ1": {
                "P_TOTAL": "fl_C3480000",
                "FREQ": "fl_42480000",
                "U_AC": ["fl_43660000", "fl_43660000", "fl_43660000"],
                "I_AC": ["fl_3F800000", "fl_40000000", "fl_40400000"],
                "P_AC": ["fl_43660000", "fl_43E60000", "fl_442C8000"]
            },
            "ENERGY": {
                "GUI_BAT_DATA_FUEL_CHARGE": "fl_42A00000",
                "GUI_BAT_DATA_POWER": "fl_C3C80000",
                "GUI_BAT_DATA_VOLTAGE": "fl_42480000",
                "GUI_HOUSE_POW": "fl_43FA0000",
                "GUI_GRID_POW": "fl_42C80000",
                "GUI_INVERTER_POWER": "fl_00000000",
                "STAT_STATE": "u8_0E",
                "STAT_HOURS_OF_OPERATION": "u3_00001F40"
            },
            "BMS": {"NR_INSTALLED": "u8_02", "TOTAL_CURRENT": "fl_C0800000"},
            "STATISTIC": {
                "LIVE_GRID_IMPORT": "fl_44FA0000",
                "LIVE_GRID_EXPORT": "fl_447A0000",
                "LIVE_HOUSE_CONS": "fl_45BB8000",
                "LIVE_PV_GEN": "fl_457A0000"
            },
            "TEMPMEASURE": {
                "BATTERY_TEMP": "fl_41C80000",
                "CASE_TEMP": "fl_42200000",
                "MCU_TEMP": "fl_42480000"
            },
            "FAN_SPEED": {"INV_LV": "u8_00"}
        })
    }

    #[test]
    fn test_parse_response() {
        let record = parse_response(&sample()).unwrap();

        assert_eq!(record.power.house_consumption, 500.0);
        assert_eq!(record.power.grid, 100.0);
        assert_eq!(record.power.battery, -400.0);
        assert_eq!(record.sources.grid_import, 100.0);
        assert_eq!(record.sources.discharging, 400.0);
        assert_eq!(record.sources.charging, 0.0);

        assert_eq!(record.battery.soc, 80.0);
        assert_eq!(record.battery.temperature, 25.0);
        assert_eq!(record.totals.grid_import, 2_000_000.0);
        assert_eq!(record.totals.grid_export, 1_000_000.0);
        assert_eq!(record.totals.current, -4.0);

        assert_eq!(record.system.pv_limit, 70);
        assert_eq!(record.system.state, 14);
        assert_eq!(record.system.operating_hours, 8000);
        assert_eq!(record.system.battery_modules, 2);
        assert_eq!(record.system.frequency, 50.0);

        assert_eq!(record.ac_phases.len(), 3);
        assert_eq!(record.ac_phases[2].current, 3.0);
        assert_eq!(record.ac_phases[0].voltage, 230.0);
        assert_eq!(record.mppt[0].current, 2.5);
        assert_eq!(record.mppt[0].voltage, 300.0);
        assert_eq!(record.mppt[0].power, 1500.0);
    }

    #[test]
    fn test_missing_section() {
        let mut body = sample();
        body.as_object_mut().unwrap().remove("ENERGY");
        let err = parse_response(&body).unwrap_err();
        assert!(matches!(err, HomewattError::MissingField { ref field, .. } if field == "ENERGY"));
    }

    #[test]
    fn test_short_arrays_read_as_zero() {
        let mut body = sample();
        body["PV1"]["MPP_CUR"] = json!(["fl_3F800000"]);
        let record = parse_response(&body).unwrap();
        assert_eq!(record.mppt[0].current, 1.0);
        assert_eq!(record.mppt[1].current, 0.0);
    }

    #[test]
    fn test_malformed_value() {
        let mut body = sample();
        body["ENERGY"]["GUI_GRID_POW"] = json!("fl_nothex");
        assert!(matches!(
            parse_response(&body).unwrap_err(),
            HomewattError::Protocol { .. }
        ));
    }
}
