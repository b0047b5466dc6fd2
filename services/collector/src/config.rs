//! Collector configuration
//!
//! Loaded from a YAML file merged with `HOMEWATT_`-prefixed environment
//! variables (nested keys separated by `__`, e.g. `HOMEWATT_SOLVIS__PORT=1502`).
//! Every device section is optional; an absent section disables the device.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use errors::{config_error, HomewattError, HomewattResult};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use homewatt_link::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "HOMEWATT_";

pub const DEFAULT_STATUS_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_WEATHER_LISTEN: &str = "0.0.0.0:8081";

fn default_service_name() -> String {
    "homewatt".to_string()
}

fn default_status_listen() -> String {
    DEFAULT_STATUS_LISTEN.to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Bind address of the status API
    #[serde(default = "default_status_listen")]
    pub status_listen: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            status_listen: default_status_listen(),
        }
    }
}

/// TimescaleDB coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescaleConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

impl TimescaleConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Fronius inverter (Solar API over HTTP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FroniusConfig {
    #[serde(default = "default_fronius_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_fronius_name() -> String {
    "fronius".to_string()
}

/// SENEC home battery (lala.cgi over HTTP/HTTPS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenecConfig {
    #[serde(default = "default_senec_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// The device ships a self-signed certificate
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

fn default_senec_name() -> String {
    "senec".to_string()
}

/// Hafnertec stove controller (web UI scraped over HTTP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HafnertecConfig {
    #[serde(default = "default_hafnertec_name")]
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_hafnertec_name() -> String {
    "hafnertec".to_string()
}

/// Solvis heating controller (Modbus TCP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolvisConfig {
    #[serde(default = "default_solvis_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_modbus_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: BackoffPolicy,
    /// Room temperature push from the weather station
    #[serde(default)]
    pub updater: Option<SolvisUpdaterConfig>,
}

fn default_solvis_name() -> String {
    "solvis".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    0xFF
}

fn default_modbus_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolvisUpdaterConfig {
    #[serde(default = "default_updater_name")]
    pub name: String,
    #[serde(default = "default_updater_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Cache entry holding the weather record to read from
    #[serde(default = "default_updater_source")]
    pub source: String,
}

fn default_updater_name() -> String {
    "solvis-updater".to_string()
}

fn default_updater_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_updater_source() -> String {
    "weather".to_string()
}

/// Weather station push receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_name")]
    pub name: String,
    #[serde(default = "default_weather_listen")]
    pub listen: String,
}

fn default_weather_name() -> String {
    "weather".to_string()
}

fn default_weather_listen() -> String {
    DEFAULT_WEATHER_LISTEN.to_string()
}

/// Complete collector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub timescaledb: Option<TimescaleConfig>,
    #[serde(default)]
    pub fronius: Option<FroniusConfig>,
    #[serde(default)]
    pub senec: Option<SenecConfig>,
    #[serde(default)]
    pub hafnertec: Option<HafnertecConfig>,
    #[serde(default)]
    pub solvis: Option<SolvisConfig>,
    #[serde(default)]
    pub weather: Option<WeatherConfig>,
}

impl CollectorConfig {
    /// Load from `path`, then apply environment overrides
    pub fn load(path: &Path) -> HomewattResult<Self> {
        if !path.exists() {
            return Err(config_error!(
                "Configuration file not found: {}",
                path.display()
            ));
        }

        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| config_error!("Failed to load configuration: {}", e))
    }

    /// Parse a YAML document without environment overrides
    pub fn from_yaml_str(yaml: &str) -> HomewattResult<Self> {
        Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| config_error!("Failed to parse configuration: {}", e))
    }

    /// Names of every configured module and updater, in start order
    pub fn module_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(fronius) = &self.fronius {
            names.push(fronius.name.as_str());
        }
        if let Some(senec) = &self.senec {
            names.push(senec.name.as_str());
        }
        if let Some(hafnertec) = &self.hafnertec {
            names.push(hafnertec.name.as_str());
        }
        if let Some(solvis) = &self.solvis {
            names.push(solvis.name.as_str());
            if let Some(updater) = &solvis.updater {
                names.push(updater.name.as_str());
            }
        }
        if let Some(weather) = &self.weather {
            names.push(weather.name.as_str());
        }
        names
    }

    pub fn validate(&self) -> HomewattResult<()> {
        if self.service.name.is_empty() {
            return Err(invalid("service.name", "cannot be empty"));
        }
        if self.service.status_listen.is_empty() {
            return Err(invalid("service.status_listen", "cannot be empty"));
        }

        if let Some(db) = &self.timescaledb {
            if db.host.is_empty() {
                return Err(invalid("timescaledb.host", "cannot be empty"));
            }
            if db.database.is_empty() {
                return Err(invalid("timescaledb.database", "cannot be empty"));
            }
            if db.max_connections == 0 {
                return Err(invalid("timescaledb.max_connections", "must be at least 1"));
            }
        }

        if let Some(fronius) = &self.fronius {
            check_host("fronius.host", &fronius.host)?;
            check_interval("fronius.poll_interval", fronius.poll_interval)?;
        }
        if let Some(senec) = &self.senec {
            check_host("senec.host", &senec.host)?;
            check_interval("senec.poll_interval", senec.poll_interval)?;
        }
        if let Some(hafnertec) = &self.hafnertec {
            check_host("hafnertec.host", &hafnertec.host)?;
            check_interval("hafnertec.poll_interval", hafnertec.poll_interval)?;
            if hafnertec.user.is_empty() {
                return Err(invalid("hafnertec.user", "cannot be empty"));
            }
        }
        if let Some(solvis) = &self.solvis {
            check_host("solvis.host", &solvis.host)?;
            check_interval("solvis.poll_interval", solvis.poll_interval)?;
            if solvis.retry.max_attempts == 0 {
                return Err(invalid("solvis.retry.max_attempts", "must be at least 1"));
            }
            if let Some(updater) = &solvis.updater {
                check_interval("solvis.updater.poll_interval", updater.poll_interval)?;
                if updater.source.is_empty() {
                    return Err(invalid("solvis.updater.source", "cannot be empty"));
                }
            }
        }
        if let Some(weather) = &self.weather {
            check_host("weather.listen", &weather.listen)?;
        }

        let mut seen = HashSet::new();
        for name in self.module_names() {
            if name.is_empty() {
                return Err(invalid("name", "module name cannot be empty"));
            }
            if !seen.insert(name) {
                return Err(invalid("name", &format!("duplicate module name '{}'", name)));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> HomewattError {
    HomewattError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn check_host(field: &str, host: &str) -> HomewattResult<()> {
    if host.trim().is_empty() {
        return Err(invalid(field, "cannot be empty"));
    }
    Ok(())
}

fn check_interval(field: &str, interval: Duration) -> HomewattResult<()> {
    if interval.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}
