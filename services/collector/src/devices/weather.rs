//! Weather station push receiver
//!
//! The station uploads Wunderground-style observations as a GET request with
//! imperial query parameters. Every request path is accepted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Router;
use chrono::{DateTime, Utc};
use errors::{missing_field, protocol_error, HomewattError, HomewattResult};
use homewatt_state::StateCache;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::PgConnection;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::WeatherConfig;
use crate::lifecycle::{ModuleState, Worker};
use crate::metrics::CollectorMetrics;
use crate::module::{Initializable, Named, Startable};
use crate::sink::{execute_schema, hypertable, RecordSink, TimescaleWriter};

pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    5.0 * (fahrenheit - 32.0) / 9.0
}

pub fn mph_to_ms(mph: f64) -> f64 {
    let kmh = mph / 0.6213712;
    kmh * 1000.0 / 3600.0
}

pub fn inch_to_mm(inch: f64) -> f64 {
    inch / 0.03937007874
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Climate {
    /// °C
    pub temperature: f64,
    /// Percent
    pub humidity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    /// Degrees
    pub direction: i32,
    /// m/s
    pub gusts: f64,
    /// m/s
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub timestamp: DateTime<Utc>,
    pub uv: f64,
    /// hPa
    pub barometer: f64,
    /// mm
    pub daily_rain: f64,
    /// °C
    pub dew_point: f64,
    pub outdoor: Climate,
    pub indoor: Climate,
    /// mm
    pub rain: f64,
    /// W/m²
    pub solar_radiation: f64,
    pub wind: Wind,
}

/// Convert one upload's query parameters; every parameter is required
pub fn parse_observation(params: &HashMap<String, String>) -> HomewattResult<WeatherRecord> {
    let value = |key: &str| -> HomewattResult<f64> {
        let raw = params.get(key).ok_or_else(|| missing_field!("weather", key))?;
        raw.trim()
            .parse::<f64>()
            .map_err(|e| protocol_error!("weather", "invalid {} {:?}: {}", key, raw, e))
    };

    let direction = params
        .get("winddir")
        .ok_or_else(|| missing_field!("weather", "winddir"))?;
    let direction = direction
        .trim()
        .parse::<i32>()
        .map_err(|e| protocol_error!("weather", "invalid winddir {:?}: {}", direction, e))?;

    Ok(WeatherRecord {
        timestamp: Utc::now(),
        uv: value("UV")?,
        // inHg to mmHg to hPa
        barometer: inch_to_mm(value("baromin")?) * 1.33322,
        daily_rain: inch_to_mm(value("dailyrainin")?),
        dew_point: fahrenheit_to_celsius(value("dewptf")?),
        outdoor: Climate {
            temperature: fahrenheit_to_celsius(value("tempf")?),
            humidity: value("humidity")?,
        },
        indoor: Climate {
            temperature: fahrenheit_to_celsius(value("indoortempf")?),
            humidity: value("indoorhumidity")?,
        },
        rain: inch_to_mm(value("rainin")?),
        solar_radiation: value("solarradiation")?,
        wind: Wind {
            direction,
            gusts: mph_to_ms(value("windgustmph")?),
            speed: mph_to_ms(value("windspeedmph")?),
        },
    })
}

struct ReceiverShared<S> {
    name: String,
    cache: StateCache,
    sink: S,
    metrics: Arc<CollectorMetrics>,
}

impl<S: RecordSink<WeatherRecord>> ReceiverShared<S> {
    async fn accept(&self, params: &HashMap<String, String>) -> HomewattResult<()> {
        let mut timer = self.metrics.start_query(&self.name);
        let record = parse_observation(params)?;
        self.cache.put_json(&self.name, &record)?;
        timer.success();

        if let Err(e) = self.sink.write(&record).await {
            warn!(module = %self.name, code = e.error_code(), "Failed to persist observation: {}", e);
        }
        Ok(())
    }
}

async fn receive<S: RecordSink<WeatherRecord>>(
    State(shared): State<Arc<ReceiverShared<S>>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    info!(module = %shared.name, "Weather observation received");
    match shared.accept(&params).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(module = %shared.name, code = e.error_code(), "Rejected observation: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

/// Push module: an HTTP listener instead of a polling loop
pub struct WeatherModule<S: RecordSink<WeatherRecord>> {
    shared: Arc<ReceiverShared<S>>,
    listen: String,
    listener: Option<TcpListener>,
    worker: Worker,
}

impl<S: RecordSink<WeatherRecord>> WeatherModule<S> {
    pub fn new(config: &WeatherConfig, sink: S, cache: StateCache, metrics: Arc<CollectorMetrics>) -> Self {
        Self {
            shared: Arc::new(ReceiverShared {
                name: config.name.clone(),
                cache,
                sink,
                metrics,
            }),
            listen: config.listen.clone(),
            listener: None,
            worker: Worker::new(&config.name),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.worker.state()
    }

    /// Bound address once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(receive::<S>)
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone())
    }
}

impl<S: RecordSink<WeatherRecord>> Named for WeatherModule<S> {
    fn name(&self) -> &str {
        &self.shared.name
    }
}

#[async_trait]
impl<S: RecordSink<WeatherRecord>> Initializable for WeatherModule<S> {
    async fn init(&mut self) -> HomewattResult<()> {
        self.shared.sink.prepare().await?;

        if self.listener.is_none() {
            let listener = TcpListener::bind(&self.listen)
                .await
                .map_err(|e| HomewattError::ConnectionFailed {
                    endpoint: self.listen.clone(),
                    reason: format!("cannot bind listener: {}", e),
                })?;
            self.listener = Some(listener);
        }
        self.worker.mark_initialized();
        Ok(())
    }
}

#[async_trait]
impl<S: RecordSink<WeatherRecord>> Startable for WeatherModule<S> {
    fn start(&mut self) -> HomewattResult<()> {
        self.worker.ensure_startable()?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| HomewattError::NotInitialized(self.shared.name.clone()))?;
        let app = self.router();
        let name = self.shared.name.clone();

        self.worker.spawn(move |cancel| async move {
            if let Ok(addr) = listener.local_addr() {
                info!(module = %name, "Listening for weather uploads on {}", addr);
            }
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(module = %name, "Weather listener failed: {}", e);
            }
        })
    }

    async fn abort(&mut self) {
        self.worker.abort().await;
    }

    async fn wait(&mut self) {
        self.worker.wait().await;
    }
}

#[derive(Debug, Default)]
pub struct WeatherWriter;

#[async_trait]
impl TimescaleWriter<WeatherRecord> for WeatherWriter {
    async fn prepare(&self, pool: &PgPool) -> HomewattResult<()> {
        let hypertable = hypertable("weather");
        execute_schema(
            pool,
            &[
                r#"CREATE TABLE IF NOT EXISTS weather (
                    time TIMESTAMPTZ NOT NULL,
                    uv DOUBLE PRECISION,
                    barometer DOUBLE PRECISION,
                    daily_rain DOUBLE PRECISION,
                    dew_point DOUBLE PRECISION,
                    outdoor_temperature DOUBLE PRECISION,
                    outdoor_humidity DOUBLE PRECISION,
                    indoor_temperature DOUBLE PRECISION,
                    indoor_humidity DOUBLE PRECISION,
                    rain DOUBLE PRECISION,
                    solar_radiation DOUBLE PRECISION,
                    wind_direction INTEGER,
                    wind_gusts DOUBLE PRECISION,
                    wind_speed DOUBLE PRECISION
                )"#,
                hypertable.as_str(),
            ],
        )
        .await
    }

    async fn write(&self, conn: &mut PgConnection, record: &WeatherRecord) -> HomewattResult<()> {
        sqlx::query(
            r#"INSERT INTO weather (
                time, uv, barometer, daily_rain, dew_point,
                outdoor_temperature, outdoor_humidity, indoor_temperature, indoor_humidity,
                rain, solar_radiation, wind_direction, wind_gusts, wind_speed
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(record.timestamp)
        .bind(record.uv)
        .bind(record.barometer)
        .bind(record.daily_rain)
        .bind(record.dew_point)
        .bind(record.outdoor.temperature)
        .bind(record.outdoor.humidity)
        .bind(record.indoor.temperature)
        .bind(record.indoor.humidity)
        .bind(record.rain)
        .bind(record.solar_radiation)
        .bind(record.wind.direction)
        .bind(record.wind.gusts)
        .bind(record.wind.speed)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn upload() -> HashMap<String, String> {
        [
            ("ID", "KXYZ"),
            ("tempf", "50"),
            ("humidity", "81"),
            ("dewptf", "32"),
            ("windspeedmph", "10"),
            ("windgustmph", "0"),
            ("winddir", "225"),
            ("rainin", "0.1"),
            ("dailyrainin", "1"),
            ("baromin", "29.92"),
            ("solarradiation", "112.5"),
            ("UV", "1"),
            ("indoortempf", "71.6"),
            ("indoorhumidity", "44"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(fahrenheit_to_celsius(32.0), 0.0);
        assert_eq!(fahrenheit_to_celsius(212.0), 100.0);
        assert!(close(mph_to_ms(10.0), 4.4704));
        assert!(close(inch_to_mm(1.0), 25.4));
    }

    #[test]
    fn test_parse_observation() {
        let record = parse_observation(&upload()).unwrap();
        assert_eq!(record.outdoor.temperature, 10.0);
        assert_eq!(record.outdoor.humidity, 81.0);
        assert_eq!(record.dew_point, 0.0);
        assert!(close(record.indoor.temperature, 22.0));
        assert_eq!(record.indoor.humidity, 44.0);
        assert_eq!(record.wind.direction, 225);
        assert_eq!(record.wind.gusts, 0.0);
        assert!(close(record.wind.speed, 4.4704));
        assert!(close(record.daily_rain, 25.4));
        assert!(close(record.rain, 2.54));
        // 29.92 inHg is standard pressure
        assert!((record.barometer - 1013.2).abs() < 0.1);
        assert_eq!(record.uv, 1.0);
        assert_eq!(record.solar_radiation, 112.5);
    }

    #[test]
    fn test_missing_parameter() {
        let mut params = upload();
        params.remove("indoortempf");
        let err = parse_observation(&params).unwrap_err();
        assert!(matches!(err, HomewattError::MissingField { ref field, .. } if field == "indoortempf"));
    }

    #[test]
    fn test_malformed_parameter() {
        let mut params = upload();
        params.insert("winddir".to_string(), "SW".to_string());
        assert!(matches!(
            parse_observation(&params).unwrap_err(),
            HomewattError::Protocol { .. }
        ));

        let mut params = upload();
        params.insert("tempf".to_string(), String::new());
        assert!(parse_observation(&params).is_err());
    }
}
