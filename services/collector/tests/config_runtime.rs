//! Configuration files and module assembly
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use collector::runtime::{abort_modules, build_modules, init_modules, start_modules};
use collector::{CollectorConfig, CollectorMetrics, Named};
use errors::HomewattError;
use homewatt_state::StateCache;

const FULL: &str = r#"
service:
  name: homewatt-test
  status_listen: "127.0.0.1:0"
fronius:
  host: "127.0.0.1:1"
  poll_interval: 15s
  timeout: 1s
senec:
  host: "https://127.0.0.1:1"
hafnertec:
  host: "127.0.0.1:1"
  user: admin
  timeout: 1s
solvis:
  host: "127.0.0.1"
  port: 1
  timeout: 1s
  retry:
    max_attempts: 1
    base_delay: 10ms
  updater:
    poll_interval: 2m
weather:
  listen: "127.0.0.1:0"
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(FULL);
    let config = CollectorConfig::load(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(
        config.module_names(),
        vec!["fronius", "senec", "hafnertec", "solvis", "solvis-updater", "weather"]
    );
    assert!(config.timescaledb.is_none());

    let fronius = config.fronius.as_ref().unwrap();
    assert_eq!(fronius.poll_interval, Duration::from_secs(15));
    assert_eq!(fronius.timeout, Duration::from_secs(1));

    let senec = config.senec.as_ref().unwrap();
    assert_eq!(senec.poll_interval, Duration::from_secs(10));
    assert!(senec.accept_invalid_certs);

    let hafnertec = config.hafnertec.as_ref().unwrap();
    assert_eq!(hafnertec.user, "admin");
    assert!(hafnertec.password.is_none());

    let solvis = config.solvis.as_ref().unwrap();
    assert_eq!(solvis.unit_id, 0xFF);
    assert_eq!(solvis.retry.max_attempts, 1);
    assert_eq!(solvis.retry.base_delay, Duration::from_millis(10));
    let updater = solvis.updater.as_ref().unwrap();
    assert_eq!(updater.poll_interval, Duration::from_secs(120));
    assert_eq!(updater.source, "weather");
}

#[test]
fn test_malformed_file() {
    let file = write_config("fronius:\n  poll_interval: often\n");
    let err = CollectorConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, HomewattError::Configuration(_)));
}

#[test]
fn test_duplicate_name_in_file() {
    let file = write_config(
        "fronius:\n  host: inverter.local\nsenec:\n  name: fronius\n  host: battery.local\n",
    );
    let config = CollectorConfig::load(file.path()).unwrap();
    assert!(matches!(
        config.validate().unwrap_err(),
        HomewattError::InvalidConfig { .. }
    ));
}

#[tokio::test]
async fn test_unreachable_devices_are_skipped() {
    let config = CollectorConfig::from_yaml_str(FULL).unwrap();
    let cache = StateCache::new();
    let metrics = Arc::new(CollectorMetrics::new().unwrap());

    let modules = build_modules(&config, &cache, &metrics, None);
    let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
    assert_eq!(names, config.module_names());

    // Only the weather listener can come up; every device refuses connections
    let mut modules = init_modules(modules).await;
    let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["weather"]);

    assert_eq!(start_modules(&mut modules), 1);
    abort_modules(&mut modules).await;
    assert_eq!(metrics.query_count("weather", "success"), 0);
}

#[tokio::test]
async fn test_empty_config_builds_nothing() {
    let config = CollectorConfig::default();
    config.validate().unwrap();
    let metrics = Arc::new(CollectorMetrics::new().unwrap());
    let mut modules = build_modules(&config, &StateCache::new(), &metrics, None);
    assert!(modules.is_empty());
    assert_eq!(start_modules(&mut modules), 0);
}
