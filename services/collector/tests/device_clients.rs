//! HTTP device clients against fake devices
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use collector::config::{FroniusConfig, HafnertecConfig, SenecConfig};
use collector::devices::fronius::{FroniusClient, POWER_FLOW_PATH, STORAGE_PATH};
use collector::devices::hafnertec::{HafnertecClient, SCHEMATIC_PATH};
use collector::devices::senec::{request_body, SenecClient, LALA_PATH};
use collector::DeviceClient;
use errors::HomewattError;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn device() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn fronius_config(server: &MockServer) -> FroniusConfig {
    FroniusConfig {
        name: "fronius".to_string(),
        host: server.uri(),
        poll_interval: Duration::from_secs(10),
        timeout: Duration::from_secs(2),
    }
}

fn senec_config(server: &MockServer) -> SenecConfig {
    SenecConfig {
        name: "senec".to_string(),
        host: server.uri(),
        poll_interval: Duration::from_secs(10),
        timeout: Duration::from_secs(2),
        accept_invalid_certs: true,
    }
}

#[tokio::test]
async fn test_fronius_merges_power_flow_and_storage() {
    let server = device().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", POWER_FLOW_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Body": {"Data": {"Site": {
                "P_Load": -650.0,
                "P_PV": 3150.0,
                "P_Grid": -1500.0,
                "P_Akku": -1000.0
            },
            "Inverters": {"1": {"DT": 1, "P": 3150.0}}}},
            "Head": {"Status": {"Code": 0}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", STORAGE_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Body": {"Data": {"0": {"Controller": {
                "StateOfCharge_Relative": 55.0,
                "Current_DC": 2.5,
                "Temperature_Cell": 21.0,
                "Voltage_DC": 400.0
            }}}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = FroniusClient::new(&fronius_config(&server));
    client.init().await.unwrap();
    let record = client.query().await.unwrap();

    assert_eq!(record.power.house_consumption, 650.0);
    assert_eq!(record.power.pv, 3150.0);
    assert_eq!(record.sources.feed_in, 1500.0);
    assert_eq!(record.sources.charging, 1000.0);
    assert_eq!(record.inverters.len(), 1);
    assert_eq!(record.inverters[0].power, 3150.0);
    assert_eq!(record.storage.soc, 55.0);
    assert_eq!(record.storage.voltage, 400.0);
}

#[tokio::test]
async fn test_fronius_unexpected_status() {
    let server = device().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", POWER_FLOW_PATH)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = FroniusClient::new(&fronius_config(&server));
    client.init().await.unwrap();
    let err = client.query().await.unwrap_err();
    assert!(matches!(err, HomewattError::UnexpectedStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_fronius_query_before_init() {
    let server = device().await;
    let client = FroniusClient::new(&fronius_config(&server));
    assert!(matches!(
        client.query().await.unwrap_err(),
        HomewattError::NotInitialized(_)
    ));
}

#[tokio::test]
async fn test_fronius_init_fails_when_device_is_down() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = FroniusClient::new(&fronius_config(&server));
    let err = client.init().await.unwrap_err();
    assert!(matches!(err, HomewattError::UnexpectedStatus { status: 503, .. }));
}

#[tokio::test]
async fn test_senec_posts_request_and_decodes() {
    let server = device().await;
    Mock::given(method("POST"))
        .and(path(format!("/{}", LALA_PATH)))
        .and(body_json(request_body()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PV1": {
                "POWER_RATIO": "u8_64",
                "MPP_CUR": ["fl_3F800000", "fl_00000000", "fl_00000000"],
                "MPP_VOL": ["fl_43960000", "fl_00000000", "fl_00000000"],
                "MPP_POWER": ["fl_43960000", "fl_00000000", "fl_00000000"]
            },
            "PM1OBJ1": {
                "P_TOTAL": "fl_00000000",
                "FREQ": "fl_42480000",
                "U_AC": ["fl_43660000", "fl_43660000", "fl_43660000"],
                "I_AC": ["fl_00000000", "fl_00000000", "fl_00000000"],
                "P_AC": ["fl_00000000", "fl_00000000", "fl_00000000"]
            },
            "ENERGY": {
                "GUI_BAT_DATA_FUEL_CHARGE": "fl_42C80000",
                "GUI_BAT_DATA_POWER": "fl_43C80000",
                "GUI_BAT_DATA_VOLTAGE": "fl_42480000",
                "GUI_HOUSE_POW": "fl_43FA0000",
                "GUI_GRID_POW": "fl_C2C80000",
                "GUI_INVERTER_POWER": "fl_43960000",
                "STAT_STATE": "u8_0D",
                "STAT_HOURS_OF_OPERATION": "u3_00000064"
            },
            "BMS": {"NR_INSTALLED": "u8_01", "TOTAL_CURRENT": "fl_40000000"},
            "STATISTIC": {
                "LIVE_GRID_IMPORT": "fl_3F800000",
                "LIVE_GRID_EXPORT": "fl_40000000",
                "LIVE_HOUSE_CONS": "fl_40400000",
                "LIVE_PV_GEN": "fl_40800000"
            },
            "TEMPMEASURE": {
                "BATTERY_TEMP": "fl_41A00000",
                "CASE_TEMP": "fl_41F00000",
                "MCU_TEMP": "fl_42200000"
            },
            "FAN_SPEED": {"INV_LV": "u8_00"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = SenecClient::new(&senec_config(&server));
    client.init().await.unwrap();
    let record = client.query().await.unwrap();

    assert_eq!(record.battery.soc, 100.0);
    assert_eq!(record.power.battery, 400.0);
    assert_eq!(record.power.grid, -100.0);
    assert_eq!(record.sources.feed_in, 100.0);
    assert_eq!(record.sources.charging, 400.0);
    assert_eq!(record.totals.production, 4000.0);
    assert_eq!(record.system.pv_limit, 100);
    assert_eq!(record.system.state, 13);
    assert_eq!(record.battery.temperature, 20.0);
    assert_eq!(record.mppt[0].voltage, 300.0);
}

#[tokio::test]
async fn test_senec_invalid_json() {
    let server = device().await;
    Mock::given(method("POST"))
        .and(path(format!("/{}", LALA_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
        .mount(&server)
        .await;

    let client = SenecClient::new(&senec_config(&server));
    client.init().await.unwrap();
    assert!(matches!(
        client.query().await.unwrap_err(),
        HomewattError::Protocol { .. }
    ));
}

// "user:password"
const BASIC_USER_PASSWORD: &str = "Basic dXNlcjpwYXNzd29yZA==";

const SCHEMATIC: &str = r#"<div id="pos0" >
60.0 °C</div>
<div id="pos1" >
18.8°
</div>
<div id="pos2" class="changex2" adresse="10F44140A91">
90.0 %</div>
<div id="pos3" >
24.9°
</div>
<div id="pos4" >
24.8°
</div>
<div id="pos5" class="changex2" adresse="00840D10A91">
0.0%
</div>
<div id="pos6" class="changex2" adresse="03C48120A91">
-10.0°
</div>
<div id="pos7" class="changex2" adresse="10E44140A91">
80.0 °C</div>
<div id="pos8" >
T. Max VL AWE</div>
<div id="pos9" class="changex2" adresse="00940D10A91">
0.0%
</div>
<div id="pos10" class="durchsichtig" onClick="location.href='schema.html#1'">
</div>"#;

fn hafnertec_config(server: &MockServer) -> HafnertecConfig {
    HafnertecConfig {
        name: "hafnertec".to_string(),
        host: server.uri(),
        user: "user".to_string(),
        password: Some("password".to_string()),
        poll_interval: Duration::from_secs(10),
        timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_hafnertec_scrapes_schematic_with_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("Authorization", BASIC_USER_PASSWORD))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", SCHEMATIC_PATH)))
        .and(header("Authorization", BASIC_USER_PASSWORD))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SCHEMATIC, "text/html"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HafnertecClient::new(&hafnertec_config(&server));
    client.init().await.unwrap();
    let record = client.query().await.unwrap();

    assert_eq!(record.chamber_temperature, 18.8);
    assert_eq!(record.flow_temperature, 24.9);
    assert_eq!(record.return_temperature, 24.8);
    assert_eq!(record.throughput, 0.0);
    assert_eq!(record.heating_share, 90.0);
    assert_eq!(record.fan, 0.0);
}

#[tokio::test]
async fn test_hafnertec_wrong_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("Authorization", BASIC_USER_PASSWORD))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut config = hafnertec_config(&server);
    config.password = Some("wrong".to_string());
    let client = HafnertecClient::new(&config);
    assert!(matches!(
        client.init().await.unwrap_err(),
        HomewattError::UnexpectedStatus { status: 401, .. }
    ));
}

#[tokio::test]
async fn test_hafnertec_unknown_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", SCHEMATIC_PATH)))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let client = HafnertecClient::new(&hafnertec_config(&server));
    client.init().await.unwrap();
    assert!(matches!(
        client.query().await.unwrap_err(),
        HomewattError::UnexpectedStatus { status: 404, .. }
    ));
}
