//! Status router served in-process
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use collector::api::{router, ApiState};
use collector::CollectorMetrics;
use homewatt_state::StateCache;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn state() -> ApiState {
    ApiState {
        cache: StateCache::new(),
        metrics: Arc::new(CollectorMetrics::new().unwrap()),
    }
}

async fn get(state: &ApiState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health() {
    let (status, body) = get(&state(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_module_state() {
    let state = state();
    state
        .cache
        .put_json("fronius", &json!({"power": {"pv": 4200.0}}))
        .unwrap();

    let (status, body) = get(&state, "/api/v1/state/fronius").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["power"]["pv"], 4200.0);
}

#[tokio::test]
async fn test_unknown_module_is_404() {
    let (status, body) = get(&state(), "/api/v1/state/hafnertec").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(String::from_utf8(body).unwrap(), "data for module \"hafnertec\" not found");
}

#[tokio::test]
async fn test_all_state() {
    let state = state();
    let (_, body) = get(&state, "/api/v1/state").await;
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({}));

    state.cache.put_json("senec", &json!({"battery": {"soc": 80.0}})).unwrap();
    state.cache.put_json("solvis", &json!({"boiler": 65.5})).unwrap();

    let (status, body) = get(&state, "/api/v1/state").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["senec"]["battery"]["soc"], 80.0);
    assert_eq!(body["solvis"]["boiler"], 65.5);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let state = state();
    {
        let mut timer = state.metrics.start_query("fronius");
        timer.success();
    }

    let (status, body) = get(&state, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("homewatt_queries_total"));
    assert!(text.contains("service=\"fronius\""));
    assert!(text.contains("homewatt_build_info"));
}
