use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use eos_bridge::api;
use eos_bridge::config::Config;
use eos_bridge::controller::AppState;

const TEST_CONFIG: &str = r#"
    [general]
    time_zone = "Europe/Berlin"

    [server]
    host = "127.0.0.1"
    port = 18081

    [optimizer]
    backend = "evopt"
    base_url = "http://127.0.0.1:1"

    [price]
    source = "fixed_24h"
    fixed_24h_prices = [30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0, 30.0]
    feed_in_tariff_ct_per_kwh = 7.5

    [[pv_forecast]]
    name = "roof"
    lat = 48.81
    lon = 8.91
    azimuth = 13.0
    tilt = 31.0
    power = 8600.0
    power_inverter = 8000.0
    inverter_efficiency = 0.95

    [load]

    [battery]
    capacity_wh = 20000.0
    charge_efficiency = 0.95
    discharge_efficiency = 0.95
    max_charge_power_w = 5000.0
    min_soc_percentage = 5.0
    max_soc_percentage = 100.0

    [inverter]
    type = "none"
    max_grid_charge_rate = 5000.0
    max_pv_charge_rate = 5000.0

    [evcc]

    [mqtt]
"#;

async fn test_app() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut f = std::fs::File::create(dir.path().join("config.toml")).unwrap();
    f.write_all(TEST_CONFIG.as_bytes()).unwrap();
    let cfg = Config::load(dir.path()).unwrap();
    let (app, _override_rx) = AppState::new(cfg, dir.path().to_path_buf(), CancellationToken::new())
        .await
        .unwrap();
    (app, dir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn current_controls_has_the_aggregate_shape() {
    let (app, _dir) = test_app().await;
    let response = api::router(app)
        .oneshot(Request::get("/json/current_controls.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["api_version"], "0.0.1");
    assert_eq!(json["current_states"]["inverter_mode_num"], -1);
    assert_eq!(json["current_states"]["override_active"], false);
    assert_eq!(json["battery"]["usable_capacity"], 19_000.0);
    assert_eq!(json["battery"]["max_grid_charge_rate"], 5000.0);
    assert_eq!(json["evcc"]["charging_state"], false);
    assert_eq!(json["inverter"]["type"], "none");
    assert!(json["state"]["request_state"].is_null());
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn override_roundtrip_applies_and_clears() {
    let (app, _dir) = test_app().await;
    let router = api::router(app.clone());

    let response = router
        .clone()
        .oneshot(post_json(
            "/controls/mode_override",
            serde_json::json!({ "mode": 2, "duration": "01:00", "grid_charge_power": 2.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "success");
    assert_eq!(app.machine.overall_state().as_num(), 2);

    let controls = router
        .clone()
        .oneshot(Request::get("/json/current_controls.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(controls).await;
    assert_eq!(json["current_states"]["override_active"], true);
    assert!(json["current_states"]["override_end_time"].is_string());

    // mode -1 clears the override; power bound is not enforced for clears
    let response = router
        .oneshot(post_json(
            "/controls/mode_override",
            serde_json::json!({ "mode": -1, "duration": "00:01", "grid_charge_power": 0.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.machine.override_state(chrono::Utc::now()).is_none());
}

#[tokio::test]
async fn override_validation_rejects_bad_input() {
    let (app, _dir) = test_app().await;
    let router = api::router(app);

    for (body, expected_fragment) in [
        (serde_json::json!({ "mode": 5, "duration": "01:00", "grid_charge_power": 2.0 }), "mode"),
        (serde_json::json!({ "mode": 1, "duration": "13:00", "grid_charge_power": 2.0 }), "12:00"),
        (serde_json::json!({ "mode": 1, "duration": "xx", "grid_charge_power": 2.0 }), "HH:MM"),
        (serde_json::json!({ "mode": 1, "duration": "01:00", "grid_charge_power": 0.1 }), "grid_charge_power"),
        (serde_json::json!({ "mode": 1, "duration": "01:00", "grid_charge_power": 9.0 }), "grid_charge_power"),
    ] {
        let response = router
            .clone()
            .oneshot(post_json("/controls/mode_override", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let error = body_json(response).await["error"].as_str().unwrap().to_string();
        assert!(
            error.contains(expected_fragment),
            "error {error:?} should mention {expected_fragment:?}"
        );
    }
}

#[tokio::test]
async fn artifact_endpoints_have_defaults_before_first_cycle() {
    let (app, _dir) = test_app().await;
    let router = api::router(app);

    let response = router
        .clone()
        .oneshot(Request::get("/json/optimize_response.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["ac_charge"].as_array().unwrap().is_empty());
    assert!(json["timestamp"].is_string());

    let response = router
        .clone()
        .oneshot(Request::get("/json/optimize_request.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert!(json["error"].is_string());

    let index = router
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(index.status(), StatusCode::OK);
}

#[tokio::test]
async fn persisted_artifacts_are_served() {
    let (app, _dir) = test_app().await;
    let request_json = serde_json::json!({ "ems": { "gesamtlast": [400.0] }, "timestamp": "t" });
    app.state.store_request(request_json.clone());
    app.persist_artifact("optimize_request.json", &request_json).await;

    let router = api::router(app);
    let response = router
        .oneshot(Request::get("/json/optimize_request.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, request_json);
}
