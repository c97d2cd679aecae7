use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use eos_bridge::clock::Clock;
use eos_bridge::domain::{
    ApplianceSpec, BatterySpec, EmsData, EvSpec, InverterSpec, OptimizeRequest, Resolution,
};
use eos_bridge::optimizer::{BackendError, EvoptBackend, OptimizerBackend};

fn request() -> OptimizeRequest {
    OptimizeRequest {
        ems: EmsData {
            pv: vec![0.0; 48],
            price_import: vec![0.0003; 48],
            price_feedin: vec![0.000075; 48],
            battery_price: 0.0,
            load: vec![400.0; 48],
        },
        battery: BatterySpec {
            device_id: Some("battery1".into()),
            capacity_wh: 20_000.0,
            charging_efficiency: 0.95,
            discharging_efficiency: 0.95,
            max_charge_power_w: 5000.0,
            initial_soc_percentage: 20.0,
            min_soc_percentage: 5.0,
            max_soc_percentage: 100.0,
        },
        inverter: InverterSpec {
            device_id: Some("inverter1".into()),
            max_power_wh: 5000.0,
            battery_id: Some("battery1".into()),
        },
        ev: EvSpec::default(),
        appliance: ApplianceSpec::default(),
        temperature_forecast: vec![],
        start_solution: None,
    }
}

/// Mirrors the request like a deterministic EVopt solver that leaves the
/// battery idle: grid import equals the load series, export equals PV.
struct MirrorSolver;

impl Respond for MirrorSolver {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let ts = &payload["time_series"];
        let n = ts["dt"].as_array().unwrap().len();
        let gt = ts["gt"].clone();
        let ft = ts["ft"].clone();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "batteries": [{
                "charging_power": vec![0.0; n],
                "discharging_power": vec![0.0; n],
                "state_of_charge": vec![4000.0; n],
            }],
            "grid_import": gt,
            "grid_export": ft,
        }))
    }
}

#[tokio::test]
async fn zero_pv_passthrough_keeps_battery_idle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/optimize/charge-schedule"))
        .and(body_partial_json(serde_json::json!({
            "strategy": {
                "charging_strategy": "charge_before_export",
                "discharging_strategy": "discharge_before_import"
            },
            "grid": { "p_max_imp": 10000.0, "p_max_exp": 10000.0 }
        })))
        .respond_with(MirrorSolver)
        .expect(1)
        .mount(&server)
        .await;

    let clock = Clock::new(chrono_tz::Europe::Berlin);
    let backend = EvoptBackend::new(server.uri(), clock, Resolution::Hourly);
    let optimized = backend
        .optimize(&request(), Duration::from_secs(5))
        .await
        .expect("optimize should succeed");

    let response = optimized.response;
    // control arrays span the whole day
    assert_eq!(response.ac_charge.len(), 48);
    assert_eq!(response.dc_charge.len(), 48);
    assert_eq!(response.discharge_allowed.len(), 48);
    assert_eq!(response.start_solution.len(), 48);
    assert!(response.ac_charge.iter().all(|v| *v == 0.0));
    assert!(response.dc_charge.iter().all(|v| *v == 0.0));
    assert!(response.discharge_allowed.iter().all(|v| *v == 0));

    // result arrays start at "now": 48 - H slots of the mirrored load
    let future_slots = response.result.grid_import_wh.len();
    assert_eq!(future_slots, 48 - clock.now().format("%H").to_string().parse::<usize>().unwrap());
    assert!(response.result.grid_import_wh.iter().all(|v| *v == 400.0));
    assert!(response.result.grid_export_wh.iter().all(|v| *v == 0.0));
    // zero export -> zero revenue; import priced at 0.0003 €/Wh
    assert!(response.result.revenue_eur.iter().all(|v| *v == 0.0));
    assert!(response
        .result
        .cost_eur
        .iter()
        .all(|v| (*v - 400.0 * 0.0003).abs() < 1e-12));
    // constant 4000 Wh over a 20 kWh battery
    assert!(response
        .result
        .battery_soc_pct
        .iter()
        .all(|v| (*v - 20.0).abs() < 1e-9));
    assert!(response.timestamp.is_some());
}

#[tokio::test]
async fn invalid_request_is_rejected_before_posting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/optimize/charge-schedule"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut bad_request = request();
    bad_request.battery.capacity_wh = -1.0;
    bad_request.ems.load = vec![];

    let backend = EvoptBackend::new(
        server.uri(),
        Clock::new(chrono_tz::Europe::Berlin),
        Resolution::Hourly,
    );
    let err = backend
        .optimize(&bad_request, Duration::from_secs(5))
        .await
        .expect_err("broken request must fail validation");
    match err {
        BackendError::Validation(errors) => {
            assert!(errors.iter().any(|e| e.contains("capacity")));
            assert!(errors.iter().any(|e| e.contains("gesamtlast")));
        }
        other => panic!("expected Validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_failure_is_an_error_value() {
    // nothing listens on this port
    let backend = EvoptBackend::new(
        "http://127.0.0.1:1".into(),
        Clock::new(chrono_tz::Europe::Berlin),
        Resolution::Hourly,
    );
    let err = backend
        .optimize(&request(), Duration::from_secs(2))
        .await
        .expect_err("unreachable server must fail");
    assert!(matches!(err, BackendError::Connection { .. } | BackendError::Timeout { .. }));
}

#[tokio::test]
async fn debug_artifacts_are_written() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("json")).await.unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/optimize/charge-schedule"))
        .respond_with(MirrorSolver)
        .mount(&server)
        .await;

    let backend = EvoptBackend::new(
        server.uri(),
        Clock::new(chrono_tz::Europe::Berlin),
        Resolution::Hourly,
    )
    .with_artifact_dir(dir.path().to_path_buf());
    backend.optimize(&request(), Duration::from_secs(5)).await.unwrap();

    let request_artifact = dir.path().join("json/optimize_request_evopt.json");
    let response_artifact = dir.path().join("json/optimize_response_evopt.json");
    assert!(request_artifact.exists());
    assert!(response_artifact.exists());
    let body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(request_artifact).unwrap()).unwrap();
    assert_eq!(body["strategy"]["charging_strategy"], "charge_before_export");
}
