use std::time::Duration;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use eos_bridge::clock::Clock;
use eos_bridge::domain::{
    ApplianceSpec, BatterySpec, EmsData, EvSpec, InverterSpec, OptimizeRequest,
};
use eos_bridge::optimizer::eos::{EosBackend, EosVersion};
use eos_bridge::optimizer::{BackendError, OptimizerBackend};

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
        ev: EvSpec { device_id: Some("ev1".into()), ..EvSpec::default() },
        appliance: ApplianceSpec { device_id: Some("dishwasher1".into()), ..ApplianceSpec::default() },
        temperature_forecast: vec![2.5; 48],
        start_solution: None,
    }
}

fn canonical_response_body() -> serde_json::Value {
    serde_json::json!({
        "ac_charge": vec![0.5; 48],
        "dc_charge": vec![1.0; 48],
        "discharge_allowed": vec![0; 48],
        "start_solution": vec![1.0; 48],
        "result": {
            "Netzbezug_Wh_pro_Stunde": vec![400.0; 48],
            "Gesamtkosten_Euro": 4.2
        },
        "washingstart": 11
    })
}

async fn backend_for(server: &MockServer) -> EosBackend {
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "alive"
        })))
        .mount(server)
        .await;
    EosBackend::connect(server.uri(), Clock::new(chrono_tz::Europe::Berlin)).await
}

#[tokio::test]
async fn passes_request_through_and_parses_response() {
    let server = MockServer::start().await;
    let backend = backend_for(&server).await;
    assert_eq!(backend.version(), EosVersion::AtLeast20250409);

    let hour = Clock::new(chrono_tz::Europe::Berlin).now().format("%-H").to_string();
    Mock::given(method("POST"))
        .and(path("/optimize"))
        .and(query_param("start_hour", hour))
        .respond_with(ResponseTemplate::new(200).set_body_json(canonical_response_body()))
        .expect(1)
        .mount(&server)
        .await;

    let optimized = backend
        .optimize(&request(), Duration::from_secs(5))
        .await
        .expect("optimize should succeed");
    assert_eq!(optimized.response.ac_charge.len(), 48);
    assert_eq!(optimized.response.ac_charge[0], 0.5);
    assert_eq!(optimized.response.washingstart, Some(11));
    assert_eq!(optimized.response.result.grid_import_wh, vec![400.0; 48]);
    assert!(optimized.avg_runtime_s > 0.0);
}

#[tokio::test]
async fn http_error_is_reported_not_raised() {
    let server = MockServer::start().await;
    let backend = backend_for(&server).await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = backend
        .optimize(&request(), Duration::from_secs(5))
        .await
        .expect_err("500 must surface as an error value");
    match err {
        BackendError::Http { status, .. } => assert_eq!(status, 500),
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_yields_timeout_error() {
    let server = MockServer::start().await;
    let backend = backend_for(&server).await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(canonical_response_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let err = backend
        .optimize(&request(), Duration::from_millis(200))
        .await
        .expect_err("slow server must time out");
    assert!(matches!(err, BackendError::Timeout { .. }));
}

#[tokio::test]
async fn missing_health_endpoint_means_old_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let backend = EosBackend::connect(server.uri(), Clock::new(chrono_tz::Europe::Berlin)).await;
    assert_eq!(backend.version(), EosVersion::Pre20250409);
}

#[tokio::test]
async fn invalid_json_body_is_an_error() {
    let server = MockServer::start().await;
    let backend = backend_for(&server).await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = backend
        .optimize(&request(), Duration::from_secs(5))
        .await
        .expect_err("garbage body must fail");
    assert!(matches!(err, BackendError::InvalidJson(_)));
}
