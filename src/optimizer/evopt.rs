use async_trait::async_trait;
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{BackendError, Optimized, OptimizerBackend, RuntimeRing};
use crate::clock::{seconds_since_midnight, Clock};
use crate::domain::{
    fit_series, fit_series_or_zero, OptimizeRequest, OptimizeResponse, OptimizeResult, Resolution,
};

/// Grid limits and strategies the EVopt server is always given.
const GRID_P_MAX_IMP_W: f64 = 10_000.0;
const GRID_P_MAX_EXP_W: f64 = 10_000.0;
const CHARGING_STRATEGY: &str = "charge_before_export";
const DISCHARGING_STRATEGY: &str = "discharge_before_import";
const DEFAULT_EFFICIENCY: f64 = 0.95;

// ---------------------------------------------------------------------------
// EVopt wire schema

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvoptRequest {
    pub strategy: EvoptStrategy,
    pub grid: EvoptGrid,
    pub batteries: Vec<EvoptBattery>,
    pub time_series: EvoptTimeSeries,
    pub eta_c: f64,
    pub eta_d: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvoptStrategy {
    pub charging_strategy: String,
    pub discharging_strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvoptGrid {
    pub p_max_imp: f64,
    pub p_max_exp: f64,
    pub prc_p_imp_exc: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvoptBattery {
    pub device_id: String,
    pub charge_from_grid: bool,
    pub discharge_to_grid: bool,
    pub s_min: f64,
    pub s_max: f64,
    pub s_initial: f64,
    pub p_demand: Vec<f64>,
    pub s_goal: Vec<f64>,
    pub c_min: f64,
    pub c_max: f64,
    pub d_max: f64,
    pub p_a: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvoptTimeSeries {
    pub dt: Vec<f64>,
    pub gt: Vec<f64>,
    pub ft: Vec<f64>,
    #[serde(rename = "p_N")]
    pub p_n: Vec<f64>,
    #[serde(rename = "p_E")]
    pub p_e: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvoptResponse {
    #[serde(default)]
    pub batteries: Vec<EvoptBatteryResult>,
    #[serde(default)]
    pub grid_import: Vec<f64>,
    #[serde(default)]
    pub grid_export: Vec<f64>,
    #[serde(default)]
    pub start_solution: Option<Vec<f64>>,
    #[serde(default)]
    pub eauto_obj: Option<serde_json::Value>,
    #[serde(default)]
    pub washingstart: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvoptBatteryResult {
    #[serde(default)]
    pub charging_power: Vec<f64>,
    #[serde(default)]
    pub discharging_power: Vec<f64>,
    #[serde(default)]
    pub state_of_charge: Vec<f64>,
}

impl EvoptResponse {
    /// The server sometimes wraps the payload under a `response` key.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        match value.get("response") {
            Some(inner) if inner.is_object() => serde_json::from_value(inner.clone()),
            _ => serde_json::from_value(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Request translation (canonical -> EVopt)

/// Check the canonical request before building the alien payload. Failures
/// here are returned to the caller; the payload is still built for
/// inspection.
pub fn validate_external(request: &OptimizeRequest) -> Vec<String> {
    let mut errors = Vec::new();

    let series = [
        ("pv_prognose_wh", &request.ems.pv),
        ("strompreis_euro_pro_wh", &request.ems.price_import),
        ("einspeiseverguetung_euro_pro_wh", &request.ems.price_feedin),
        ("gesamtlast", &request.ems.load),
    ];
    for (name, values) in &series {
        if values.is_empty() {
            errors.push(format!("ems series {name} is empty"));
        }
        if values.iter().any(|v| v.is_nan() || v.is_infinite()) {
            errors.push(format!("ems series {name} contains NaN or infinite values"));
        }
    }
    let lengths: Vec<usize> = request
        .present_series()
        .iter()
        .map(|(_, v)| v.len())
        .collect();
    if let (Some(min), Some(max)) = (lengths.iter().min(), lengths.iter().max()) {
        if min != max {
            errors.push(format!("ems series lengths differ: min {min}, max {max}"));
        }
    }

    let battery = &request.battery;
    if battery.capacity_wh <= 0.0 {
        errors.push(format!("battery capacity must be positive, got {}", battery.capacity_wh));
    }
    for (name, pct) in [
        ("initial_soc_percentage", battery.initial_soc_percentage),
        ("min_soc_percentage", battery.min_soc_percentage),
        ("max_soc_percentage", battery.max_soc_percentage),
    ] {
        if !(0.0..=100.0).contains(&pct) {
            errors.push(format!("battery {name} outside [0, 100]: {pct}"));
        }
    }
    errors
}

/// Verify the built EVopt payload has the shape the server expects.
/// Violations are logged, never returned.
pub fn validate_internal(evopt: &EvoptRequest) -> Vec<String> {
    let mut errors = Vec::new();
    if evopt.strategy.charging_strategy.is_empty() || evopt.strategy.discharging_strategy.is_empty()
    {
        errors.push("strategy fields must be non-empty strings".into());
    }
    for (name, v) in [
        ("grid.p_max_imp", evopt.grid.p_max_imp),
        ("grid.p_max_exp", evopt.grid.p_max_exp),
        ("grid.prc_p_imp_exc", evopt.grid.prc_p_imp_exc),
    ] {
        if !v.is_finite() {
            errors.push(format!("{name} is not a finite number"));
        }
    }
    let n = evopt.time_series.dt.len();
    if n == 0 {
        errors.push("time_series.dt is empty".into());
    }
    for (name, v) in [
        ("gt", &evopt.time_series.gt),
        ("ft", &evopt.time_series.ft),
        ("p_N", &evopt.time_series.p_n),
        ("p_E", &evopt.time_series.p_e),
    ] {
        if v.len() != n {
            errors.push(format!("time_series.{name} length {} != dt length {n}", v.len()));
        }
        if v.iter().any(|x| !x.is_finite()) {
            errors.push(format!("time_series.{name} contains non-finite values"));
        }
    }
    if evopt.batteries.is_empty() {
        errors.push("batteries must not be empty".into());
    }
    for (i, b) in evopt.batteries.iter().enumerate() {
        if !b.p_demand.is_empty() && b.p_demand.len() != n {
            errors.push(format!("batteries[{i}].p_demand length {} != dt length {n}", b.p_demand.len()));
        }
        if !b.s_goal.is_empty() && b.s_goal.len() != n {
            errors.push(format!("batteries[{i}].s_goal length {} != dt length {n}", b.s_goal.len()));
        }
    }
    errors
}

/// Translate the canonical request into the EVopt schema for the horizon
/// starting at `now`. Pure: identical inputs produce identical payloads.
pub fn translate_request(
    request: &OptimizeRequest,
    now: DateTime<Tz>,
    resolution: Resolution,
) -> EvoptRequest {
    let (sliced, n) = slice_to_horizon(request, now, resolution);
    let [pv, price_import, price_feedin, load] =
        sliced.map(|s| fit_series_or_zero(&s, n));

    let battery = &request.battery;
    let has_battery = battery.capacity_wh > 0.0;
    let battery_entry = if has_battery {
        EvoptBattery {
            device_id: battery.device_id.clone().unwrap_or_else(|| "akku1".into()),
            charge_from_grid: true,
            discharge_to_grid: true,
            s_min: battery.capacity_wh * battery.min_soc_percentage / 100.0,
            s_max: battery.capacity_wh * battery.max_soc_percentage / 100.0,
            s_initial: battery.capacity_wh * battery.initial_soc_percentage / 100.0,
            p_demand: vec![0.0; n],
            s_goal: vec![0.0; n],
            c_min: 0.0,
            c_max: battery.max_charge_power_w,
            d_max: battery.max_charge_power_w,
            p_a: 0.0,
        }
    } else {
        EvoptBattery {
            device_id: "akku1".into(),
            charge_from_grid: false,
            discharge_to_grid: false,
            s_min: 0.0,
            s_max: 0.0,
            s_initial: 0.0,
            p_demand: vec![0.0; n],
            s_goal: vec![0.0; n],
            c_min: 0.0,
            c_max: 0.0,
            d_max: 0.0,
            p_a: 0.0,
        }
    };

    let time_frame_base = f64::from(resolution.slot_seconds());
    let first_dt = time_frame_base
        - f64::from(seconds_since_midnight(now) % resolution.slot_seconds());
    let mut dt = Vec::with_capacity(n);
    dt.push(first_dt);
    dt.resize(n, time_frame_base);

    EvoptRequest {
        strategy: EvoptStrategy {
            charging_strategy: CHARGING_STRATEGY.into(),
            discharging_strategy: DISCHARGING_STRATEGY.into(),
        },
        grid: EvoptGrid {
            p_max_imp: GRID_P_MAX_IMP_W,
            p_max_exp: GRID_P_MAX_EXP_W,
            prc_p_imp_exc: 0.0,
        },
        batteries: vec![battery_entry],
        time_series: EvoptTimeSeries {
            dt,
            gt: load,
            ft: pv,
            p_n: price_import,
            p_e: price_feedin,
        },
        eta_c: if has_battery { battery.charging_efficiency } else { DEFAULT_EFFICIENCY },
        eta_d: if has_battery { battery.discharging_efficiency } else { DEFAULT_EFFICIENCY },
    }
}

/// Drop the elapsed part of today and determine the working length. Hourly
/// series lose their first H entries; quarter-hour series are rotated with
/// wrap-around and capped at 192 slots.
fn slice_to_horizon(
    request: &OptimizeRequest,
    now: DateTime<Tz>,
    resolution: Resolution,
) -> ([Vec<f64>; 4], usize) {
    let series = [
        &request.ems.pv,
        &request.ems.price_import,
        &request.ems.price_feedin,
        &request.ems.load,
    ];
    match resolution {
        Resolution::Hourly => {
            let hour = now.hour() as usize;
            let sliced = series.map(|s| {
                if s.len() > hour {
                    s[hour..].to_vec()
                } else {
                    s.clone()
                }
            });
            let n = sliced
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.len())
                .min()
                .unwrap_or(1)
                .min(resolution.horizon_slots());
            (sliced, n)
        }
        Resolution::QuarterHourly => {
            let slot = now.hour() as usize * 4 + now.minute() as usize / 15;
            let sliced = series.map(|s| {
                if s.is_empty() {
                    return Vec::new();
                }
                let mut rotated = Vec::with_capacity(s.len());
                rotated.extend_from_slice(&s[slot.min(s.len())..]);
                rotated.extend_from_slice(&s[..slot.min(s.len())]);
                rotated.truncate(resolution.horizon_slots());
                rotated
            });
            (sliced, resolution.horizon_slots())
        }
    }
}

// ---------------------------------------------------------------------------
// Response translation (EVopt -> canonical)

/// Rebuild a canonical response from the EVopt answer. Control arrays are
/// left-padded with zeros for the elapsed slots of the day; result arrays
/// start at "now". Pure and stateless.
pub fn translate_response(
    evopt_response: &EvoptResponse,
    evopt_request: &EvoptRequest,
    now: DateTime<Tz>,
    resolution: Resolution,
) -> OptimizeResponse {
    let hour = now.hour() as usize;
    let n = (48 - hour) * resolution.slots_per_hour();
    let elapsed_slots = hour * resolution.slots_per_hour();

    let first_battery = evopt_response.batteries.first();
    let charging_power = fit_series_or_zero(
        first_battery.map(|b| b.charging_power.as_slice()).unwrap_or(&[]),
        n,
    );
    let discharging_power = fit_series_or_zero(
        first_battery.map(|b| b.discharging_power.as_slice()).unwrap_or(&[]),
        n,
    );
    let soc_wh: Vec<f64> = first_battery
        .map(|b| b.state_of_charge.iter().copied().take(n).collect())
        .unwrap_or_default();

    let grid_import = fit_series_or_zero(&evopt_response.grid_import, n);
    let grid_export = fit_series_or_zero(&evopt_response.grid_export, n);

    let p_n = fit_series_or_zero(&evopt_request.time_series.p_n, n);
    let p_e = fit_series_or_zero(&evopt_request.time_series.p_e, n);

    let request_battery = evopt_request.batteries.first();
    let c_max = request_battery
        .map(|b| b.c_max)
        .filter(|c| *c > 0.0)
        .unwrap_or_else(|| {
            let observed = charging_power.iter().copied().fold(0.0f64, f64::max);
            if observed > 0.0 {
                observed
            } else {
                1.0
            }
        });

    let mut ac_charge: Vec<f64> = charging_power
        .iter()
        .zip(grid_import.iter())
        .map(|(ch, gi)| {
            let from_grid = ch.min(*gi);
            let frac = from_grid / c_max;
            if frac.is_nan() {
                0.0
            } else {
                frac.clamp(0.0, 1.0)
            }
        })
        .collect();
    for (ac, gi) in ac_charge.iter_mut().zip(grid_import.iter()) {
        if *gi <= 0.0 {
            *ac = 0.0;
        }
    }

    let dc_charge: Vec<f64> = charging_power
        .iter()
        .map(|ch| if *ch > 0.0 { 1.0 } else { 0.0 })
        .collect();
    let discharge_allowed: Vec<u8> = discharging_power
        .iter()
        .map(|d| u8::from(*d > 1e-9))
        .collect();

    let start_solution: Vec<f64> = match &evopt_response.start_solution {
        Some(solution) => solution.iter().copied().take(n).collect(),
        None => charge_array_start_solution(evopt_response, n).unwrap_or_else(|| vec![0.0; n]),
    };

    let eta_c = evopt_request.eta_c;
    let eta_d = evopt_request.eta_d;
    let cost_eur: Vec<f64> = grid_import.iter().zip(p_n.iter()).map(|(gi, p)| gi * p).collect();
    let revenue_eur: Vec<f64> = grid_export.iter().zip(p_e.iter()).map(|(ge, p)| ge * p).collect();
    let losses_wh: Vec<f64> = charging_power
        .iter()
        .zip(discharging_power.iter())
        .map(|(ch, dch)| ch * (1.0 - eta_c) + dch * (1.0 - eta_d))
        .collect();

    let battery_soc_pct = soc_percent(&soc_wh, request_battery.map(|b| b.s_max));

    let load_wh = if evopt_request.time_series.gt.is_empty() {
        grid_import.clone()
    } else {
        fit_series(&evopt_request.time_series.gt, n)
    };

    let total_cost: f64 = cost_eur.iter().sum();
    let total_revenue: f64 = revenue_eur.iter().sum();
    let total_losses: f64 = losses_wh.iter().sum();

    let pad = vec![0.0; elapsed_slots];
    let pad_u8 = vec![0u8; elapsed_slots];

    OptimizeResponse {
        ac_charge: [pad.clone(), ac_charge].concat(),
        dc_charge: [pad.clone(), dc_charge].concat(),
        discharge_allowed: [pad_u8, discharge_allowed].concat(),
        eautocharge_hours_float: None,
        result: OptimizeResult {
            load_wh,
            grid_import_wh: grid_import,
            grid_export_wh: grid_export,
            cost_eur,
            revenue_eur,
            losses_wh,
            battery_soc_pct,
            appliance_wh: vec![0.0; n],
            electricity_price: p_n,
            total_losses_wh: total_losses,
            total_balance_eur: total_revenue - total_cost,
            total_revenue_eur: total_revenue,
            total_cost_eur: total_cost,
        },
        eauto_obj: evopt_response.eauto_obj.clone(),
        start_solution: [pad, start_solution].concat(),
        washingstart: evopt_response.washingstart,
        timestamp: Some(now.to_rfc3339()),
    }
}

/// Derive a {0,1} start solution from the EV charge array when the server
/// does not echo one.
fn charge_array_start_solution(response: &EvoptResponse, n: usize) -> Option<Vec<f64>> {
    let charge_array = response
        .eauto_obj
        .as_ref()?
        .get("charge_array")?
        .as_array()?;
    Some(
        charge_array
            .iter()
            .take(n)
            .map(|v| if v.as_f64().unwrap_or(0.0) > 0.0 { 1.0 } else { 0.0 })
            .collect(),
    )
}

/// SoC Wh to percent, referenced against the requested `s_max` and falling
/// back to the observed maximum.
fn soc_percent(soc_wh: &[f64], s_max: Option<f64>) -> Vec<f64> {
    if soc_wh.is_empty() {
        return Vec::new();
    }
    let reference = s_max
        .filter(|s| *s > 0.0)
        .or_else(|| {
            let observed = soc_wh.iter().copied().fold(0.0f64, f64::max);
            (observed > 0.0).then_some(observed)
        });
    soc_wh
        .iter()
        .map(|v| match reference {
            Some(r) => v / r * 100.0,
            None => *v,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Backend

/// Translating backend: canonical request in, EVopt wire out and back.
pub struct EvoptBackend {
    base_url: String,
    clock: Clock,
    resolution: Resolution,
    client: reqwest::Client,
    ring: Mutex<RuntimeRing>,
    artifact_dir: Option<PathBuf>,
}

impl EvoptBackend {
    pub fn new(base_url: String, clock: Clock, resolution: Resolution) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            base_url,
            clock,
            resolution,
            client,
            ring: Mutex::new(RuntimeRing::default()),
            artifact_dir: None,
        }
    }

    /// Enable native-schema debug artifacts under `<dir>/json/`.
    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = Some(dir);
        self
    }

    async fn write_artifact<T: Serialize>(&self, name: &str, payload: &T) {
        let Some(dir) = &self.artifact_dir else { return };
        let path = dir.join("json").join(name);
        match serde_json::to_vec_pretty(payload) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), error = %e, "could not write debug artifact");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize debug artifact"),
        }
    }
}

#[async_trait]
impl OptimizerBackend for EvoptBackend {
    async fn optimize(
        &self,
        request: &OptimizeRequest,
        timeout: Duration,
    ) -> Result<Optimized, BackendError> {
        let now = self.clock.now();
        let external_errors = validate_external(request);
        let evopt_request = translate_request(request, now, self.resolution);
        self.write_artifact("optimize_request_evopt.json", &evopt_request).await;
        if !external_errors.is_empty() {
            error!(errors = ?external_errors, "request transformation errors");
            return Err(BackendError::Validation(external_errors));
        }
        let internal_errors = validate_internal(&evopt_request);
        if !internal_errors.is_empty() {
            error!(errors = ?internal_errors, "built EVopt payload failed schema check");
        }

        let url = format!("{}/optimize/charge-schedule", self.base_url.trim_end_matches('/'));
        info!(%url, timeout_s = timeout.as_secs(), "requesting optimization");

        let started = Instant::now();
        let result = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&evopt_request)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &self.base_url, timeout))?;
        let elapsed = started.elapsed().as_secs_f64();

        let status = result.status();
        let body = result
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &self.base_url, timeout))?;
        if !status.is_success() {
            error!(status = %status, "optimization request failed");
            debug!(%body, "EVopt error body");
            return Err(BackendError::Http { status: status.as_u16(), body });
        }

        let raw: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| BackendError::InvalidJson(e.to_string()))?;
        self.write_artifact("optimize_response_evopt.json", &raw).await;
        let evopt_response = EvoptResponse::from_value(raw)
            .map_err(|e| BackendError::InvalidJson(e.to_string()))?;

        let avg_runtime_s = {
            let mut ring = self.ring.lock();
            ring.record(elapsed);
            ring.average()
        };
        let (minutes, seconds) = (elapsed as u64 / 60, elapsed % 60.0);
        info!(minutes, seconds = format!("{seconds:.2}"), "optimization response retrieved");

        let response = translate_response(&evopt_response, &evopt_request, now, self.resolution);
        Ok(Optimized { response, avg_runtime_s })
    }
}
