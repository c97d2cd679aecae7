use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::controller::AppState;

use super::error::ApiError;

pub const API_VERSION: &str = "0.0.1";

/// GET /json/current_controls.json - aggregate snapshot for the UI.
pub async fn current_controls(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let snapshot = app.machine.snapshot(now);
    let status = app.state.status();
    let ev = app.evcc.current_state();

    Json(serde_json::json!({
        "current_states": {
            "current_ac_charge_demand": snapshot.ac_charge_demand,
            "current_dc_charge_demand": snapshot.dc_charge_demand,
            "current_discharge_allowed": snapshot.discharge_allowed,
            "inverter_mode": snapshot.overall_state.to_string(),
            "inverter_mode_num": snapshot.overall_state_num,
            "override_active": snapshot.override_active,
            "override_end_time": snapshot.override_end_time,
        },
        "evcc": {
            "charging_state": ev.charging,
            "charging_mode": ev.mode,
            "current_sessions": [],
        },
        "battery": {
            "soc": app.battery.current_soc(),
            "usable_capacity": app.battery.usable_capacity_wh(),
            "max_charge_power_dyn": app.battery.dyn_max_charge_power(),
            "max_grid_charge_rate": app.cfg.inverter.max_grid_charge_rate,
        },
        "inverter": {
            "type": app.inverter.kind(),
            "address": app.cfg.inverter.address,
            "max_grid_charge_rate": app.cfg.inverter.max_grid_charge_rate,
            "max_pv_charge_rate": app.cfg.inverter.max_pv_charge_rate,
        },
        "state": {
            "request_state": status.request_state.map(|s| s.as_str()),
            "last_request_timestamp": status.last_request_timestamp,
            "last_response_timestamp": status.last_response_timestamp,
            "next_run": status.next_run,
        },
        "timestamp": app.clock.now().to_rfc3339(),
        "api_version": API_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ModeOverrideRequest {
    pub mode: i8,
    pub duration: String,
    /// Grid charge power in kW.
    pub grid_charge_power: f64,
}

#[derive(Debug, Serialize)]
pub struct ModeOverrideResponse {
    status: &'static str,
}

/// POST /controls/mode_override - install or clear the manual override.
pub async fn mode_override(
    State(app): State<Arc<AppState>>,
    Json(request): Json<ModeOverrideRequest>,
) -> Result<Json<ModeOverrideResponse>, ApiError> {
    let max_kw = app.cfg.inverter.max_grid_charge_rate / 1000.0;
    if request.mode >= 0 && !(0.5..=max_kw).contains(&request.grid_charge_power) {
        return Err(ApiError::BadRequest(format!(
            "grid_charge_power must be between 0.5 and {max_kw} kW, got {}",
            request.grid_charge_power
        )));
    }
    app.apply_override(
        request.mode,
        &request.duration,
        request.grid_charge_power * 1000.0,
    )
    .await
    .map_err(ApiError::BadRequest)?;
    Ok(Json(ModeOverrideResponse { status: "success" }))
}
