use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{ChargingMode, ControlDecision, ModeOverride, OverallState};
use crate::hardware::EvccState;

/// A state change within this window is "recent"; only then are inverter
/// commands (re-)issued.
pub const RECENT_CHANGE_WINDOW_S: i64 = 180;

/// Select the overall state from the EV charger situation and the
/// current-hour optimizer decision. Override handling lives in the state
/// machine, not here. EV charging takes priority over optimizer output; an
/// EV in mode `off` (or a transient charging flag without a supported mode)
/// falls through to optimizer-driven selection.
pub fn select_state(
    ev_charging: bool,
    ev_mode: ChargingMode,
    ac_charge_demand: f64,
    _dc_charge_demand: f64,
    discharge_allowed: bool,
) -> OverallState {
    if ev_charging {
        match ev_mode {
            ChargingMode::Now => return OverallState::AvoidDischargeEvFast,
            ChargingMode::Pv => return OverallState::DischargeAllowedEvPv,
            ChargingMode::MinPv => return OverallState::DischargeAllowedEvMinPv,
            ChargingMode::Off => {}
        }
    }
    if ac_charge_demand > 0.0 {
        OverallState::ChargeFromGrid
    } else if discharge_allowed {
        OverallState::DischargeAllowed
    } else {
        OverallState::AvoidDischarge
    }
}

/// Power targets for the next inverter command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTargets {
    pub ac_charge_w: f64,
    pub pv_charge_w: f64,
}

/// Snapshot of the machine for the UI and MQTT.
#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub ac_charge_demand: f64,
    pub dc_charge_demand: f64,
    pub discharge_allowed: bool,
    pub overall_state: OverallState,
    pub overall_state_num: i8,
    pub override_active: bool,
    pub override_end_time: Option<DateTime<Utc>>,
    pub override_charge_w: f64,
    pub battery_soc: f64,
    pub ev_charging: bool,
    pub ev_mode: ChargingMode,
}

#[derive(Debug)]
struct MachineInner {
    ac_charge_demand: f64,
    dc_charge_demand: f64,
    discharge_allowed: bool,
    battery_soc: f64,
    ev: EvccState,
    overall: OverallState,
    changed_at: DateTime<Utc>,
    override_: Option<ModeOverride>,
}

/// The control state machine: folds optimizer decisions, telemetry and the
/// manual override into an overall state, and decides whether the inverter
/// gets commanded.
#[derive(Debug)]
pub struct ControlStateMachine {
    max_grid_charge_w: f64,
    max_pv_charge_w: f64,
    inner: Mutex<MachineInner>,
}

impl ControlStateMachine {
    pub fn new(max_grid_charge_w: f64, max_pv_charge_w: f64) -> Self {
        Self {
            max_grid_charge_w,
            max_pv_charge_w,
            inner: Mutex::new(MachineInner {
                ac_charge_demand: 0.0,
                dc_charge_demand: 0.0,
                discharge_allowed: false,
                battery_soc: 0.0,
                ev: EvccState::default(),
                overall: OverallState::Uninitialized,
                changed_at: DateTime::<Utc>::MIN_UTC,
                override_: None,
            }),
        }
    }

    pub fn max_grid_charge_w(&self) -> f64 {
        self.max_grid_charge_w
    }

    /// Take over the optimizer decision for the current hour.
    pub fn set_control_demands(&self, decision: &ControlDecision) {
        let mut inner = self.inner.lock();
        inner.ac_charge_demand = decision.ac_charge_demand;
        inner.dc_charge_demand = decision.dc_charge_demand;
        inner.discharge_allowed = decision.discharge_allowed;
    }

    pub fn set_battery_soc(&self, soc: f64) {
        self.inner.lock().battery_soc = soc;
    }

    pub fn set_evcc_state(&self, ev: EvccState) {
        self.inner.lock().ev = ev;
    }

    /// Install or clear the manual override. Negative modes clear.
    pub fn set_override(
        &self,
        mode: i8,
        duration: ChronoDuration,
        grid_charge_w: f64,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        if mode < 0 {
            if inner.override_.take().is_some() {
                info!("mode override cleared");
            }
            return;
        }
        let end_time = now + duration;
        inner.override_ = Some(ModeOverride { mode, end_time, grid_charge_w });
        info!(mode, end_time = %end_time, grid_charge_w, "mode override set");
    }

    pub fn override_state(&self, now: DateTime<Utc>) -> Option<ModeOverride> {
        self.inner.lock().override_.filter(|o| o.is_active(now))
    }

    /// Re-run state selection with the current inputs. An expired override
    /// is dropped here, which itself counts as a state change.
    pub fn reevaluate(&self, now: DateTime<Utc>) -> OverallState {
        let mut inner = self.inner.lock();

        if let Some(override_) = inner.override_ {
            if !override_.is_active(now) {
                inner.override_ = None;
                info!("mode override expired, returning to optimizer-driven selection");
            }
        }

        let selected = match inner.override_ {
            Some(override_) => OverallState::from_num(override_.mode)
                .unwrap_or(OverallState::Uninitialized),
            None => select_state(
                inner.ev.charging,
                inner.ev.mode,
                inner.ac_charge_demand,
                inner.dc_charge_demand,
                inner.discharge_allowed,
            ),
        };

        if selected != inner.overall {
            info!(from = %inner.overall, to = %selected, "overall state changed");
            inner.overall = selected;
            inner.changed_at = now;
        } else {
            debug!(state = %selected, "overall state unchanged");
        }
        selected
    }

    pub fn overall_state(&self) -> OverallState {
        self.inner.lock().overall
    }

    pub fn was_changed_recently(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock();
        inner.overall != OverallState::Uninitialized
            && (now - inner.changed_at).num_seconds() < RECENT_CHANGE_WINDOW_S
    }

    /// Compute the command power targets, capped by the battery's current
    /// dynamic charge limit. An active override replaces the AC demand with
    /// its configured grid charge power.
    pub fn power_targets(&self, dyn_max_charge_w: f64, now: DateTime<Utc>) -> PowerTargets {
        let inner = self.inner.lock();
        let ac_request = match inner.override_.filter(|o| o.is_active(now)) {
            Some(override_) => override_.grid_charge_w,
            None => inner.ac_charge_demand * self.max_grid_charge_w,
        };
        PowerTargets {
            ac_charge_w: ac_request.min(dyn_max_charge_w),
            pv_charge_w: (inner.dc_charge_demand * self.max_pv_charge_w).min(dyn_max_charge_w),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ControlSnapshot {
        let inner = self.inner.lock();
        let active = inner.override_.filter(|o| o.is_active(now));
        ControlSnapshot {
            ac_charge_demand: inner.ac_charge_demand,
            dc_charge_demand: inner.dc_charge_demand,
            discharge_allowed: inner.discharge_allowed,
            overall_state: inner.overall,
            overall_state_num: inner.overall.as_num(),
            override_active: active.is_some(),
            override_end_time: active.map(|o| o.end_time),
            override_charge_w: active.map(|o| o.grid_charge_w).unwrap_or(0.0),
            battery_soc: inner.battery_soc,
            ev_charging: inner.ev.charging,
            ev_mode: inner.ev.mode,
        }
    }
}

/// Issue the inverter command matching `state`. Failures are logged; the
/// next cycle retries.
pub async fn dispatch_command(
    state: OverallState,
    targets: PowerTargets,
    inverter: &dyn crate::hardware::Inverter,
) {
    let result = match state {
        OverallState::ChargeFromGrid => {
            info!(watts = targets.ac_charge_w, "inverter mode set to charge from grid");
            inverter.set_force_charge(targets.ac_charge_w).await
        }
        OverallState::AvoidDischarge | OverallState::AvoidDischargeEvFast => {
            info!("inverter mode set to avoid discharge");
            inverter.set_avoid_discharge().await
        }
        OverallState::DischargeAllowed
        | OverallState::DischargeAllowedEvPv
        | OverallState::DischargeAllowedEvMinPv => {
            info!("inverter mode set to allow discharge");
            inverter.set_allow_discharge().await
        }
        OverallState::Uninitialized => {
            warn!("inverter mode not initialized yet");
            return;
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "inverter command failed, retrying next run");
        return;
    }

    if inverter.supports_pv_charge_limit() {
        if let Err(e) = inverter.set_max_pv_charge_rate(targets.pv_charge_w).await {
            warn!(error = %e, "setting max PV charge rate failed");
        }
    }
}
