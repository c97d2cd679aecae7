use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Overall inverter operating mode selected by the control state machine.
///
/// The numeric representation is part of the external surface (MQTT,
/// `current_controls.json`) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[repr(i8)]
pub enum OverallState {
    #[strum(serialize = "charge from grid")]
    ChargeFromGrid = 0,
    #[strum(serialize = "avoid discharge")]
    AvoidDischarge = 1,
    #[strum(serialize = "allow discharge")]
    DischargeAllowed = 2,
    #[strum(serialize = "avoid discharge - EV fast charge")]
    AvoidDischargeEvFast = 3,
    #[strum(serialize = "allow discharge - EV PV charge")]
    DischargeAllowedEvPv = 4,
    #[strum(serialize = "allow discharge - EV min PV charge")]
    DischargeAllowedEvMinPv = 5,
    #[strum(serialize = "uninitialized")]
    Uninitialized = -1,
}

impl OverallState {
    pub fn as_num(self) -> i8 {
        self as i8
    }

    pub fn from_num(n: i8) -> Option<Self> {
        match n {
            0 => Some(Self::ChargeFromGrid),
            1 => Some(Self::AvoidDischarge),
            2 => Some(Self::DischargeAllowed),
            3 => Some(Self::AvoidDischargeEvFast),
            4 => Some(Self::DischargeAllowedEvPv),
            5 => Some(Self::DischargeAllowedEvMinPv),
            -1 => Some(Self::Uninitialized),
            _ => None,
        }
    }
}

/// EV charging mode as reported by the charge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChargingMode {
    Off,
    Pv,
    MinPv,
    Now,
}

impl ChargingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "pv" => Some(Self::Pv),
            "minpv" => Some(Self::MinPv),
            "now" => Some(Self::Now),
            _ => None,
        }
    }
}

/// Control decision for one horizon hour, extracted from the optimizer
/// response for status reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlDecision {
    pub ac_charge_demand: f64,
    pub dc_charge_demand: f64,
    pub discharge_allowed: bool,
    pub error: bool,
    pub hour: i8,
}

impl Default for ControlDecision {
    fn default() -> Self {
        Self {
            ac_charge_demand: 0.0,
            dc_charge_demand: 0.0,
            discharge_allowed: false,
            error: false,
            hour: -1,
        }
    }
}

/// Manual mode override set via HTTP or MQTT; supersedes optimizer-driven
/// selection until its end time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeOverride {
    pub mode: i8,
    pub end_time: DateTime<Utc>,
    pub grid_charge_w: f64,
}

impl ModeOverride {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.mode >= 0 && now < self.end_time
    }
}
