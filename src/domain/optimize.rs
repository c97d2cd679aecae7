use serde::{Deserialize, Serialize};

/// Energy-management time-series block of an optimize request.
///
/// The wire names are the optimizer's native (German) field names; the
/// struct fields carry the canonical internal names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmsData {
    #[serde(rename = "pv_prognose_wh")]
    pub pv: Vec<f64>,
    #[serde(rename = "strompreis_euro_pro_wh")]
    pub price_import: Vec<f64>,
    #[serde(rename = "einspeiseverguetung_euro_pro_wh")]
    pub price_feedin: Vec<f64>,
    #[serde(rename = "preis_euro_pro_wh_akku", default)]
    pub battery_price: f64,
    #[serde(rename = "gesamtlast")]
    pub load: Vec<f64>,
}

/// Static battery parameters plus the live state of charge at cycle start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub capacity_wh: f64,
    pub charging_efficiency: f64,
    pub discharging_efficiency: f64,
    pub max_charge_power_w: f64,
    pub initial_soc_percentage: f64,
    pub min_soc_percentage: f64,
    pub max_soc_percentage: f64,
}

/// Inverter limits as the optimizer sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub max_power_wh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_id: Option<String>,
}

/// Electric-vehicle block; the daemon sends a fixed placeholder spec the
/// same way the production deployments do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub capacity_wh: f64,
    pub charging_efficiency: f64,
    pub discharging_efficiency: f64,
    pub max_charge_power_w: f64,
    pub initial_soc_percentage: f64,
    pub min_soc_percentage: f64,
    pub max_soc_percentage: f64,
}

impl Default for EvSpec {
    fn default() -> Self {
        Self {
            device_id: None,
            capacity_wh: 27_000.0,
            charging_efficiency: 0.90,
            discharging_efficiency: 0.95,
            max_charge_power_w: 7_360.0,
            initial_soc_percentage: 50.0,
            min_soc_percentage: 5.0,
            max_soc_percentage: 100.0,
        }
    }
}

/// Schedulable household appliance (the optimizer calls it a dishwasher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub consumption_wh: f64,
    pub duration_h: u32,
}

impl Default for ApplianceSpec {
    fn default() -> Self {
        Self {
            device_id: None,
            consumption_wh: 1.0,
            duration_h: 1,
        }
    }
}

/// Canonical optimize request assembled from the port values each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub ems: EmsData,
    #[serde(rename = "pv_akku")]
    pub battery: BatterySpec,
    #[serde(rename = "inverter")]
    pub inverter: InverterSpec,
    #[serde(rename = "eauto")]
    pub ev: EvSpec,
    #[serde(rename = "dishwasher")]
    pub appliance: ApplianceSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub temperature_forecast: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_solution: Option<Vec<f64>>,
}

impl OptimizeRequest {
    /// The ems series actually present (non-empty), for length checks.
    pub fn present_series(&self) -> Vec<(&'static str, &[f64])> {
        [
            ("pv_prognose_wh", self.ems.pv.as_slice()),
            ("strompreis_euro_pro_wh", self.ems.price_import.as_slice()),
            ("einspeiseverguetung_euro_pro_wh", self.ems.price_feedin.as_slice()),
            ("gesamtlast", self.ems.load.as_slice()),
        ]
        .into_iter()
        .filter(|(_, s)| !s.is_empty())
        .collect()
    }
}

/// Per-slot result arrays the optimizer reports for the UI. Result arrays
/// start at "now"; only the control arrays are padded for elapsed slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizeResult {
    #[serde(rename = "Last_Wh_pro_Stunde", default)]
    pub load_wh: Vec<f64>,
    #[serde(rename = "Netzbezug_Wh_pro_Stunde", default)]
    pub grid_import_wh: Vec<f64>,
    #[serde(rename = "Netzeinspeisung_Wh_pro_Stunde", default)]
    pub grid_export_wh: Vec<f64>,
    #[serde(rename = "Kosten_Euro_pro_Stunde", default)]
    pub cost_eur: Vec<f64>,
    #[serde(rename = "Einnahmen_Euro_pro_Stunde", default)]
    pub revenue_eur: Vec<f64>,
    #[serde(rename = "Verluste_Pro_Stunde", default)]
    pub losses_wh: Vec<f64>,
    #[serde(rename = "akku_soc_pro_stunde", default, skip_serializing_if = "Vec::is_empty")]
    pub battery_soc_pct: Vec<f64>,
    #[serde(rename = "Home_appliance_wh_per_hour", default)]
    pub appliance_wh: Vec<f64>,
    #[serde(rename = "Electricity_price", default)]
    pub electricity_price: Vec<f64>,
    #[serde(rename = "Gesamt_Verluste", default)]
    pub total_losses_wh: f64,
    #[serde(rename = "Gesamtbilanz_Euro", default)]
    pub total_balance_eur: f64,
    #[serde(rename = "Gesamteinnahmen_Euro", default)]
    pub total_revenue_eur: f64,
    #[serde(rename = "Gesamtkosten_Euro", default)]
    pub total_cost_eur: f64,
}

/// Canonical optimize response. Control arrays (`ac_charge`, `dc_charge`,
/// `discharge_allowed`, `start_solution`) span the full day, head-padded
/// with zeros for elapsed slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizeResponse {
    #[serde(default)]
    pub ac_charge: Vec<f64>,
    #[serde(default)]
    pub dc_charge: Vec<f64>,
    #[serde(default)]
    pub discharge_allowed: Vec<u8>,
    #[serde(default)]
    pub eautocharge_hours_float: Option<Vec<f64>>,
    #[serde(default)]
    pub result: OptimizeResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eauto_obj: Option<serde_json::Value>,
    #[serde(default)]
    pub start_solution: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub washingstart: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl OptimizeResponse {
    /// A response is usable for control when it carries control arrays and
    /// a non-trivial start solution.
    pub fn has_control_data(&self) -> bool {
        !self.ac_charge.is_empty()
            && !self.dc_charge.is_empty()
            && !self.discharge_allowed.is_empty()
            && self.start_solution.len() > 1
    }
}
