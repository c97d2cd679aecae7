use chrono::DateTime;
use chrono_tz::Tz;
use tracing::debug;

use crate::config::Config;
use crate::domain::{
    ApplianceSpec, BatterySpec, EmsData, EvSpec, InverterSpec, OptimizeRequest,
};
use crate::forecast::{LoadService, PriceService, PvForecastService};
use crate::hardware::BatteryService;

/// Hours of horizon shipped to the optimizer.
pub const TARGET_DURATION_H: usize = 48;

/// Build the optimize request from the current port values. Empty or
/// missing forecasts do not abort the cycle; the request is sent with
/// whatever is available.
pub async fn build_optimize_request(
    cfg: &Config,
    pv: &PvForecastService,
    prices: &PriceService,
    load: &LoadService,
    battery: &BatteryService,
    start_solution: Option<Vec<f64>>,
    now: DateTime<Tz>,
) -> OptimizeRequest {
    pv.update(TARGET_DURATION_H, now).await;

    // present series share length 48; absent forecasts stay empty
    let ems = EmsData {
        pv: crate::domain::fit_series(&pv.current_power().await, TARGET_DURATION_H),
        price_import: crate::domain::fit_series(&prices.current_prices().await, TARGET_DURATION_H),
        price_feedin: crate::domain::fit_series(
            &prices.current_feedin_prices().await,
            TARGET_DURATION_H,
        ),
        battery_price: 0.0,
        load: crate::domain::fit_series(
            &load.get_load_profile(TARGET_DURATION_H, now).await,
            TARGET_DURATION_H,
        ),
    };

    let initial_soc = battery.refresh_soc().await.round();
    let battery_spec = BatterySpec {
        device_id: Some("battery1".into()),
        capacity_wh: cfg.battery.capacity_wh,
        charging_efficiency: cfg.battery.charge_efficiency,
        discharging_efficiency: cfg.battery.discharge_efficiency,
        max_charge_power_w: cfg.battery.max_charge_power_w,
        initial_soc_percentage: initial_soc,
        min_soc_percentage: cfg.battery.min_soc_percentage,
        max_soc_percentage: cfg.battery.max_soc_percentage,
    };

    let request = OptimizeRequest {
        ems,
        battery: battery_spec,
        inverter: InverterSpec {
            device_id: Some("inverter1".into()),
            max_power_wh: cfg.inverter.max_pv_charge_rate,
            battery_id: Some("battery1".into()),
        },
        ev: EvSpec { device_id: Some("ev1".into()), ..EvSpec::default() },
        appliance: ApplianceSpec { device_id: Some("dishwasher1".into()), ..ApplianceSpec::default() },
        temperature_forecast: pv.current_temperature().await,
        start_solution,
    };
    debug!(
        start_solution = request.start_solution.is_some(),
        "optimize request payload assembled"
    );
    request
}
