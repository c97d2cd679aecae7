pub mod battery;
pub mod ev_charger;
pub mod fronius;
pub mod inverter;

pub use battery::BatteryService;
pub use ev_charger::{EvccService, EvccState};
pub use inverter::{create_inverter, Inverter, InverterError, InverterTelemetry};
