use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::InverterConfig;

use super::fronius::FroniusGen24;

#[derive(Debug, Error)]
pub enum InverterError {
    #[error("communication error: {0}")]
    Communication(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("operation not supported by this inverter")]
    NotSupported,
}

/// Per-module temperatures and fan percentages, published by the inner
/// telemetry loop.
#[derive(Debug, Clone, Default)]
pub struct InverterTelemetry {
    pub temperatures_c: BTreeMap<String, f64>,
    pub fan_percent: BTreeMap<String, f64>,
}

/// Inverter capability interface. Drivers implement whichever commands the
/// hardware supports; command failures are logged by the caller and retried
/// on the next cycle.
#[async_trait]
pub trait Inverter: Send + Sync {
    /// Driver selector string this instance was created for.
    fn kind(&self) -> &str;

    async fn set_force_charge(&self, watts: f64) -> Result<(), InverterError>;
    async fn set_avoid_discharge(&self) -> Result<(), InverterError>;
    async fn set_allow_discharge(&self) -> Result<(), InverterError>;

    fn supports_pv_charge_limit(&self) -> bool {
        false
    }

    async fn set_max_pv_charge_rate(&self, _watts: f64) -> Result<(), InverterError> {
        Err(InverterError::NotSupported)
    }

    fn supports_telemetry(&self) -> bool {
        false
    }

    async fn fetch_telemetry(&self) -> Result<InverterTelemetry, InverterError> {
        Err(InverterError::NotSupported)
    }
}

/// Fallback driver that logs every command without touching hardware.
/// Used for unknown inverter types and pure monitoring setups.
pub struct ShowOnlyInverter;

#[async_trait]
impl Inverter for ShowOnlyInverter {
    fn kind(&self) -> &str {
        "none"
    }

    async fn set_force_charge(&self, watts: f64) -> Result<(), InverterError> {
        info!(watts, "show-only mode: force charge not sent");
        Ok(())
    }

    async fn set_avoid_discharge(&self) -> Result<(), InverterError> {
        info!("show-only mode: avoid discharge not sent");
        Ok(())
    }

    async fn set_allow_discharge(&self) -> Result<(), InverterError> {
        info!("show-only mode: allow discharge not sent");
        Ok(())
    }
}

/// Map the configured inverter type onto a driver. Unknown types degrade to
/// show-only mode so the daemon keeps planning without actuation.
pub fn create_inverter(cfg: &InverterConfig) -> Arc<dyn Inverter> {
    match cfg.kind.as_str() {
        "fronius_gen24" => Arc::new(FroniusGen24::new(cfg)),
        "none" => Arc::new(ShowOnlyInverter),
        other => {
            warn!(
                inverter_type = other,
                "inverter type has no external connection, changing to show-only mode"
            );
            Arc::new(ShowOnlyInverter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(kind: &str) -> InverterConfig {
        InverterConfig {
            kind: kind.into(),
            address: "192.168.1.50".into(),
            user: "customer".into(),
            password: "secret".into(),
            max_grid_charge_rate: 5000.0,
            max_pv_charge_rate: 5000.0,
        }
    }

    #[test]
    fn factory_maps_known_types() {
        assert_eq!(create_inverter(&cfg("fronius_gen24")).kind(), "fronius_gen24");
        assert_eq!(create_inverter(&cfg("none")).kind(), "none");
        assert_eq!(create_inverter(&cfg("victron_legacy")).kind(), "none");
    }

    #[tokio::test]
    async fn show_only_accepts_all_commands() {
        let inv = ShowOnlyInverter;
        assert!(inv.set_force_charge(1500.0).await.is_ok());
        assert!(inv.set_avoid_discharge().await.is_ok());
        assert!(inv.set_allow_discharge().await.is_ok());
        assert!(!inv.supports_pv_charge_limit());
        assert!(inv.fetch_telemetry().await.is_err());
    }
}
