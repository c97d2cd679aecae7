use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::BatteryConfig;
use crate::forecast::PortError;

const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// SoC above which the charge power limit is derated linearly.
const TAPER_START_SOC: f64 = 85.0;
/// Fraction of the configured maximum still allowed at the upper SoC bound.
const TAPER_FLOOR: f64 = 0.1;

/// Battery port: polls the state-of-charge sensor and derives the
/// SoC-dependent charge power limit.
pub struct BatteryService {
    cfg: BatteryConfig,
    client: reqwest::Client,
    soc_tx: watch::Sender<f64>,
}

#[derive(Debug, Deserialize)]
struct SensorState {
    state: String,
}

impl BatteryService {
    pub fn new(cfg: BatteryConfig) -> Result<Self, PortError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(6))
            .default_headers(headers)
            .build()
            .map_err(|e| PortError::Request(e.to_string()))?;
        let (soc_tx, _) = watch::channel(0.0);
        Ok(Self { cfg, client, soc_tx })
    }

    /// Last known state of charge in percent.
    pub fn current_soc(&self) -> f64 {
        *self.soc_tx.borrow()
    }

    /// Subscribe to SoC changes; the control state machine re-runs on
    /// updates without a new optimization.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.soc_tx.subscribe()
    }

    /// Current upper bound on charge power: full below the taper start,
    /// linear toward `TAPER_FLOOR` of maximum at the upper SoC bound.
    pub fn dyn_max_charge_power(&self) -> f64 {
        let soc = self.current_soc();
        let max = self.cfg.max_charge_power_w;
        if soc <= TAPER_START_SOC {
            return max;
        }
        let span = (self.cfg.max_soc_percentage - TAPER_START_SOC).max(1.0);
        let progress = ((soc - TAPER_START_SOC) / span).clamp(0.0, 1.0);
        max * (1.0 - progress * (1.0 - TAPER_FLOOR))
    }

    /// Energy between the configured SoC bounds, in Wh.
    pub fn usable_capacity_wh(&self) -> f64 {
        self.cfg.capacity_wh * (self.cfg.max_soc_percentage - self.cfg.min_soc_percentage) / 100.0
    }

    /// Energy currently stored, in Wh.
    pub fn remaining_energy_wh(&self) -> f64 {
        self.cfg.capacity_wh * self.current_soc() / 100.0
    }

    pub fn capacity_wh(&self) -> f64 {
        self.cfg.capacity_wh
    }

    /// Fetch the live SoC once. Failures keep the last known value.
    pub async fn refresh_soc(&self) -> f64 {
        if self.cfg.url.is_empty() || self.cfg.soc_sensor.is_empty() {
            debug!("no battery SoC sensor configured, keeping last known value");
            return self.current_soc();
        }
        match self.fetch_soc().await {
            Ok(soc) => {
                self.soc_tx.send_if_modified(|current| {
                    if (*current - soc).abs() > f64::EPSILON {
                        *current = soc;
                        true
                    } else {
                        false
                    }
                });
                soc
            }
            Err(e) => {
                error!(error = %e, "battery SoC fetch failed, keeping last known value");
                self.current_soc()
            }
        }
    }

    async fn fetch_soc(&self) -> Result<f64, PortError> {
        let url = format!(
            "{}/api/states/{}",
            self.cfg.url.trim_end_matches('/'),
            self.cfg.soc_sensor
        );
        let mut headers = HeaderMap::new();
        if !self.cfg.access_token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.cfg.access_token))
                    .map_err(|e| PortError::Request(e.to_string()))?,
            );
        }
        let payload: SensorState = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(PortError::from_reqwest)?
            .error_for_status()
            .map_err(PortError::from_reqwest)?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;
        let soc = payload
            .state
            .parse::<f64>()
            .map_err(|e| PortError::InvalidPayload(format!("SoC state not numeric: {e}")))?;
        if !(0.0..=100.0).contains(&soc) {
            return Err(PortError::InvalidPayload(format!("SoC out of range: {soc}")));
        }
        Ok(soc)
    }

    pub async fn run_update_loop(self: Arc<Self>, stop: CancellationToken) {
        info!("battery update service started");
        loop {
            self.refresh_soc().await;
            let mut remaining = UPDATE_INTERVAL;
            while !remaining.is_zero() {
                if stop.is_cancelled() {
                    info!("battery update service stopped");
                    return;
                }
                let chunk = remaining.min(Duration::from_secs(1));
                tokio::time::sleep(chunk).await;
                remaining -= chunk;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> BatteryService {
        BatteryService::new(BatteryConfig {
            url: String::new(),
            soc_sensor: String::new(),
            access_token: String::new(),
            capacity_wh: 20_000.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            max_charge_power_w: 5000.0,
            min_soc_percentage: 5.0,
            max_soc_percentage: 100.0,
        })
        .unwrap()
    }

    #[test]
    fn full_charge_power_below_taper() {
        let svc = service();
        svc.soc_tx.send_replace(50.0);
        assert_eq!(svc.dyn_max_charge_power(), 5000.0);
        svc.soc_tx.send_replace(85.0);
        assert_eq!(svc.dyn_max_charge_power(), 5000.0);
    }

    #[test]
    fn charge_power_tapers_toward_full() {
        let svc = service();
        svc.soc_tx.send_replace(100.0);
        assert!((svc.dyn_max_charge_power() - 500.0).abs() < 1e-9);
        svc.soc_tx.send_replace(92.5);
        let mid = svc.dyn_max_charge_power();
        assert!(mid > 500.0 && mid < 5000.0);
    }

    #[test]
    fn energy_accounting() {
        let svc = service();
        svc.soc_tx.send_replace(20.0);
        assert_eq!(svc.remaining_energy_wh(), 4000.0);
        assert_eq!(svc.usable_capacity_wh(), 19_000.0);
    }
}
