use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::ChargingMode;
use crate::forecast::PortError;

const UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Charging state of the first loadpoint, as the EV charge controller
/// reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvccState {
    pub charging: bool,
    pub mode: ChargingMode,
    pub configured: bool,
}

impl Default for EvccState {
    fn default() -> Self {
        Self {
            charging: false,
            mode: ChargingMode::Off,
            configured: false,
        }
    }
}

/// EV-charger port against an evcc instance. Publishes state changes over a
/// watch channel; the orchestrator subscribes once and re-runs the control
/// state machine on change.
pub struct EvccService {
    url: String,
    client: reqwest::Client,
    state_tx: watch::Sender<EvccState>,
}

#[derive(Debug, Deserialize)]
struct EvccEnvelope {
    result: EvccResult,
}

#[derive(Debug, Deserialize)]
struct EvccResult {
    #[serde(default)]
    loadpoints: Vec<EvccLoadpoint>,
}

#[derive(Debug, Deserialize)]
struct EvccLoadpoint {
    #[serde(default)]
    charging: Option<bool>,
    #[serde(default)]
    mode: Option<String>,
}

impl EvccService {
    pub fn new(url: String) -> Result<Self, PortError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(6))
            .default_headers(headers)
            .build()
            .map_err(|e| PortError::Request(e.to_string()))?;
        let (state_tx, _) = watch::channel(EvccState::default());
        Ok(Self { url, client, state_tx })
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn current_state(&self) -> EvccState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EvccState> {
        self.state_tx.subscribe()
    }

    async fn fetch_state(&self) -> Result<(bool, ChargingMode), PortError> {
        let url = format!("{}/api/state", self.url.trim_end_matches('/'));
        let envelope: EvccEnvelope = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(PortError::from_reqwest)?
            .error_for_status()
            .map_err(PortError::from_reqwest)?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;

        let loadpoint = envelope
            .result
            .loadpoints
            .into_iter()
            .next()
            .ok_or_else(|| PortError::InvalidPayload("missing loadpoints".into()))?;
        let charging = loadpoint
            .charging
            .ok_or_else(|| PortError::InvalidPayload("charging state missing".into()))?;
        let mode = loadpoint
            .mode
            .as_deref()
            .and_then(ChargingMode::parse)
            .ok_or_else(|| {
                PortError::InvalidPayload(format!(
                    "charging mode not one of off/pv/minpv/now: {:?}",
                    loadpoint.mode
                ))
            })?;
        Ok((charging, mode))
    }

    async fn refresh(&self) {
        match self.fetch_state().await {
            Ok((charging, mode)) => {
                let changed = self.state_tx.send_if_modified(|state| {
                    let next = EvccState { charging, mode, configured: true };
                    if *state != next {
                        *state = next;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    info!(charging, %mode, "EV charging state changed");
                } else {
                    debug!(charging, %mode, "EV charging state unchanged");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to fetch EV charger state");
            }
        }
    }

    pub async fn run_update_loop(self: Arc<Self>, stop: CancellationToken) {
        if !self.is_configured() {
            info!("no evcc endpoint configured, EV charger port idle");
            return;
        }
        info!("evcc update service started");
        loop {
            self.refresh().await;
            let mut remaining = UPDATE_INTERVAL;
            while !remaining.is_zero() {
                if stop.is_cancelled() {
                    info!("evcc update service stopped");
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

    #[test]
    fn parses_loadpoint_payload() {
        let body = r#"{"result":{"loadpoints":[{"charging":true,"mode":"pv"}]}}"#;
        let envelope: EvccEnvelope = serde_json::from_str(body).unwrap();
        let lp = &envelope.result.loadpoints[0];
        assert_eq!(lp.charging, Some(true));
        assert_eq!(lp.mode.as_deref().and_then(ChargingMode::parse), Some(ChargingMode::Pv));
    }

    #[test]
    fn default_state_is_not_charging() {
        let s = EvccState::default();
        assert!(!s.charging);
        assert_eq!(s.mode, ChargingMode::Off);
        assert!(!s.configured);
    }
}
