use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{BackendError, Optimized, OptimizerBackend, RuntimeRing};
use crate::clock::Clock;
use crate::domain::{OptimizeRequest, OptimizeResponse};

/// EOS server schema generation, probed once at startup. Servers from
/// 2025-04-09 onward expect device ids in the request blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosVersion {
    AtLeast20250409,
    Pre20250409,
}

impl EosVersion {
    fn as_str(self) -> &'static str {
        match self {
            EosVersion::AtLeast20250409 => ">=2025-04-09",
            EosVersion::Pre20250409 => "<2025-04-09",
        }
    }
}

/// Pass-through backend for a native EOS optimizer.
pub struct EosBackend {
    base_url: String,
    clock: Clock,
    client: reqwest::Client,
    ring: Mutex<RuntimeRing>,
    version: EosVersion,
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    #[serde(default)]
    status: Option<String>,
}

impl EosBackend {
    /// Build the backend and probe the server generation. The probe is
    /// best-effort; unreachable servers get the current default.
    pub async fn connect(base_url: String, clock: Clock) -> Self {
        let client = http_client();
        let version = Self::probe_version(&client, &base_url).await;
        info!(version = version.as_str(), "EOS server version determined");
        Self {
            base_url,
            clock,
            client,
            ring: Mutex::new(RuntimeRing::default()),
            version,
        }
    }

    pub fn version(&self) -> EosVersion {
        self.version
    }

    async fn probe_version(client: &reqwest::Client, base_url: &str) -> EosVersion {
        let url = format!("{}/v1/health", base_url.trim_end_matches('/'));
        match client.get(&url).timeout(Duration::from_secs(10)).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                EosVersion::Pre20250409
            }
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<HealthPayload>().await {
                    Ok(h) if h.status.as_deref() == Some("alive") => {
                        EosVersion::AtLeast20250409
                    }
                    Ok(_) => EosVersion::AtLeast20250409,
                    Err(e) => {
                        error!(error = %e, "failed to decode EOS health payload, using default version");
                        EosVersion::AtLeast20250409
                    }
                },
                Err(e) => {
                    error!(error = %e, "EOS health probe failed, using default version");
                    EosVersion::AtLeast20250409
                }
            },
            Err(e) => {
                error!(error = %e, "EOS server not reachable for version probe, using default version");
                EosVersion::AtLeast20250409
            }
        }
    }

    /// Serialize the request in the generation the server understands.
    /// Older servers reject the device-id fields.
    fn wire_payload(&self, request: &OptimizeRequest) -> serde_json::Value {
        let mut value = serde_json::to_value(request).unwrap_or_default();
        if self.version == EosVersion::Pre20250409 {
            for block in ["pv_akku", "inverter", "eauto", "dishwasher"] {
                if let Some(obj) = value.get_mut(block).and_then(|v| v.as_object_mut()) {
                    obj.remove("device_id");
                    obj.remove("battery_id");
                }
            }
        }
        value
    }
}

#[async_trait]
impl OptimizerBackend for EosBackend {
    async fn optimize(
        &self,
        request: &OptimizeRequest,
        timeout: Duration,
    ) -> Result<Optimized, BackendError> {
        let start_hour = self.clock.now().hour();
        let url = format!(
            "{}/optimize?start_hour={}",
            self.base_url.trim_end_matches('/'),
            start_hour
        );
        info!(%url, timeout_s = timeout.as_secs(), "requesting optimization");

        let payload = self.wire_payload(request);
        let started = Instant::now();
        let result = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&payload)
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
            debug!(%body, "optimizer error body");
            return Err(BackendError::Http { status: status.as_u16(), body });
        }

        let response: OptimizeResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::InvalidJson(e.to_string()))?;

        let avg_runtime_s = {
            let mut ring = self.ring.lock();
            ring.record(elapsed);
            ring.average()
        };
        let (minutes, seconds) = (elapsed as u64 / 60, elapsed % 60.0);
        info!(minutes, seconds = format!("{seconds:.2}"), "optimization response retrieved");
        Ok(Optimized { response, avg_runtime_s })
    }
}

fn http_client() -> reqwest::Client {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .expect("reqwest client construction cannot fail with static config")
}
