use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::InverterConfig;

use super::inverter::{Inverter, InverterError, InverterTelemetry};

/// Fronius GEN24 driver. Battery behavior is steered through time-of-use
/// windows on the local config API; telemetry comes from the component
/// cache endpoint.
pub struct FroniusGen24 {
    base_url: String,
    user: String,
    password: String,
    max_grid_charge_rate: f64,
    client: reqwest::Client,
    session: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken", default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComponentCache {
    #[serde(rename = "Body", default)]
    body: ComponentBody,
}

#[derive(Debug, Deserialize, Default)]
struct ComponentBody {
    #[serde(rename = "Data", default)]
    data: serde_json::Map<String, serde_json::Value>,
}

impl FroniusGen24 {
    pub fn new(cfg: &InverterConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            base_url: format!("http://{}", cfg.address.trim_end_matches('/')),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            max_grid_charge_rate: cfg.max_grid_charge_rate,
            client,
            session: Mutex::new(None),
        }
    }

    async fn login(&self) -> Result<String, InverterError> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let url = format!("{}/commands/Login", self.base_url);
        let response: LoginResponse = self
            .client
            .post(&url)
            .json(&json!({ "user": self.user, "password": self.password }))
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| InverterError::Authentication(e.to_string()))?
            .json()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?;
        let token = response
            .access_token
            .ok_or_else(|| InverterError::Authentication("login returned no token".into()))?;
        *session = Some(token.clone());
        debug!("fronius session established");
        Ok(token)
    }

    /// Write the battery time-of-use table. An always-active single window
    /// models the steady-state modes the controller switches between.
    async fn write_timeofuse(&self, entries: serde_json::Value) -> Result<(), InverterError> {
        let token = self.login().await?;
        let url = format!("{}/config/timeofuse", self.base_url);
        let result = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "timeofuse": entries }))
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?;
        if result.status() == reqwest::StatusCode::UNAUTHORIZED {
            // session expired, retry once with a fresh login
            *self.session.lock().await = None;
            let token = self.login().await?;
            self.client
                .post(&url)
                .bearer_auth(&token)
                .json(&json!({ "timeofuse": entries }))
                .send()
                .await
                .map_err(|e| InverterError::Communication(e.to_string()))?
                .error_for_status()
                .map_err(|e| InverterError::Communication(e.to_string()))?;
            return Ok(());
        }
        result
            .error_for_status()
            .map_err(|e| InverterError::Communication(e.to_string()))?;
        Ok(())
    }

    fn all_day_window(schedule_type: &str, power_w: f64) -> serde_json::Value {
        json!([{
            "Active": true,
            "Power": power_w.round() as i64,
            "ScheduleType": schedule_type,
            "TimeTable": { "Start": "00:00", "End": "23:59" },
            "Weekdays": {
                "Mon": true, "Tue": true, "Wed": true, "Thu": true,
                "Fri": true, "Sat": true, "Sun": true
            }
        }])
    }
}

#[async_trait]
impl Inverter for FroniusGen24 {
    fn kind(&self) -> &str {
        "fronius_gen24"
    }

    async fn set_force_charge(&self, watts: f64) -> Result<(), InverterError> {
        let clamped = watts.clamp(0.0, self.max_grid_charge_rate);
        self.write_timeofuse(Self::all_day_window("CHARGE_MIN", clamped)).await?;
        info!(watts = clamped, "inverter set to force charge");
        Ok(())
    }

    async fn set_avoid_discharge(&self) -> Result<(), InverterError> {
        self.write_timeofuse(Self::all_day_window("DISCHARGE_MAX", 0.0)).await?;
        info!("inverter set to avoid discharge");
        Ok(())
    }

    async fn set_allow_discharge(&self) -> Result<(), InverterError> {
        self.write_timeofuse(json!([])).await?;
        info!("inverter set to allow discharge");
        Ok(())
    }

    fn supports_pv_charge_limit(&self) -> bool {
        true
    }

    async fn set_max_pv_charge_rate(&self, watts: f64) -> Result<(), InverterError> {
        let token = self.login().await?;
        let url = format!("{}/config/batteries", self.base_url);
        self.client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "HYB_EM_POWER_MAX": watts.round() as i64 }))
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| InverterError::Communication(e.to_string()))?;
        debug!(watts, "max PV charge rate set");
        Ok(())
    }

    fn supports_telemetry(&self) -> bool {
        true
    }

    /// Read module temperatures and fan-control percentages from the
    /// component cache.
    async fn fetch_telemetry(&self) -> Result<InverterTelemetry, InverterError> {
        let url = format!("{}/components/cache/readable", self.base_url);
        let cache: ComponentCache = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?
            .error_for_status()
            .map_err(|e| InverterError::Communication(e.to_string()))?
            .json()
            .await
            .map_err(|e| InverterError::Communication(e.to_string()))?;

        Ok(extract_telemetry(&cache))
    }
}

fn extract_telemetry(cache: &ComponentCache) -> InverterTelemetry {
    let mut telemetry = InverterTelemetry::default();
    for component in cache.body.data.values() {
        let Some(channels) = component.get("channels").and_then(|c| c.as_object()) else {
            continue;
        };
        for (name, value) in channels {
            let Some(v) = value.as_f64() else { continue };
            if let Some(module) = name.strip_prefix("MODULE_TEMPERATURE_MEAN_") {
                telemetry
                    .temperatures_c
                    .insert(module.trim_end_matches("_F32").to_lowercase(), v);
            } else if let Some(fan) = name.strip_prefix("FANCONTROL_PERCENT_") {
                telemetry
                    .fan_percent
                    .insert(fan.trim_end_matches("_F32").to_lowercase(), v);
            }
        }
    }
    telemetry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeofuse_window_shape() {
        let window = FroniusGen24::all_day_window("CHARGE_MIN", 1500.4);
        let entry = &window[0];
        assert_eq!(entry["Power"], 1500);
        assert_eq!(entry["ScheduleType"], "CHARGE_MIN");
        assert_eq!(entry["TimeTable"]["End"], "23:59");
        assert_eq!(entry["Weekdays"]["Sun"], true);
    }

    #[test]
    fn telemetry_channel_names_are_mapped() {
        let cache: ComponentCache = serde_json::from_value(json!({
            "Body": { "Data": {
                "393216": { "channels": {
                    "MODULE_TEMPERATURE_MEAN_01_F32": 42.5,
                    "MODULE_TEMPERATURE_MEAN_03_F32": 38.1,
                    "FANCONTROL_PERCENT_01_F32": 55.0,
                    "COM_API_STATE_U16": 1.0
                }}
            }}
        }))
        .unwrap();
        let telemetry = extract_telemetry(&cache);
        assert_eq!(telemetry.temperatures_c.len(), 2);
        assert_eq!(telemetry.temperatures_c["01"], 42.5);
        assert_eq!(telemetry.fan_percent["01"], 55.0);
    }
}
