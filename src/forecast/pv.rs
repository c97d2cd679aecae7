use chrono::{DateTime, Duration as ChronoDuration};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::PortError;
use crate::clock::today_midnight;
use crate::config::PvPlaneConfig;
use crate::domain::fit_series;

/// PV and temperature forecast port. One HTTP request per configured panel
/// plane; power is summed element-wise across planes, temperature comes
/// from the first plane.
pub struct PvForecastService {
    planes: Vec<PvPlaneConfig>,
    client: reqwest::Client,
    tz: Tz,
    cache: Arc<RwLock<PvCache>>,
}

#[derive(Debug, Default, Clone)]
struct PvCache {
    power_wh: Vec<f64>,
    temperature_c: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastPayload {
    values: Vec<Vec<ForecastEntry>>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    datetime: String,
    #[serde(default)]
    power: f64,
    #[serde(default)]
    temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetValue {
    Power,
    Temperature,
}

impl PvForecastService {
    pub fn new(planes: Vec<PvPlaneConfig>, tz: Tz) -> Result<Self, PortError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| PortError::Request(e.to_string()))?;
        Ok(Self {
            planes,
            client,
            tz,
            cache: Arc::new(RwLock::new(PvCache::default())),
        })
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn forecast_url(plane: &PvPlaneConfig) -> String {
        let mut url = format!(
            "{}?lat={}&lon={}&azimuth={}&tilt={}&power={}&powerInverter={}&inverterEfficiency={}",
            plane.base_url.trim_end_matches('/'),
            plane.lat,
            plane.lon,
            plane.azimuth,
            plane.tilt,
            plane.power,
            plane.power_inverter,
            plane.inverter_efficiency,
        );
        if !plane.horizon.is_empty() {
            url.push_str("&horizont=");
            url.push_str(&plane.horizon);
        }
        url
    }

    async fn fetch_plane(
        &self,
        plane: &PvPlaneConfig,
        tgt: TargetValue,
        tgt_duration: usize,
        now: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError> {
        let url = Self::forecast_url(plane);
        debug!(plane = %plane.name, "fetching pv forecast");
        let payload: ForecastPayload = self
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

        let window_start = today_midnight(now);
        let window_end = window_start + ChronoDuration::hours(tgt_duration as i64);
        let mut values = Vec::with_capacity(tgt_duration);
        for day in &payload.values {
            for entry in day {
                let Ok(ts) = DateTime::parse_from_rfc3339(&entry.datetime) else {
                    continue;
                };
                let ts = ts.with_timezone(&self.tz);
                if ts >= window_start && ts < window_end {
                    values.push(match tgt {
                        TargetValue::Power => entry.power,
                        TargetValue::Temperature => entry.temperature,
                    });
                }
            }
        }
        if values.is_empty() {
            return Err(PortError::InvalidPayload(format!(
                "no forecast values in window for plane {}",
                plane.name
            )));
        }
        // DST days deliver 47 or 49 entries; fit back to the horizon.
        Ok(fit_series(&values, tgt_duration))
    }

    /// Refresh both cached series. Failing planes are skipped; a cycle with
    /// no reachable plane leaves empty series (the request is still sent).
    pub async fn update(&self, tgt_duration: usize, now: DateTime<Tz>) {
        let mut summed: Vec<f64> = Vec::new();
        for plane in &self.planes {
            match self.fetch_plane(plane, TargetValue::Power, tgt_duration, now).await {
                Ok(series) => {
                    if summed.is_empty() {
                        summed = series;
                    } else {
                        for (acc, v) in summed.iter_mut().zip(series.iter()) {
                            *acc += v;
                        }
                    }
                    info!(plane = %plane.name, "PV forecast fetched successfully");
                }
                Err(e) => {
                    error!(plane = %plane.name, error = %e, "PV forecast fetch failed");
                }
            }
        }

        let temperature = match self.planes.first() {
            Some(first) => match self
                .fetch_plane(first, TargetValue::Temperature, tgt_duration, now)
                .await
            {
                Ok(series) => {
                    info!("temperature forecast fetched successfully");
                    series
                }
                Err(e) => {
                    error!(error = %e, "temperature forecast fetch failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut cache = self.cache.write().await;
        cache.power_wh = summed;
        cache.temperature_c = temperature;
    }

    pub async fn current_power(&self) -> Vec<f64> {
        self.cache.read().await.power_wh.clone()
    }

    pub async fn current_temperature(&self) -> Vec<f64> {
        self.cache.read().await.temperature_c.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> PvPlaneConfig {
        PvPlaneConfig {
            name: "roof".into(),
            base_url: "https://api.akkudoktor.net/forecast".into(),
            lat: 48.812,
            lon: 8.907,
            azimuth: 13.0,
            tilt: 31.0,
            power: 8600.0,
            power_inverter: 8000.0,
            inverter_efficiency: 0.95,
            horizon: String::new(),
        }
    }

    #[test]
    fn url_carries_all_plane_parameters() {
        let url = PvForecastService::forecast_url(&plane());
        assert!(url.contains("lat=48.812"));
        assert!(url.contains("powerInverter=8000"));
        assert!(!url.contains("horizont"));

        let mut shaded = plane();
        shaded.horizon = "10,20,10,15".into();
        let url = PvForecastService::forecast_url(&shaded);
        assert!(url.ends_with("&horizont=10,20,10,15"));
    }
}
