use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::PortError;
use crate::config::{LoadConfig, LoadSource};

/// Weeks of sensor history aggregated into the weekday profile.
const HISTORY_WEEKS: i64 = 3;

/// Household load port. Produces a 48-slot Wh profile starting at
/// today-midnight, either from a built-in default table or aggregated from
/// a home-automation power sensor. Any upstream failure falls back to the
/// default profile.
pub struct LoadService {
    cfg: LoadConfig,
    client: reqwest::Client,
    tz: Tz,
}

impl LoadService {
    pub fn new(cfg: LoadConfig, tz: Tz) -> Result<Self, PortError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .default_headers(headers)
            .build()
            .map_err(|e| PortError::Request(e.to_string()))?;
        Ok(Self { cfg, client, tz })
    }

    /// The 48-slot load profile for the horizon beginning at `now`'s day.
    pub async fn get_load_profile(&self, tgt_duration: usize, now: DateTime<Tz>) -> Vec<f64> {
        match self.cfg.source {
            LoadSource::Default => {
                info!("using load source default");
                default_profile()[..tgt_duration.min(48)].to_vec()
            }
            LoadSource::HomeAssistant | LoadSource::OpenHab => {
                if self.cfg.load_sensor.is_empty() {
                    error!("load sensor not configured, using default profile");
                    return default_profile()[..tgt_duration.min(48)].to_vec();
                }
                match self.weekday_profile(tgt_duration, now).await {
                    Ok(profile) => profile,
                    Err(e) => {
                        error!(error = %e, "load history fetch failed, using default profile");
                        default_profile()[..tgt_duration.min(48)].to_vec()
                    }
                }
            }
        }
    }

    /// Aggregate sensor history into an average Wh value per (weekday, hour)
    /// and lay the next `tgt_duration` hours out of it.
    async fn weekday_profile(
        &self,
        tgt_duration: usize,
        now: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError> {
        let end = now;
        let start = end - ChronoDuration::weeks(HISTORY_WEEKS);
        let samples = match self.cfg.source {
            LoadSource::HomeAssistant => {
                let mut load = self.fetch_homeassistant(&self.cfg.load_sensor, start, end).await?;
                if !self.cfg.car_charge_load_sensor.is_empty() {
                    match self
                        .fetch_homeassistant(&self.cfg.car_charge_load_sensor, start, end)
                        .await
                    {
                        Ok(car) => subtract_samples(&mut load, &car),
                        Err(e) => warn!(error = %e, "car charge sensor unavailable, not subtracted"),
                    }
                }
                load
            }
            LoadSource::OpenHab => {
                let mut load = self.fetch_openhab(&self.cfg.load_sensor, start, end).await?;
                if !self.cfg.car_charge_load_sensor.is_empty() {
                    match self
                        .fetch_openhab(&self.cfg.car_charge_load_sensor, start, end)
                        .await
                    {
                        Ok(car) => subtract_samples(&mut load, &car),
                        Err(e) => warn!(error = %e, "car charge sensor unavailable, not subtracted"),
                    }
                }
                load
            }
            LoadSource::Default => unreachable!("default source handled by caller"),
        };

        if samples.is_empty() {
            return Err(PortError::InvalidPayload("no history samples".into()));
        }

        // Mean power per (weekday, hour); one hour of mean W equals Wh.
        let mut sums = [[0.0f64; 24]; 7];
        let mut counts = [[0u32; 24]; 7];
        let mut total_sum = 0.0;
        let mut total_count = 0u32;
        for s in &samples {
            let local = s.at.with_timezone(&self.tz);
            let wd = local.weekday().num_days_from_monday() as usize;
            let hour = local.hour() as usize;
            sums[wd][hour] += s.watts;
            counts[wd][hour] += 1;
            total_sum += s.watts;
            total_count += 1;
        }
        let overall_mean = total_sum / f64::from(total_count.max(1));

        let mut profile = Vec::with_capacity(tgt_duration);
        let day_start = crate::clock::today_midnight(now);
        for h in 0..tgt_duration {
            let slot_time = day_start + ChronoDuration::hours(h as i64);
            let wd = slot_time.weekday().num_days_from_monday() as usize;
            let hour = slot_time.hour() as usize;
            let value = if counts[wd][hour] > 0 {
                sums[wd][hour] / f64::from(counts[wd][hour])
            } else {
                overall_mean
            };
            profile.push(value.max(0.0));
        }
        debug!(samples = samples.len(), "load profile built from sensor history");
        Ok(profile)
    }

    async fn fetch_homeassistant(
        &self,
        sensor: &str,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<PowerSample>, PortError> {
        let url = format!(
            "{}/api/history/period/{}",
            self.cfg.url.trim_end_matches('/'),
            start.to_rfc3339(),
        );
        let mut headers = HeaderMap::new();
        if !self.cfg.access_token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.cfg.access_token))
                    .map_err(|e| PortError::Request(e.to_string()))?,
            );
        }
        let payload: Vec<Vec<HaState>> = self
            .client
            .get(&url)
            .query(&[("filter_entity_id", sensor), ("end_time", &end.to_rfc3339())])
            .headers(headers)
            .send()
            .await
            .map_err(PortError::from_reqwest)?
            .error_for_status()
            .map_err(PortError::from_reqwest)?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;

        let samples = payload
            .into_iter()
            .flatten()
            .filter_map(|s| {
                let watts = s.state.parse::<f64>().ok()?;
                let at = DateTime::parse_from_rfc3339(&s.last_changed).ok()?;
                Some(PowerSample { at: at.with_timezone(&chrono::Utc), watts })
            })
            .collect();
        Ok(samples)
    }

    async fn fetch_openhab(
        &self,
        item: &str,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<PowerSample>, PortError> {
        let url = format!(
            "{}/rest/persistence/items/{}",
            self.cfg.url.trim_end_matches('/'),
            item,
        );
        let payload: OpenhabHistory = self
            .client
            .get(&url)
            .query(&[("starttime", start.to_rfc3339()), ("endtime", end.to_rfc3339())])
            .send()
            .await
            .map_err(PortError::from_reqwest)?
            .error_for_status()
            .map_err(PortError::from_reqwest)?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;

        let samples = payload
            .data
            .into_iter()
            .filter_map(|p| {
                let watts = p.state.parse::<f64>().ok()?;
                let at = chrono::DateTime::from_timestamp_millis(p.time)?;
                Some(PowerSample { at, watts })
            })
            .collect();
        Ok(samples)
    }
}

#[derive(Debug)]
struct PowerSample {
    at: DateTime<chrono::Utc>,
    watts: f64,
}

/// Subtract car-charging power from household samples, matched by hour.
fn subtract_samples(load: &mut [PowerSample], car: &[PowerSample]) {
    for sample in load.iter_mut() {
        let hour = sample.at.timestamp() / 3600;
        let car_mean: Vec<f64> = car
            .iter()
            .filter(|c| c.at.timestamp() / 3600 == hour)
            .map(|c| c.watts)
            .collect();
        if !car_mean.is_empty() {
            let mean = car_mean.iter().sum::<f64>() / car_mean.len() as f64;
            sample.watts = (sample.watts - mean).max(0.0);
        }
    }
}

#[derive(Debug, Deserialize)]
struct HaState {
    state: String,
    last_changed: String,
}

#[derive(Debug, Deserialize)]
struct OpenhabHistory {
    #[serde(default)]
    data: Vec<OpenhabPoint>,
}

#[derive(Debug, Deserialize)]
struct OpenhabPoint {
    time: i64,
    state: String,
}

/// Built-in fallback: a typical household day, Wh per hour, repeated for
/// the second day of the horizon.
pub fn default_profile() -> [f64; 48] {
    let day = [
        200.0, 200.0, 200.0, 200.0, 200.0, 300.0, 350.0, 400.0, 350.0, 300.0, 300.0, 550.0,
        450.0, 400.0, 300.0, 300.0, 400.0, 450.0, 500.0, 500.0, 500.0, 400.0, 300.0, 200.0,
    ];
    let mut profile = [0.0; 48];
    profile[..24].copy_from_slice(&day);
    profile[24..].copy_from_slice(&day);
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    #[tokio::test]
    async fn default_source_returns_builtin_profile() {
        let svc = LoadService::new(
            LoadConfig {
                source: LoadSource::Default,
                url: String::new(),
                load_sensor: String::new(),
                car_charge_load_sensor: String::new(),
                access_token: String::new(),
            },
            Berlin,
        )
        .unwrap();
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let profile = svc.get_load_profile(48, now).await;
        assert_eq!(profile.len(), 48);
        assert_eq!(profile[0], 200.0);
        assert_eq!(profile[11], 550.0);
        assert_eq!(profile[24], 200.0);
    }

    #[tokio::test]
    async fn sensor_source_without_sensor_falls_back() {
        let svc = LoadService::new(
            LoadConfig {
                source: LoadSource::HomeAssistant,
                url: "http://ha.local:8123".into(),
                load_sensor: String::new(),
                car_charge_load_sensor: String::new(),
                access_token: String::new(),
            },
            Berlin,
        )
        .unwrap();
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let profile = svc.get_load_profile(48, now).await;
        assert_eq!(profile, default_profile().to_vec());
    }

    #[test]
    fn default_profile_repeats_for_day_two() {
        let p = default_profile();
        assert_eq!(&p[..24], &p[24..]);
        assert_eq!(p.iter().copied().fold(f64::MIN, f64::max), 550.0);
    }
}
