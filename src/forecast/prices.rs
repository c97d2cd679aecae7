use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{round9, window_wrapping, PortError};
use crate::config::{PriceConfig, PriceSource};

const TIBBER_API: &str = "https://api.tibber.com/v1-beta/gql";
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// One upstream source of day-ahead import prices in €/Wh, hourly from
/// today-midnight.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch_prices(
        &self,
        tgt_duration: usize,
        start: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError>;
}

#[derive(Debug, Default, Clone)]
struct PriceCache {
    import: Vec<f64>,
    feedin: Vec<f64>,
}

/// Price port: caches the latest import and feed-in series and refreshes
/// them periodically and on demand at cycle start.
pub struct PriceService {
    provider: Box<dyn PriceProvider>,
    feed_in_tariff_eur_per_wh: f64,
    negative_price_switch: bool,
    tz: Tz,
    cache: Arc<RwLock<PriceCache>>,
}

impl PriceService {
    /// Assemble from an explicit provider; the config constructor below and
    /// the tests both go through this.
    pub fn from_parts(
        provider: Box<dyn PriceProvider>,
        feed_in_tariff_eur_per_wh: f64,
        negative_price_switch: bool,
        tz: Tz,
    ) -> Self {
        Self {
            provider,
            feed_in_tariff_eur_per_wh,
            negative_price_switch,
            tz,
            cache: Arc::new(RwLock::new(PriceCache::default())),
        }
    }

    pub fn new(cfg: &PriceConfig, tz: Tz) -> Result<Self, PortError> {
        let provider: Box<dyn PriceProvider> = match cfg.source {
            PriceSource::Akkudoktor => Box::new(AkkudoktorPrices::new(cfg.base_url.clone())?),
            PriceSource::Tibber => Box::new(TibberPrices::new(cfg.token.clone())?),
            PriceSource::Fixed24h => Box::new(Fixed24hPrices {
                hourly_eur_per_wh: cfg
                    .fixed_24h_prices
                    .iter()
                    .map(|ct_kwh| round9(ct_kwh / 100_000.0))
                    .collect(),
            }),
        };
        Ok(Self::from_parts(
            provider,
            round9(cfg.feed_in_tariff_ct_per_kwh / 100_000.0),
            cfg.negative_price_switch,
            tz,
        ))
    }

    /// Refresh the cached series for `tgt_duration` hours starting at
    /// `start`. On failure the previous cache is kept.
    pub async fn update_prices(&self, tgt_duration: usize, start: DateTime<Tz>) {
        match self.provider.fetch_prices(tgt_duration, start).await {
            Ok(import) => {
                let feedin = self.build_feedin(&import);
                let mut cache = self.cache.write().await;
                cache.import = import;
                cache.feedin = feedin;
                debug!(
                    hours = tgt_duration,
                    start = %start.format("%Y-%m-%d %H:%M"),
                    "prices updated"
                );
            }
            Err(e) => {
                error!(error = %e, "price refresh failed, keeping previous prices");
            }
        }
    }

    pub async fn current_prices(&self) -> Vec<f64> {
        self.cache.read().await.import.clone()
    }

    pub async fn current_feedin_prices(&self) -> Vec<f64> {
        self.cache.read().await.feedin.clone()
    }

    fn build_feedin(&self, import: &[f64]) -> Vec<f64> {
        if self.negative_price_switch {
            import
                .iter()
                .map(|p| if *p < 0.0 { 0.0 } else { self.feed_in_tariff_eur_per_wh })
                .collect()
        } else {
            import.iter().map(|_| self.feed_in_tariff_eur_per_wh).collect()
        }
    }

    /// Hourly background refresh; sleeps in 1 s chunks so shutdown is
    /// observed promptly.
    pub async fn run_refresh_loop(self: Arc<Self>, stop: CancellationToken) {
        info!("price refresh service started");
        loop {
            let now = chrono::Utc::now().with_timezone(&self.tz);
            self.update_prices(48, crate::clock::today_midnight(now)).await;

            let mut remaining = REFRESH_INTERVAL;
            while !remaining.is_zero() {
                if stop.is_cancelled() {
                    info!("price refresh service stopped");
                    return;
                }
                let chunk = remaining.min(Duration::from_secs(1));
                tokio::time::sleep(chunk).await;
                remaining -= chunk;
            }
        }
    }
}

/// Day-ahead market prices from the Akkudoktor REST API.
pub struct AkkudoktorPrices {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AkkudoktorPricePayload {
    values: Vec<AkkudoktorPriceEntry>,
}

#[derive(Debug, Deserialize)]
struct AkkudoktorPriceEntry {
    #[serde(rename = "marketpriceEurocentPerKWh")]
    marketprice_eurocent_per_kwh: f64,
}

impl AkkudoktorPrices {
    pub fn new(base_url: String) -> Result<Self, PortError> {
        Ok(Self {
            base_url,
            client: http_client(Duration::from_secs(10))?,
        })
    }
}

#[async_trait]
impl PriceProvider for AkkudoktorPrices {
    async fn fetch_prices(
        &self,
        tgt_duration: usize,
        start: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError> {
        let url = format!(
            "{}/prices?start={}&end={}",
            self.base_url.trim_end_matches('/'),
            start.format("%Y-%m-%d"),
            (start + ChronoDuration::days(1)).format("%Y-%m-%d"),
        );
        debug!(%url, "requesting akkudoktor prices");
        let payload: AkkudoktorPricePayload = self
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

        let prices: Vec<f64> = payload
            .values
            .iter()
            .map(|v| round9(v.marketprice_eurocent_per_kwh / 100_000.0))
            .collect();
        if prices.is_empty() {
            return Err(PortError::InvalidPayload("empty price list".into()));
        }
        info!("prices fetched from akkudoktor");
        Ok(window_wrapping(&prices, start.hour() as usize, tgt_duration))
    }
}

/// Spot prices from the Tibber GraphQL API (today + tomorrow; tomorrow is
/// backfilled with today's values until published).
pub struct TibberPrices {
    token: String,
    client: reqwest::Client,
}

impl TibberPrices {
    pub fn new(token: String) -> Result<Self, PortError> {
        Ok(Self {
            token,
            client: http_client(Duration::from_secs(10))?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TibberEnvelope {
    #[serde(default)]
    errors: Option<Vec<TibberError>>,
    data: Option<TibberData>,
}

#[derive(Debug, Deserialize)]
struct TibberError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TibberData {
    viewer: TibberViewer,
}

#[derive(Debug, Deserialize)]
struct TibberViewer {
    homes: Vec<TibberHome>,
}

#[derive(Debug, Deserialize)]
struct TibberHome {
    #[serde(rename = "currentSubscription")]
    current_subscription: TibberSubscription,
}

#[derive(Debug, Deserialize)]
struct TibberSubscription {
    #[serde(rename = "priceInfo")]
    price_info: TibberPriceInfo,
}

#[derive(Debug, Deserialize)]
struct TibberPriceInfo {
    today: Vec<TibberPricePoint>,
    #[serde(default)]
    tomorrow: Vec<TibberPricePoint>,
}

#[derive(Debug, Deserialize)]
struct TibberPricePoint {
    total: f64,
}

const TIBBER_QUERY: &str = "{ viewer { homes { currentSubscription { priceInfo { \
    today { total startsAt } tomorrow { total startsAt } } } } } }";

#[async_trait]
impl PriceProvider for TibberPrices {
    async fn fetch_prices(
        &self,
        tgt_duration: usize,
        start: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.token)
                .map_err(|e| PortError::Request(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let envelope: TibberEnvelope = self
            .client
            .post(TIBBER_API)
            .headers(headers)
            .json(&serde_json::json!({ "query": TIBBER_QUERY }))
            .send()
            .await
            .map_err(PortError::from_reqwest)?
            .error_for_status()
            .map_err(PortError::from_reqwest)?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;

        if let Some(errors) = &envelope.errors {
            if let Some(first) = errors.first() {
                return Err(PortError::InvalidPayload(first.message.clone()));
            }
        }
        let info = envelope
            .data
            .and_then(|d| d.viewer.homes.into_iter().next())
            .map(|h| h.current_subscription.price_info)
            .ok_or_else(|| PortError::InvalidPayload("no home in tibber response".into()))?;

        let mut prices: Vec<f64> = info
            .today
            .iter()
            .map(|p| round9(p.total / 1000.0))
            .collect();
        if prices.is_empty() {
            return Err(PortError::InvalidPayload("empty tibber price list".into()));
        }
        if info.tomorrow.is_empty() {
            let today: Vec<f64> = prices.iter().take(24).copied().collect();
            prices.extend(today);
        } else {
            prices.extend(info.tomorrow.iter().map(|p| round9(p.total / 1000.0)));
        }
        info!("prices fetched from tibber");
        Ok(window_wrapping(&prices, start.hour() as usize, tgt_duration))
    }
}

/// Static 24-value price table, repeated over the horizon.
pub struct Fixed24hPrices {
    pub hourly_eur_per_wh: Vec<f64>,
}

#[async_trait]
impl PriceProvider for Fixed24hPrices {
    async fn fetch_prices(
        &self,
        tgt_duration: usize,
        start: DateTime<Tz>,
    ) -> Result<Vec<f64>, PortError> {
        if self.hourly_eur_per_wh.len() != 24 {
            return Err(PortError::Unsupported(format!(
                "fixed_24h source needs exactly 24 prices, got {}",
                self.hourly_eur_per_wh.len()
            )));
        }
        Ok(window_wrapping(
            &self.hourly_eur_per_wh,
            start.hour() as usize,
            tgt_duration,
        ))
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, PortError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("eos-bridge/0.3"));
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| PortError::Request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceConfig;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    fn service(negative_switch: bool) -> PriceService {
        let cfg = PriceConfig {
            source: PriceSource::Fixed24h,
            base_url: String::new(),
            token: String::new(),
            fixed_24h_prices: vec![30.0; 24],
            feed_in_tariff_ct_per_kwh: 7.5,
            negative_price_switch: negative_switch,
        };
        PriceService::new(&cfg, Berlin).unwrap()
    }

    #[test]
    fn feedin_is_constant_tariff_without_switch() {
        let svc = service(false);
        let feedin = svc.build_feedin(&[0.0003, -0.0001, 0.0002]);
        assert_eq!(feedin, vec![0.000075; 3]);
    }

    #[test]
    fn feedin_zeroed_for_negative_import_prices() {
        let svc = service(true);
        let feedin = svc.build_feedin(&[0.0003, -0.0001, 0.0002]);
        assert_eq!(feedin, vec![0.000075, 0.0, 0.000075]);
    }

    #[tokio::test]
    async fn fixed_source_windows_from_midnight() {
        let svc = service(false);
        let start = Berlin.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        svc.update_prices(48, start).await;
        let import = svc.current_prices().await;
        assert_eq!(import.len(), 48);
        assert_eq!(import[0], round9(30.0 / 100_000.0));
        let feedin = svc.current_feedin_prices().await;
        assert_eq!(feedin.len(), 48);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_cache() {
        let mut provider = MockPriceProvider::new();
        provider
            .expect_fetch_prices()
            .times(1)
            .returning(|len, _| Ok(vec![0.0002; len]));
        provider
            .expect_fetch_prices()
            .returning(|_, _| Err(PortError::Timeout("upstream gone".into())));

        let svc = PriceService::from_parts(Box::new(provider), 0.000075, false, Berlin);
        let start = Berlin.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        svc.update_prices(48, start).await;
        assert_eq!(svc.current_prices().await.len(), 48);

        svc.update_prices(48, start).await;
        assert_eq!(svc.current_prices().await, vec![0.0002; 48]);
        assert_eq!(svc.current_feedin_prices().await, vec![0.000075; 48]);
    }
}
