use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use validator::Validate;

use crate::domain::Resolution;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub general: GeneralConfig,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub optimizer: OptimizerConfig,

    #[validate(nested)]
    pub price: PriceConfig,

    #[validate(length(min = 1), nested)]
    pub pv_forecast: Vec<PvPlaneConfig>,

    #[validate(nested)]
    pub load: LoadConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub inverter: InverterConfig,

    #[validate(nested)]
    pub evcc: EvccConfig,

    #[validate(nested)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GeneralConfig {
    /// IANA zone name used for all wall-clock reasoning.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Minutes between optimization runs.
    #[validate(range(min = 1, max = 60))]
    #[serde(default = "default_refresh_minutes")]
    pub refresh_interval_min: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl GeneralConfig {
    pub fn time_zone(&self) -> Result<chrono_tz::Tz> {
        self.time_zone
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown time zone {:?}: {e}", self.time_zone))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_host")]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse server socket address")
    }
}

/// Which optimizer speaks on the far end of the adapter layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Eos,
    Evopt,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct OptimizerConfig {
    pub backend: OptimizerKind,

    #[validate(length(min = 1))]
    pub base_url: String,

    #[validate(range(min = 5, max = 3600))]
    #[serde(default = "default_optimizer_timeout")]
    pub timeout_secs: u64,

    /// Slot width in seconds; 3600 (hourly) or 900 (quarter-hour).
    #[serde(default = "default_time_frame_base")]
    pub time_frame_base_secs: u32,
}

impl OptimizerConfig {
    pub fn resolution(&self) -> Result<Resolution> {
        Resolution::from_slot_seconds(self.time_frame_base_secs).ok_or_else(|| {
            anyhow::anyhow!(
                "optimizer.time_frame_base_secs must be 3600 or 900, got {}",
                self.time_frame_base_secs
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Akkudoktor,
    Tibber,
    Fixed24h,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PriceConfig {
    pub source: PriceSource,

    #[serde(default = "default_akkudoktor_url")]
    pub base_url: String,

    /// API token for sources that need one (Tibber).
    #[serde(default)]
    pub token: String,

    /// Fixed hourly prices in ct/kWh, used by the fixed_24h source.
    #[serde(default)]
    pub fixed_24h_prices: Vec<f64>,

    /// Feed-in tariff in ct/kWh.
    #[serde(default)]
    pub feed_in_tariff_ct_per_kwh: f64,

    /// Zero the feed-in tariff for slots with negative import prices.
    #[serde(default)]
    pub negative_price_switch: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvPlaneConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_forecast_url")]
    pub base_url: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,

    /// Panel azimuth in degrees.
    pub azimuth: f64,

    /// Panel tilt in degrees.
    pub tilt: f64,

    /// Peak panel power in W.
    #[validate(range(min = 1.0))]
    pub power: f64,

    /// Inverter AC limit in W.
    #[validate(range(min = 1.0))]
    pub power_inverter: f64,

    #[validate(range(min = 0.0, max = 1.0))]
    pub inverter_efficiency: f64,

    /// Optional horizon shading string understood by the forecast API.
    #[serde(default)]
    pub horizon: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Default,
    HomeAssistant,
    OpenHab,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoadConfig {
    #[serde(default = "default_load_source")]
    pub source: LoadSource,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub load_sensor: String,

    #[serde(default)]
    pub car_charge_load_sensor: String,

    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    /// Sensor endpoint delivering the live state of charge.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub soc_sensor: String,

    #[serde(default)]
    pub access_token: String,

    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,

    #[validate(range(min = 0.05, max = 1.0))]
    pub charge_efficiency: f64,

    #[validate(range(min = 0.05, max = 1.0))]
    pub discharge_efficiency: f64,

    #[validate(range(min = 1.0))]
    pub max_charge_power_w: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percentage: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percentage: f64,
}

fn validate_battery_config(cfg: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if cfg.min_soc_percentage >= cfg.max_soc_percentage {
        return Err(validator::ValidationError::new(
            "min_soc_percentage must be below max_soc_percentage",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InverterConfig {
    /// Driver selector, e.g. "fronius_gen24"; anything unknown runs show-only.
    #[serde(default = "default_inverter_type", rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub address: String,

    #[serde(default = "default_inverter_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Upper bound for grid charging in W.
    #[validate(range(min = 1.0))]
    pub max_grid_charge_rate: f64,

    /// Upper bound for PV charging in W.
    #[validate(range(min = 1.0))]
    pub max_pv_charge_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EvccConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_mqtt_prefix")]
    pub topic_prefix: String,
}

impl Config {
    /// Load `config.toml` from the working directory, with `EOS_BRIDGE_*`
    /// environment overrides. Invalid configuration is fatal at startup.
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = workdir.join("config.toml");
        let cfg: Config = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("EOS_BRIDGE_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        cfg.general.time_zone()?;
        cfg.optimizer.resolution()?;
        Ok(cfg)
    }
}

fn default_time_zone() -> String {
    "Europe/Berlin".into()
}
fn default_refresh_minutes() -> u64 {
    3
}
fn default_log_level() -> String {
    "info".into()
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_web_port() -> u16 {
    8081
}
fn default_optimizer_timeout() -> u64 {
    180
}
fn default_time_frame_base() -> u32 {
    3600
}
fn default_akkudoktor_url() -> String {
    "https://api.akkudoktor.net".into()
}
fn default_forecast_url() -> String {
    "https://api.akkudoktor.net/forecast".into()
}
fn default_load_source() -> LoadSource {
    LoadSource::Default
}
fn default_inverter_type() -> String {
    "none".into()
}
fn default_inverter_user() -> String {
    "customer".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_prefix() -> String {
    "eos_bridge".into()
}
