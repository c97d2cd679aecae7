pub mod control;
pub mod scheduler;
pub mod state;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{Config, OptimizerKind};
use crate::forecast::{LoadService, PriceService, PvForecastService};
use crate::hardware::{create_inverter, BatteryService, EvccService, Inverter};
use crate::mqtt::{MqttService, OverrideCommand};
use crate::optimizer::{EosBackend, EvoptBackend, OptimizerBackend};

use control::{dispatch_command, ControlStateMachine};
use scheduler::{sleep_cooperatively, OptimizationScheduler};
use state::StateStore;

/// Fixed startup grace before the first optimization run, plus one second
/// per configured forecast plane.
const WARMUP_BASE: Duration = Duration::from_secs(3);

/// Everything the scheduler, the HTTP UI and the callback tasks share.
pub struct AppState {
    pub cfg: Config,
    pub clock: Clock,
    pub workdir: PathBuf,
    pub state: StateStore,
    pub machine: ControlStateMachine,
    pub backend: Arc<dyn OptimizerBackend>,
    pub prices: Arc<PriceService>,
    pub pv: Arc<PvForecastService>,
    pub load: Arc<LoadService>,
    pub battery: Arc<BatteryService>,
    pub evcc: Arc<EvccService>,
    pub inverter: Arc<dyn Inverter>,
    pub mqtt: MqttService,
}

impl AppState {
    /// Create all ports in dependency order and wire them together.
    pub async fn new(
        cfg: Config,
        workdir: PathBuf,
        stop: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<OverrideCommand>)> {
        let tz = cfg.general.time_zone()?;
        let clock = Clock::new(tz);
        let resolution = cfg.optimizer.resolution()?;

        tokio::fs::create_dir_all(workdir.join("json"))
            .await
            .context("Failed to create json artifact directory")?;

        let (mqtt, override_rx) = MqttService::connect(&cfg.mqtt, stop.clone());

        let prices = Arc::new(PriceService::new(&cfg.price, tz)?);
        let pv = Arc::new(PvForecastService::new(cfg.pv_forecast.clone(), tz)?);
        let load = Arc::new(LoadService::new(cfg.load.clone(), tz)?);
        let battery = Arc::new(BatteryService::new(cfg.battery.clone())?);
        let evcc = Arc::new(EvccService::new(cfg.evcc.url.clone())?);
        let inverter = create_inverter(&cfg.inverter);

        let backend: Arc<dyn OptimizerBackend> = match cfg.optimizer.backend {
            OptimizerKind::Eos => {
                Arc::new(EosBackend::connect(cfg.optimizer.base_url.clone(), clock).await)
            }
            OptimizerKind::Evopt => Arc::new(
                EvoptBackend::new(cfg.optimizer.base_url.clone(), clock, resolution)
                    .with_artifact_dir(workdir.clone()),
            ),
        };

        let machine = ControlStateMachine::new(
            cfg.inverter.max_grid_charge_rate,
            cfg.inverter.max_pv_charge_rate,
        );

        let app = Arc::new(Self {
            cfg,
            clock,
            workdir,
            state: StateStore::new(),
            machine,
            backend,
            prices,
            pv,
            load,
            battery,
            evcc,
            inverter,
            mqtt,
        });
        Ok((app, override_rx))
    }

    /// Re-select the overall state from fresh telemetry and, if it changed
    /// recently, (re-)issue the matching inverter command.
    pub async fn change_control_state(&self) -> bool {
        self.machine.set_evcc_state(self.evcc.current_state());
        let now = Utc::now();
        self.machine.reevaluate(now);
        self.publish_control_topics().await;

        if self.machine.was_changed_recently(now) {
            let targets = self
                .machine
                .power_targets(self.battery.dyn_max_charge_power(), now);
            dispatch_command(self.machine.overall_state(), targets, self.inverter.as_ref()).await;
            true
        } else {
            info!(
                state = %self.machine.overall_state(),
                "overall state not changed recently, remaining in current state"
            );
            false
        }
    }

    /// Validate and install a manual override; negative modes clear it.
    /// `grid_charge_w` is only checked for actual overrides.
    pub async fn apply_override(
        &self,
        mode: i8,
        duration: &str,
        grid_charge_w: f64,
    ) -> Result<(), String> {
        if !(-2..=2).contains(&mode) {
            return Err(format!("mode must be between -2 and 2, got {mode}"));
        }
        let duration = parse_duration_hhmm(duration)
            .ok_or_else(|| format!("duration must be HH:MM, got {duration:?}"))?;
        if duration > ChronoDuration::hours(12) {
            return Err("duration must not exceed 12:00".into());
        }
        if mode >= 0 {
            let max_w = self.machine.max_grid_charge_w();
            if !(500.0..=max_w).contains(&grid_charge_w) {
                return Err(format!(
                    "charge power must be between 500 W and {max_w} W, got {grid_charge_w}"
                ));
            }
        }

        self.machine.set_override(mode, duration, grid_charge_w, Utc::now());
        self.change_control_state().await;
        Ok(())
    }

    /// Publish the control and battery topics after every state evaluation.
    async fn publish_control_topics(&self) {
        let now = Utc::now();
        let snapshot = self.machine.snapshot(now);
        let control = self.state.control();

        self.mqtt
            .publish("control/overall_state", snapshot.overall_state_num.to_string())
            .await;
        self.mqtt
            .publish("control/eos_ac_charge_demand", format!("{}", snapshot.ac_charge_demand))
            .await;
        self.mqtt
            .publish("control/eos_dc_charge_demand", format!("{}", snapshot.dc_charge_demand))
            .await;
        self.mqtt
            .publish(
                "control/eos_discharge_allowed",
                if snapshot.discharge_allowed { "1" } else { "0" },
            )
            .await;
        self.mqtt
            .publish(
                "control/eos_homeappliance_released",
                if control.appliance_released { "1" } else { "0" },
            )
            .await;
        self.mqtt
            .publish(
                "control/eos_homeappliance_start_hour",
                control
                    .appliance_start_hour
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-1".into()),
            )
            .await;
        self.mqtt
            .publish(
                "control/override_active",
                if snapshot.override_active { "1" } else { "0" },
            )
            .await;
        self.mqtt
            .publish(
                "control/override_end_time",
                snapshot
                    .override_end_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            )
            .await;
        self.mqtt
            .publish(
                "control/override_charge_power",
                format!("{}", snapshot.override_charge_w),
            )
            .await;

        self.mqtt
            .publish("battery/soc", format!("{:.1}", self.battery.current_soc()))
            .await;
        self.mqtt
            .publish(
                "battery/remaining_energy",
                format!("{:.0}", self.battery.remaining_energy_wh()),
            )
            .await;
        self.mqtt
            .publish(
                "battery/dyn_max_charge_power",
                format!("{:.0}", self.battery.dyn_max_charge_power()),
            )
            .await;
    }

    /// Write a debugging artifact under `<workdir>/json/`; also served by
    /// the HTTP UI.
    pub async fn persist_artifact(&self, name: &str, value: &serde_json::Value) {
        let path = self.workdir.join("json").join(name);
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), error = %e, "could not persist artifact");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize artifact"),
        }
    }
}

/// Parse a "HH:MM" duration, positive and minute-granular.
pub fn parse_duration_hhmm(s: &str) -> Option<ChronoDuration> {
    let (hours, minutes) = s.split_once(':')?;
    let hours: i64 = hours.parse().ok()?;
    let minutes: i64 = minutes.parse().ok()?;
    if hours < 0 || !(0..60).contains(&minutes) {
        return None;
    }
    let duration = ChronoDuration::minutes(hours * 60 + minutes);
    (duration > ChronoDuration::zero()).then_some(duration)
}

/// Spawn every long-lived task: both scheduler loops, the port pollers and
/// the callback dispatchers. Returned handles are joined at shutdown.
pub fn spawn_controller_tasks(
    app: Arc<AppState>,
    stop: CancellationToken,
    mut override_rx: mpsc::Receiver<OverrideCommand>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let scheduler = Arc::new(OptimizationScheduler::new(app.clone()));

    // outer optimization loop, after the port warm-up
    let warmup = WARMUP_BASE + Duration::from_secs(app.pv.plane_count() as u64);
    let outer = scheduler.clone();
    let outer_stop = stop.clone();
    handles.push(tokio::spawn(async move {
        if sleep_cooperatively(warmup, &outer_stop).await {
            outer.run_outer_loop(outer_stop).await;
        }
    }));

    // inner telemetry loop
    let inner = scheduler;
    let inner_stop = stop.clone();
    handles.push(tokio::spawn(async move {
        inner.run_inner_loop(inner_stop).await;
    }));

    // port pollers
    handles.push(tokio::spawn(app.prices.clone().run_refresh_loop(stop.clone())));
    handles.push(tokio::spawn(app.battery.clone().run_update_loop(stop.clone())));
    handles.push(tokio::spawn(app.evcc.clone().run_update_loop(stop.clone())));

    // EV charger change events retrigger the control state machine
    let ev_app = app.clone();
    let ev_stop = stop.clone();
    let mut ev_rx = app.evcc.subscribe();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ev_stop.cancelled() => return,
                changed = ev_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let state = *ev_rx.borrow_and_update();
                    info!(charging = state.charging, mode = %state.mode, "EV event, reevaluating control state");
                    ev_app.change_control_state().await;
                }
            }
        }
    }));

    // battery SoC changes feed the machine and the battery topics
    let soc_app = app.clone();
    let soc_stop = stop.clone();
    let mut soc_rx = app.battery.subscribe();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = soc_stop.cancelled() => return,
                changed = soc_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let soc = *soc_rx.borrow_and_update();
                    soc_app.machine.set_battery_soc(soc);
                    soc_app.change_control_state().await;
                }
            }
        }
    }));

    // manual overrides arriving over MQTT
    let cmd_app = app;
    let cmd_stop = stop;
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cmd_stop.cancelled() => return,
                command = override_rx.recv() => {
                    let Some(command) = command else { return };
                    match cmd_app
                        .apply_override(command.mode, &command.duration, command.charge_power_w)
                        .await
                    {
                        Ok(()) => info!(mode = command.mode, "override applied via mqtt"),
                        Err(e) => error!(error = %e, "mqtt override rejected"),
                    }
                }
            }
        }
    }));

    handles
}

/// Cancel the stop token and wait up to ~5 s for every task to drain.
/// Stragglers are logged and abandoned.
pub async fn shutdown(stop: CancellationToken, handles: Vec<JoinHandle<()>>) {
    stop.cancel();
    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("some tasks did not stop within the shutdown window");
    }
    info!("controller tasks stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing_accepts_hh_mm() {
        assert_eq!(parse_duration_hhmm("01:30"), Some(ChronoDuration::minutes(90)));
        assert_eq!(parse_duration_hhmm("12:00"), Some(ChronoDuration::hours(12)));
        assert_eq!(parse_duration_hhmm("00:05"), Some(ChronoDuration::minutes(5)));
    }

    #[test]
    fn duration_parsing_rejects_invalid_input() {
        assert_eq!(parse_duration_hhmm("00:00"), None);
        assert_eq!(parse_duration_hhmm("1:75"), None);
        assert_eq!(parse_duration_hhmm("-1:00"), None);
        assert_eq!(parse_duration_hhmm("90"), None);
        assert_eq!(parse_duration_hhmm("abc:def"), None);
    }
}
