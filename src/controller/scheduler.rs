use chrono::{DateTime, Duration as ChronoDuration, Timelike};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::AppState;
use crate::optimizer::request::build_optimize_request;
use crate::optimizer::response::examine_response;
use crate::optimizer::Optimized;

/// Cadence of the inner telemetry loop. Fixed in the controller, not
/// configuration.
pub const INNER_TELEMETRY_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRunKind {
    QuarterAligned,
    GapFill,
}

/// Planned wake time of the outer loop. `aligned_finish` is the
/// quarter-hour boundary the run is expected to finish on (the following
/// quarter-aligned run for gap fills).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRun {
    pub at: DateTime<Tz>,
    pub kind: NextRunKind,
    pub aligned_finish: DateTime<Tz>,
}

/// Compute the next outer-loop wake time: start so that the run finishes
/// exactly on a quarter-hour boundary, inserting a gap-fill run when the
/// wait would leave the system idle for more than twice the update
/// interval. Deterministic and idempotent.
pub fn next_run_time(now: DateTime<Tz>, avg_runtime_s: f64, update_interval_s: u64) -> NextRun {
    let min_gap_s = ((update_interval_s as f64 + avg_runtime_s) * 0.7).max(30.0);
    let avg_runtime = ChronoDuration::milliseconds((avg_runtime_s * 1000.0) as i64);

    // next quarter-hour strictly after `now` (minute resolution)
    let mut quarter = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let past = quarter.minute() % 15;
    let minutes_to_add = if past == 0 { 15 } else { 15 - past };
    quarter += ChronoDuration::minutes(i64::from(minutes_to_add));

    let mut start = quarter - avg_runtime;
    let mut moved_from_past = false;
    if start <= now {
        quarter += ChronoDuration::minutes(15);
        start = quarter - avg_runtime;
        moved_from_past = true;
        debug!(next_quarter = %quarter.format("%H:%M:%S"), "quarter start was in past, moved to next");
    }

    let until_start_s = (start - now).num_milliseconds() as f64 / 1000.0;

    // Gap fill only applies to a candidate that was reachable in the first
    // place; a start pushed out of the past goes straight to alignment.
    if !moved_from_past
        && until_start_s >= (2 * update_interval_s) as f64
        && until_start_s >= min_gap_s
    {
        let fill_at = now + ChronoDuration::seconds(update_interval_s as i64);
        info!(
            start = %fill_at.format("%H:%M:%S"),
            aligned_follows = %quarter.format("%H:%M:%S"),
            "gap-fill run scheduled"
        );
        return NextRun { at: fill_at, kind: NextRunKind::GapFill, aligned_finish: quarter };
    }

    let absolute_min_s = (avg_runtime_s * 0.5).max(30.0);
    if until_start_s < absolute_min_s {
        quarter += ChronoDuration::minutes(15);
        start = quarter - avg_runtime;
        debug!(next_quarter = %quarter.format("%H:%M:%S"), "quarter too close, moved to next");
    }

    info!(
        start = %start.format("%H:%M:%S"),
        finish = %quarter.format("%H:%M:%S"),
        "quarter-hour aligned run scheduled"
    );
    NextRun { at: start, kind: NextRunKind::QuarterAligned, aligned_finish: quarter }
}

/// Periodic engine around the optimizer: the outer loop plans and controls,
/// the inner loop refreshes inverter telemetry.
pub struct OptimizationScheduler {
    app: Arc<AppState>,
    avg_runtime_s: parking_lot::Mutex<f64>,
}

impl OptimizationScheduler {
    pub fn new(app: Arc<AppState>) -> Self {
        Self { app, avg_runtime_s: parking_lot::Mutex::new(0.0) }
    }

    /// Outer optimization loop. Failures are logged and swallowed; the
    /// cadence continues until the stop token fires.
    pub async fn run_outer_loop(self: Arc<Self>, stop: CancellationToken) {
        info!("optimization scheduler started");
        loop {
            if stop.is_cancelled() {
                break;
            }
            self.run_optimization().await;

            let now = self.app.clock.now();
            let plan = next_run_time(
                now,
                *self.avg_runtime_s.lock(),
                self.app.cfg.general.refresh_interval_min * 60,
            );
            self.app.state.set_next_run(plan.at);
            self.app.mqtt.publish("optimization/next_run", plan.at.to_rfc3339()).await;
            let sleep_s = (plan.at - now).num_seconds().max(0);
            let (minutes, seconds) = (sleep_s / 60, sleep_s % 60);
            info!(
                next = %plan.at.format("%H:%M:%S"),
                minutes,
                seconds,
                "next optimization scheduled"
            );

            if !sleep_cooperatively(Duration::from_secs(sleep_s as u64), &stop).await {
                break;
            }
        }
        info!("optimization scheduler stopped");
    }

    /// One pass of the nine outer-loop steps.
    async fn run_optimization(&self) {
        let app = &self.app;
        info!("start new optimization run");
        let now = app.clock.now();
        app.state.mark_request_sent(now);
        app.mqtt.publish("optimization/state", "request sent").await;

        app.prices
            .update_prices(
                crate::optimizer::request::TARGET_DURATION_H,
                crate::clock::today_midnight(now),
            )
            .await;

        let request = build_optimize_request(
            &app.cfg,
            &app.pv,
            &app.prices,
            &app.load,
            &app.battery,
            app.state.last_start_solution(),
            now,
        )
        .await;

        let mut request_json = serde_json::to_value(&request).unwrap_or_default();
        attach_timestamp(&mut request_json, now);
        app.state.store_request(request_json.clone());
        app.persist_artifact("optimize_request.json", &request_json).await;

        let timeout = Duration::from_secs(app.cfg.optimizer.timeout_secs);
        match app.backend.optimize(&request, timeout).await {
            Ok(Optimized { response, avg_runtime_s }) => {
                *self.avg_runtime_s.lock() = avg_runtime_s;

                let received_at = app.clock.now();
                let mut response_json = serde_json::to_value(&response).unwrap_or_default();
                attach_timestamp(&mut response_json, received_at);
                app.state.store_response(response_json.clone());
                app.persist_artifact("optimize_response.json", &response_json).await;
                app.state.mark_response_received(received_at);
                app.mqtt.publish("optimization/state", "response received").await;
                app.mqtt
                    .publish("optimization/last_run", received_at.to_rfc3339())
                    .await;

                let control = examine_response(&response, received_at);
                app.state.store_control(&control);
                if control.has_error() {
                    error!("response carries no usable control data, skipping state transition");
                } else {
                    app.machine.set_control_demands(&control.decisions[0]);
                    app.machine.set_battery_soc(app.battery.current_soc());
                    app.change_control_state().await;
                }
            }
            Err(e) => {
                error!(error = %e, "optimization failed, keeping previous inverter mode");
                let mut error_json = serde_json::json!({ "error": e.to_string() });
                attach_timestamp(&mut error_json, app.clock.now());
                app.state.store_response(error_json.clone());
                app.persist_artifact("optimize_response.json", &error_json).await;
            }
        }
    }

    /// Inner telemetry loop: every 15 s, publish per-module temperatures
    /// and fan percentages for inverters that expose them. Failures log
    /// and continue; the outer loop is never disturbed.
    pub async fn run_inner_loop(self: Arc<Self>, stop: CancellationToken) {
        if !self.app.inverter.supports_telemetry() {
            info!("inverter exposes no telemetry, inner loop idle");
            return;
        }
        info!("inverter telemetry loop started");
        loop {
            match self.app.inverter.fetch_telemetry().await {
                Ok(telemetry) => {
                    for (module, value) in &telemetry.temperatures_c {
                        self.app
                            .mqtt
                            .publish(&format!("inverter/special/temperature_{module}"), format!("{value:.1}"))
                            .await;
                    }
                    for (fan, value) in &telemetry.fan_percent {
                        self.app
                            .mqtt
                            .publish(&format!("inverter/special/fan_control_{fan}"), format!("{value:.0}"))
                            .await;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "inverter telemetry fetch failed");
                }
            }
            if !sleep_cooperatively(INNER_TELEMETRY_INTERVAL, &stop).await {
                break;
            }
        }
        info!("inverter telemetry loop stopped");
    }
}

fn attach_timestamp(value: &mut serde_json::Value, at: DateTime<Tz>) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".into(), serde_json::Value::String(at.to_rfc3339()));
    }
}

/// Sleep in ≤1 s chunks, returning false as soon as the stop token fires.
pub async fn sleep_cooperatively(duration: Duration, stop: &CancellationToken) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.is_cancelled() {
            return false;
        }
        let chunk = remaining.min(Duration::from_secs(1));
        tokio::time::sleep(chunk).await;
        remaining -= chunk;
    }
    !stop.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn normal_case_finishes_on_quarter() {
        let plan = next_run_time(at(0, 5, 0), 60.0, 300);
        assert_eq!(plan.kind, NextRunKind::QuarterAligned);
        assert_eq!(plan.at, at(0, 14, 0));
        assert_eq!(plan.aligned_finish, at(0, 15, 0));
    }

    #[test]
    fn long_wait_triggers_gap_fill() {
        let plan = next_run_time(at(0, 0, 0), 60.0, 60);
        assert_eq!(plan.kind, NextRunKind::GapFill);
        assert_eq!(plan.at, at(0, 1, 0));
        assert_eq!(plan.aligned_finish, at(0, 15, 0));
    }

    #[test]
    fn past_quarter_start_moves_to_next() {
        let plan = next_run_time(at(0, 14, 30), 60.0, 300);
        assert_eq!(plan.kind, NextRunKind::QuarterAligned);
        assert_eq!(plan.at, at(0, 29, 0));
        assert_eq!(plan.aligned_finish, at(0, 30, 0));
    }

    #[test]
    fn exact_quarter_moves_to_next_quarter() {
        // at 00:15:00 sharp the next boundary is 00:30
        let plan = next_run_time(at(0, 15, 0), 120.0, 600);
        assert_eq!(plan.kind, NextRunKind::QuarterAligned);
        assert_eq!(plan.at, at(0, 28, 0));
        assert_eq!(plan.aligned_finish, at(0, 30, 0));
    }

    #[test]
    fn too_close_quarter_is_skipped() {
        // start candidate 00:14:00 is only 10 s away with a 120 s runtime
        let plan = next_run_time(at(0, 13, 50), 60.0, 300);
        assert!(plan.at > at(0, 13, 50));
        // 10 s < max(30, 30) -> skip to 00:30 finish
        assert_eq!(plan.aligned_finish, at(0, 30, 0));
        assert_eq!(plan.at, at(0, 29, 0));
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let a = next_run_time(at(9, 3, 17), 42.5, 180);
        let b = next_run_time(at(9, 3, 17), 42.5, 180);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_runtime_lands_exactly_on_quarter() {
        let plan = next_run_time(at(0, 5, 0), 0.0, 400);
        assert_eq!(plan.kind, NextRunKind::QuarterAligned);
        assert_eq!(plan.at, at(0, 15, 0));
        assert_eq!(plan.aligned_finish, at(0, 15, 0));
    }

    #[tokio::test]
    async fn cooperative_sleep_observes_stop() {
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!sleep_cooperatively(Duration::from_secs(30), &stop).await);
    }
}
