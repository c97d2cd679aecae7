use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use tracing::{debug, error};

use crate::domain::{ControlDecision, OptimizeResponse};

/// State the interpreter extracts from a response for the current and the
/// following hour. This never commands the inverter; the control state
/// machine consumes it.
#[derive(Debug, Clone, Default)]
pub struct InterpretedControl {
    pub decisions: [ControlDecision; 2],
    pub start_solution: Option<Vec<f64>>,
    pub appliance_start_hour: Option<i64>,
    pub appliance_released: bool,
}

impl InterpretedControl {
    pub fn has_error(&self) -> bool {
        self.decisions[0].error
    }
}

/// Pick the control decision for the wall-clock hour containing `now` and
/// its successor (wrapping 23 -> 0). A response without control arrays or
/// with a trivial start solution marks both slots as errored.
pub fn examine_response(response: &OptimizeResponse, now: DateTime<Tz>) -> InterpretedControl {
    let current_hour = now.hour() as usize;
    let next_hour = if current_hour < 23 { current_hour + 1 } else { 0 };

    let mut control = InterpretedControl::default();
    for (slot, hour) in [(0usize, current_hour), (1usize, next_hour)] {
        control.decisions[slot] = ControlDecision {
            ac_charge_demand: response.ac_charge.get(hour).copied().unwrap_or(0.0),
            dc_charge_demand: response.dc_charge.get(hour).copied().unwrap_or(0.0),
            discharge_allowed: response
                .discharge_allowed
                .get(hour)
                .map(|v| *v != 0)
                .unwrap_or(false),
            error: false,
            hour: hour as i8,
        };
    }
    debug!(
        hour = current_hour,
        ac = control.decisions[0].ac_charge_demand,
        dc = control.decisions[0].dc_charge_demand,
        discharge = control.decisions[0].discharge_allowed,
        "control data for current hour"
    );

    if response.has_control_data() {
        control.start_solution = Some(response.start_solution.clone());
    } else {
        error!("no control data in optimized response");
        control.decisions[0].error = true;
        control.decisions[1].error = true;
    }

    if let Some(start_hour) = response.washingstart {
        control.appliance_start_hour = Some(start_hour);
        control.appliance_released = start_hour == current_hour as i64;
        debug!(
            start_hour,
            released = control.appliance_released,
            "home appliance window"
        );
    }

    control
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    fn response() -> OptimizeResponse {
        let mut r = OptimizeResponse {
            ac_charge: vec![0.0; 48],
            dc_charge: vec![0.0; 48],
            discharge_allowed: vec![0; 48],
            start_solution: vec![0.0; 48],
            ..OptimizeResponse::default()
        };
        r.ac_charge[14] = 0.5;
        r.dc_charge[15] = 1.0;
        r.discharge_allowed[15] = 1;
        r
    }

    #[test]
    fn picks_current_and_next_hour() {
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 14, 30, 0).unwrap();
        let control = examine_response(&response(), now);
        assert_eq!(control.decisions[0].hour, 14);
        assert_eq!(control.decisions[0].ac_charge_demand, 0.5);
        assert!(!control.decisions[0].discharge_allowed);
        assert_eq!(control.decisions[1].hour, 15);
        assert_eq!(control.decisions[1].dc_charge_demand, 1.0);
        assert!(control.decisions[1].discharge_allowed);
        assert!(!control.has_error());
        assert_eq!(control.start_solution.as_ref().unwrap().len(), 48);
    }

    #[test]
    fn next_hour_wraps_at_twenty_three() {
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 23, 5, 0).unwrap();
        let control = examine_response(&response(), now);
        assert_eq!(control.decisions[0].hour, 23);
        assert_eq!(control.decisions[1].hour, 0);
    }

    #[test]
    fn trivial_start_solution_marks_error() {
        let mut r = response();
        r.start_solution = vec![0.0];
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let control = examine_response(&r, now);
        assert!(control.decisions[0].error);
        assert!(control.decisions[1].error);
        assert!(control.start_solution.is_none());
    }

    #[test]
    fn missing_control_arrays_mark_error() {
        let now = Berlin.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let control = examine_response(&OptimizeResponse::default(), now);
        assert!(control.has_error());
        assert_eq!(control.decisions[0].ac_charge_demand, 0.0);
    }

    #[test]
    fn appliance_release_only_in_start_hour() {
        let mut r = response();
        r.washingstart = Some(14);
        let at_start = Berlin.with_ymd_and_hms(2025, 1, 1, 14, 0, 0).unwrap();
        let control = examine_response(&r, at_start);
        assert!(control.appliance_released);
        assert_eq!(control.appliance_start_hour, Some(14));

        let later = Berlin.with_ymd_and_hms(2025, 1, 1, 16, 0, 0).unwrap();
        let control = examine_response(&r, later);
        assert!(!control.appliance_released);
    }
}
