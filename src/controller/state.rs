use chrono::DateTime;
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::Serialize;

use crate::optimizer::response::InterpretedControl;

/// Outer-loop phase as published to MQTT and the HTTP UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    #[serde(rename = "request sent")]
    RequestSent,
    #[serde(rename = "response received")]
    ResponseReceived,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::RequestSent => "request sent",
            RequestState::ResponseReceived => "response received",
        }
    }
}

/// Observable scheduler state, updated in lock-step with the outer loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub request_state: Option<RequestState>,
    pub last_request_timestamp: Option<DateTime<Tz>>,
    pub last_response_timestamp: Option<DateTime<Tz>>,
    pub next_run: Option<DateTime<Tz>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    status: SchedulerStatus,
    last_request: Option<serde_json::Value>,
    last_response: Option<serde_json::Value>,
    control: InterpretedControl,
    start_solution: Option<Vec<f64>>,
}

/// Container for the state shared between the scheduler (writer) and the
/// HTTP UI, MQTT and the control state machine (readers). Every field has
/// exactly one writer; readers take snapshots under a short lock.
#[derive(Debug, Default)]
pub struct StateStore {
    inner: RwLock<StoreInner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_request_sent(&self, at: DateTime<Tz>) {
        let mut inner = self.inner.write();
        inner.status.request_state = Some(RequestState::RequestSent);
        inner.status.last_request_timestamp = Some(at);
    }

    pub fn mark_response_received(&self, at: DateTime<Tz>) {
        let mut inner = self.inner.write();
        inner.status.request_state = Some(RequestState::ResponseReceived);
        inner.status.last_response_timestamp = Some(at);
    }

    pub fn set_next_run(&self, at: DateTime<Tz>) {
        self.inner.write().status.next_run = Some(at);
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.read().status.clone()
    }

    pub fn store_request(&self, request: serde_json::Value) {
        self.inner.write().last_request = Some(request);
    }

    pub fn store_response(&self, response: serde_json::Value) {
        self.inner.write().last_response = Some(response);
    }

    pub fn last_request(&self) -> Option<serde_json::Value> {
        self.inner.read().last_request.clone()
    }

    pub fn last_response(&self) -> Option<serde_json::Value> {
        self.inner.read().last_response.clone()
    }

    /// Store the interpreter output; a usable start solution is kept for
    /// the next cycle's warm start.
    pub fn store_control(&self, control: &InterpretedControl) {
        let mut inner = self.inner.write();
        if let Some(solution) = &control.start_solution {
            inner.start_solution = Some(solution.clone());
        }
        inner.control = control.clone();
    }

    pub fn control(&self) -> InterpretedControl {
        self.inner.read().control.clone()
    }

    pub fn last_start_solution(&self) -> Option<Vec<f64>> {
        self.inner.read().start_solution.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ControlDecision;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    #[test]
    fn status_follows_outer_loop_transitions() {
        let store = StateStore::new();
        assert!(store.status().request_state.is_none());

        let sent_at = Berlin.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        store.mark_request_sent(sent_at);
        let status = store.status();
        assert_eq!(status.request_state, Some(RequestState::RequestSent));
        assert_eq!(status.last_request_timestamp, Some(sent_at));
        assert!(status.last_response_timestamp.is_none());

        let received_at = Berlin.with_ymd_and_hms(2025, 1, 1, 10, 0, 42).unwrap();
        store.mark_response_received(received_at);
        let status = store.status();
        assert_eq!(status.request_state, Some(RequestState::ResponseReceived));
        assert_eq!(status.last_response_timestamp, Some(received_at));
    }

    #[test]
    fn errored_control_keeps_previous_start_solution() {
        let store = StateStore::new();
        let good = InterpretedControl {
            start_solution: Some(vec![1.0, 2.0]),
            ..InterpretedControl::default()
        };
        store.store_control(&good);
        assert_eq!(store.last_start_solution(), Some(vec![1.0, 2.0]));

        let errored = InterpretedControl {
            decisions: [
                ControlDecision { error: true, ..ControlDecision::default() },
                ControlDecision { error: true, ..ControlDecision::default() },
            ],
            start_solution: None,
            ..InterpretedControl::default()
        };
        store.store_control(&errored);
        assert_eq!(store.last_start_solution(), Some(vec![1.0, 2.0]));
        assert!(store.control().has_error());
    }

    #[test]
    fn request_state_serializes_with_spaces() {
        let v = serde_json::to_value(RequestState::RequestSent).unwrap();
        assert_eq!(v, "request sent");
    }
}
