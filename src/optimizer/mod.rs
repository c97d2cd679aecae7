pub mod eos;
pub mod evopt;
pub mod request;
pub mod response;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{OptimizeRequest, OptimizeResponse};

pub use eos::EosBackend;
pub use evopt::EvoptBackend;

/// Backend call failures. The scheduler treats every variant as "skip the
/// control update this cycle and keep the cadence".
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request timed out - trying again with next run")]
    Timeout { seconds: u64 },
    #[error("Optimizer not reachable at {url} - will try again with next cycle")]
    Connection { url: String, detail: String },
    #[error("Optimizer returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Invalid optimizer response: {0}")]
    InvalidJson(String),
    #[error("Request validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl BackendError {
    pub fn from_reqwest(e: reqwest::Error, url: &str, timeout: Duration) -> Self {
        if e.is_timeout() {
            BackendError::Timeout { seconds: timeout.as_secs() }
        } else if e.is_connect() {
            BackendError::Connection { url: url.to_string(), detail: e.to_string() }
        } else if let Some(status) = e.status() {
            BackendError::Http { status: status.as_u16(), body: e.to_string() }
        } else {
            BackendError::InvalidJson(e.to_string())
        }
    }
}

/// Successful backend result with the trailing average runtime used for
/// quarter-hour alignment.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub response: OptimizeResponse,
    pub avg_runtime_s: f64,
}

/// One operation: ship a canonical request, get a canonical response.
#[async_trait]
pub trait OptimizerBackend: Send + Sync {
    async fn optimize(
        &self,
        request: &OptimizeRequest,
        timeout: Duration,
    ) -> Result<Optimized, BackendError>;
}

/// Ring buffer over the last five successful optimizer runtimes. The first
/// real measurement is replicated into every slot to seed the moving
/// average; failures never enter the buffer.
#[derive(Debug, Clone)]
pub struct RuntimeRing {
    slots: [f64; 5],
    next: usize,
}

impl Default for RuntimeRing {
    fn default() -> Self {
        Self { slots: [0.0; 5], next: 0 }
    }
}

impl RuntimeRing {
    pub fn record(&mut self, runtime_s: f64) {
        if self.slots.iter().all(|r| *r == 0.0) {
            self.slots = [runtime_s; 5];
        } else {
            self.slots[self.next] = runtime_s;
        }
        self.next = (self.next + 1) % 5;
    }

    pub fn average(&self) -> f64 {
        self.slots.iter().sum::<f64>() / 5.0
    }
}
