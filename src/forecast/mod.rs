pub mod load;
pub mod prices;
pub mod pv;

use thiserror::Error;

pub use load::LoadService;
pub use prices::PriceService;
pub use pv::PvForecastService;

/// Errors surfaced by the upstream data ports. Port failures never abort an
/// optimization cycle; callers fall back to cached or default values.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("source not supported: {0}")]
    Unsupported(String),
}

impl PortError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PortError::Timeout(e.to_string())
        } else {
            PortError::Request(e.to_string())
        }
    }
}

/// Window `values` to `len` entries starting at `offset`, wrapping around to
/// the head when the tail runs short. Price series for today+tomorrow are
/// windowed this way when tomorrow's data is not published yet.
pub(crate) fn window_wrapping(values: &[f64], offset: usize, len: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<f64> = values.iter().skip(offset).take(len).copied().collect();
    let mut head = 0usize;
    while out.len() < len {
        out.push(values[head % values.len()]);
        head += 1;
    }
    out
}

/// Round to nine decimals, enough for €/Wh price resolution.
pub(crate) fn round9(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}
