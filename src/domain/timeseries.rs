use serde::{Deserialize, Serialize};

/// Slot resolution of the optimization horizon.
///
/// All time-series within one optimize request share a resolution; the
/// horizon always spans 48 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Hourly,
    QuarterHourly,
}

impl Resolution {
    /// Slot width in seconds (the optimizer wire calls this the time frame base).
    pub fn slot_seconds(self) -> u32 {
        match self {
            Resolution::Hourly => 3600,
            Resolution::QuarterHourly => 900,
        }
    }

    /// Number of slots covering the 48-hour horizon.
    pub fn horizon_slots(self) -> usize {
        match self {
            Resolution::Hourly => 48,
            Resolution::QuarterHourly => 192,
        }
    }

    /// Slots per hour.
    pub fn slots_per_hour(self) -> usize {
        match self {
            Resolution::Hourly => 1,
            Resolution::QuarterHourly => 4,
        }
    }

    pub fn from_slot_seconds(secs: u32) -> Option<Self> {
        match secs {
            3600 => Some(Resolution::Hourly),
            900 => Some(Resolution::QuarterHourly),
            _ => None,
        }
    }
}

/// Fit a series to exactly `len` entries: overlong tails are truncated,
/// missing tails are filled by repeating the last value. An empty input
/// stays empty (the caller decides on a fallback).
pub fn fit_series(values: &[f64], len: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<f64> = values.iter().copied().take(len).collect();
    let last = *out.last().unwrap_or(&0.0);
    while out.len() < len {
        out.push(last);
    }
    out
}

/// Fit a series to `len`, using zeros when the input is empty.
pub fn fit_series_or_zero(values: &[f64], len: usize) -> Vec<f64> {
    if values.is_empty() {
        vec![0.0; len]
    } else {
        fit_series(values, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_truncates_overlong_tail() {
        let v: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let fitted = fit_series(&v, 48);
        assert_eq!(fitted.len(), 48);
        assert_eq!(fitted[47], 47.0);
    }

    #[test]
    fn fit_repeats_last_value() {
        let fitted = fit_series(&[1.0, 2.0, 3.0], 6);
        assert_eq!(fitted, vec![1.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn fit_empty_stays_empty() {
        assert!(fit_series(&[], 48).is_empty());
        assert_eq!(fit_series_or_zero(&[], 4), vec![0.0; 4]);
    }

    #[test]
    fn resolution_mapping() {
        assert_eq!(Resolution::Hourly.horizon_slots(), 48);
        assert_eq!(Resolution::QuarterHourly.horizon_slots(), 192);
        assert_eq!(Resolution::from_slot_seconds(900), Some(Resolution::QuarterHourly));
        assert_eq!(Resolution::from_slot_seconds(1234), None);
    }
}
