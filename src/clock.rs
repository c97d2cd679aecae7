use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Single source of wall time in the configured zone. All scheduling and
/// slot arithmetic goes through this; nothing relies on implicit local time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

/// Midnight of the day containing `now`, in the same zone. On DST days the
/// earlier of two ambiguous local midnights is taken.
pub fn today_midnight(now: DateTime<Tz>) -> DateTime<Tz> {
    let naive = now.date_naive().and_time(NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or(now)
}

/// Seconds elapsed since local midnight.
pub fn seconds_since_midnight(now: DateTime<Tz>) -> u32 {
    (now - today_midnight(now)).num_seconds().max(0) as u32
}
