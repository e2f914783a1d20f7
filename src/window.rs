//! Trailing time window for upstream queries.

use chrono::{DateTime, Duration, Utc};

/// The window a single run covers: `end` is the run timestamp, `start`
/// lies `lookback_days` earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window of `lookback_days` days ending at `now`. A lookback of zero
    /// is legal and yields an empty window (`start == end`).
    pub fn trailing(now: DateTime<Utc>, lookback_days: i64) -> Self {
        Self {
            start: now - Duration::days(lookback_days),
            end: now,
        }
    }

    /// Window length in whole seconds, the `timeperiod` value the upstream
    /// API expects (604800 for the default week).
    pub fn timeperiod_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// HDX date-range string: start floored to midnight, end ceiled to
    /// 23:59:59, e.g. `[2024-07-23T00:00:00 TO 2024-07-30T23:59:59]`.
    pub fn dataset_date(&self) -> String {
        format!(
            "[{} TO {}]",
            self.start.format("%Y-%m-%dT00:00:00"),
            self.end.format("%Y-%m-%dT23:59:59"),
        )
    }
}
