//! Wall-clock helpers.

use chrono::{Local, NaiveDate, Utc};

/// Milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Today's date in the device's local timezone, which is the day a field
/// user's work is scoped to.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Formats a date the way the remote service stores it (`YYYY-MM-DD`).
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
