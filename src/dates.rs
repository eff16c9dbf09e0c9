//! Trailing date window for the receive-date filter.

use chrono::{Duration, NaiveDate};

/// Days covered by each run, ending today.
pub const WINDOW_DAYS: i64 = 180;

/// Inclusive `YYYYMMDD` bounds, in the form the openFDA range syntax expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

pub fn trailing_window(today: NaiveDate) -> DateRange {
    let start = today - Duration::days(WINDOW_DAYS);
    DateRange {
        from: start.format("%Y%m%d").to_string(),
        to: today.format("%Y%m%d").to_string(),
    }
}
