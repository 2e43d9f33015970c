//! Half-open UTC date windows and ISO day keys.

use crate::error::{MetricsError, Result};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

/// Format of the date flags and of day-bucket keys.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A `[start, end)` interval in UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvertedWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Covers whole calendar days, `first` through `last` inclusive.
    pub fn from_days(first: NaiveDate, last: NaiveDate) -> Result<Self> {
        let end = last.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
        Self::new(start_of_day(first), start_of_day(end))
    }

    /// Builds a window from optional `yyyy-mm-dd` flags. A missing bound is unbounded.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let first = start
            .filter(|s| !s.trim().is_empty())
            .map(parse_date)
            .transpose()?
            .unwrap_or(NaiveDate::MIN);
        let last = end
            .filter(|s| !s.trim().is_empty())
            .map(parse_date)
            .transpose()?
            .unwrap_or(NaiveDate::MAX);
        Self::from_days(first, last)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn contains_opt(&self, at: Option<DateTime<Utc>>) -> bool {
        at.is_some_and(|at| self.contains(at))
    }

    /// The calendar days touched by the window, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start
            .date_naive()
            .iter_days()
            .take_while(move |day| start_of_day(*day) < end)
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|source| {
        MetricsError::InvalidDate {
            value: value.to_string(),
            source,
        }
    })
}

pub fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// The `YYYY-MM-DD` key of the UTC day containing `at`.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format(DATE_FORMAT).to_string()
}
