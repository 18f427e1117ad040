//! Row and bucket types for the tally store.

use crate::types::{EventId, Payload};
use chrono::NaiveDate;
use serde::Serialize;

/// Calendar granularity of a tally bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TallyPeriod {
    Day,
    Month,
}

impl TallyPeriod {
    /// Bucket key for `date`: `YYYY-MM-DD` for days, `YYYY-MM` for months.
    pub fn bucket_key(&self, date: NaiveDate) -> String {
        match self {
            TallyPeriod::Day => date.format("%Y-%m-%d").to_string(),
            TallyPeriod::Month => date.format("%Y-%m").to_string(),
        }
    }

    /// Recovers the period from a stored bucket key.
    pub fn of_key(key: &str) -> Option<Self> {
        if NaiveDate::parse_from_str(key, "%Y-%m-%d").is_ok() {
            Some(TallyPeriod::Day)
        } else if NaiveDate::parse_from_str(&format!("{}-01", key), "%Y-%m-%d").is_ok() {
            Some(TallyPeriod::Month)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TallyPeriod::Day => "day",
            TallyPeriod::Month => "month",
        }
    }
}

/// One pending commit from a timer: counted against the day bucket of
/// `date` under `event_id`, and against its month bucket under the derived
/// monthly id.
#[derive(Clone, Debug, PartialEq)]
pub struct TallyIncrement {
    pub event_id: EventId,
    pub date: NaiveDate,
    pub unix_user_id: u32,
    pub payload: Payload,
    pub amount: u32,
}

/// A stored counter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TallyRow {
    #[serde(skip)]
    pub id: i64,
    pub event_id: EventId,
    pub bucket_key: String,
    pub unix_user_id: u32,
    pub payload: Payload,
    /// Saturated to `u32` on read.
    pub counter: u32,
}

impl TallyRow {
    pub fn period(&self) -> Option<TallyPeriod> {
        TallyPeriod::of_key(&self.bucket_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_keys() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 9).unwrap();
        assert_eq!(TallyPeriod::Day.bucket_key(date), "2024-02-09");
        assert_eq!(TallyPeriod::Month.bucket_key(date), "2024-02");
        assert_eq!(TallyPeriod::of_key("2024-02-09"), Some(TallyPeriod::Day));
        assert_eq!(TallyPeriod::of_key("2024-02"), Some(TallyPeriod::Month));
        assert_eq!(TallyPeriod::of_key("garbage"), None);
    }
}
