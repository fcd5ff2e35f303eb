//! Calendar day keys in the local timezone

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Calendar day (`YYYY-MM-DD`) a transaction is booked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(NaiveDate);

impl DayKey {
    #[must_use]
    pub const fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Today in the local timezone
    #[must_use]
    pub fn today() -> Self {
        Self(Local::now().date_naive())
    }

    /// Local calendar day of an instant
    #[must_use]
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        Self(instant.with_timezone(&Local).date_naive())
    }

    #[must_use]
    pub const fn date(self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = String;

    /// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp (mapped to its local day).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(value, DAY_FORMAT) {
            return Ok(Self(date));
        }
        DateTime::parse_from_rfc3339(value)
            .map(|instant| Self::from_instant(instant.with_timezone(&Utc)))
            .map_err(|_| format!("invalid day '{value}', expected YYYY-MM-DD"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_dates() {
        let day: DayKey = "2024-03-01".parse().unwrap();
        assert_eq!(day.to_string(), "2024-03-01");
    }

    #[test]
    fn rejects_garbage() {
        assert!("03/01/2024".parse::<DayKey>().is_err());
        assert!("".parse::<DayKey>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let day: DayKey = "2024-12-31".parse().unwrap();
        assert_eq!(serde_json::to_string(&day).unwrap(), "\"2024-12-31\"");
    }
}
