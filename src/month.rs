// 📅 Month tokens
// YYYY-MM tokens sort lexicographically in chronological order, so "latest" is a max().

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::IndexError;

/// A validated `YYYY-MM` month token
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(String);

impl Month {
    /// First day of the month
    pub fn first_day(&self) -> NaiveDate {
        // Validated in from_str
        NaiveDate::parse_from_str(&format!("{}-01", self.0), "%Y-%m-%d")
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The month before today's month (the most recent complete publication)
    pub fn previous() -> Self {
        let today = Utc::now().date_naive();
        let first = today.with_day(1).unwrap_or(today);
        let previous = first.checked_sub_months(Months::new(1)).unwrap_or(first);
        Month::from_date(previous)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Month(format!("{:04}-{:02}", date.year(), date.month()))
    }

    /// Suffix carried by the month's export files, e.g. `Jan_25.csv`
    pub fn export_file_suffix(&self) -> String {
        let date = self.first_day();
        format!("{}_{}.csv", date.format("%b"), date.format("%y"))
    }

    /// Long form used by the publication pages, e.g. `january-2025`
    pub fn publication_slug(&self) -> String {
        self.first_day().format("%B-%Y").to_string().to_lowercase()
    }
}

impl FromStr for Month {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let well_formed = token.len() == 7
            && token.as_bytes()[4] == b'-'
            && NaiveDate::parse_from_str(&format!("{}-01", token), "%Y-%m-%d").is_ok();

        if !well_formed {
            return Err(IndexError::Query(format!(
                "month must be formatted as YYYY-MM, got '{}'",
                s
            )));
        }

        Ok(Month(token.to_string()))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
