use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// An inclusive `(start, end)` date range.
///
/// Serialised as a two-element array of ISO dates so it can live inside a
/// task document next to the other dataset segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(NaiveDate, NaiveDate)", into = "(NaiveDate, NaiveDate)")]
pub struct Segment {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Segment {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CoreError::Validation(format!(
                "segment start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse from a pair of `YYYY-MM-DD` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| CoreError::Validation(format!("invalid date '{}': {}", s, e)))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    /// Number of days covered, both edges included.
    pub fn len_days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Move both edges forward by `days`.
    pub fn shift(&self, days: u64) -> Result<Self> {
        Ok(Self {
            start: add_days(self.start, days)?,
            end: add_days(self.end, days)?,
        })
    }

    /// Move only the trailing edge forward by `days`.
    pub fn extend(&self, days: u64) -> Result<Self> {
        Ok(Self {
            start: self.start,
            end: add_days(self.end, days)?,
        })
    }

    /// Pull the trailing edge back by `days`, never past the start.
    pub fn truncate(&self, days: u64) -> Self {
        let end = self
            .end
            .checked_sub_days(Days::new(days))
            .unwrap_or(self.start)
            .max(self.start);
        Self { start: self.start, end }
    }
}

pub(crate) fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| CoreError::Validation(format!("date overflow adding {} days to {}", days, date)))
}

impl TryFrom<(NaiveDate, NaiveDate)> for Segment {
    type Error = CoreError;

    fn try_from((start, end): (NaiveDate, NaiveDate)) -> Result<Self> {
        Self::new(start, end)
    }
}

impl From<Segment> for (NaiveDate, NaiveDate) {
    fn from(segment: Segment) -> Self {
        (segment.start, segment.end)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// How non-test segments move as the test window rolls forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollType {
    /// Fixed-width window: both edges advance.
    #[default]
    Sliding,
    /// Growing window: the training start stays put.
    Expanding,
}

impl fmt::Display for RollType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollType::Sliding => write!(f, "sliding"),
            RollType::Expanding => write!(f, "expanding"),
        }
    }
}
