// =============================================================================
// Shared types used across the Aurora feed service
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Bar granularity. Declaration order is the canonical merge order
/// (finest first), which is what `Ord` and every snapshot map rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl Interval {
    /// Wire name, also the JSON key of the interval in snapshot messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Nominal bucket length. Months are counted as 30 days.
    pub fn duration(self) -> chrono::Duration {
        match self {
            Self::Minute1 => chrono::Duration::minutes(1),
            Self::Minute5 => chrono::Duration::minutes(5),
            Self::Minute15 => chrono::Duration::minutes(15),
            Self::Hour1 => chrono::Duration::hours(1),
            Self::Hour4 => chrono::Duration::hours(4),
            Self::Day => chrono::Duration::days(1),
            Self::Week => chrono::Duration::weeks(1),
            Self::Month => chrono::Duration::days(30),
        }
    }

    /// Sort and de-duplicate a configured interval list.
    pub fn normalize_set(intervals: &[Interval]) -> Vec<Interval> {
        let mut set = intervals.to_vec();
        set.sort();
        set.dedup();
        set
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" is month on most venues; check it before lowercasing.
        if s.trim() == "1M" {
            return Ok(Self::Month);
        }
        match s.trim().to_lowercase().as_str() {
            "1m" | "minute" => Ok(Self::Minute1),
            "5m" => Ok(Self::Minute5),
            "15m" => Ok(Self::Minute15),
            "1h" | "60m" | "hour" => Ok(Self::Hour1),
            "4h" => Ok(Self::Hour4),
            "1d" | "day" | "daily" => Ok(Self::Day),
            "1w" | "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            other => Err(FeedError::InvalidSubscription(format!(
                "Unknown interval '{other}'."
            ))),
        }
    }
}

/// Case-sensitive instrument identifier, validated once at subscription time.
/// Only `[A-Za-z0-9:._-]` is accepted, so a symbol can be placed in a
/// provider URL path without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(raw: &str) -> Result<Self, FeedError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FeedError::InvalidSubscription("Symbol not provided.".into()));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'));
        if !valid {
            return Err(FeedError::InvalidSubscription(format!(
                "Malformed symbol '{raw}'."
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
