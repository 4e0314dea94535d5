//! Time and duration parsing for command line limits

use crate::{Result, SplitError, Timestamp};
use chrono::{DateTime, Utc};
use std::str::FromStr;

const MS_PER_UNIT: [(&str, i64); 7] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
    ("w", 7 * 86_400_000),
    ("y", 365 * 86_400_000),
];

/// Parse a duration such as `90s`, `2h45m` or `-1d` into milliseconds.
///
/// Valid units are ms, s, m, h, d, w, y.
pub fn parse_duration(input: &str) -> Result<i64> {
    let invalid = || SplitError::Config(format!("invalid duration {:?}", input));

    let (negative, mut rest) = match input.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, input),
    };
    if rest.is_empty() {
        return Err(invalid());
    }
    if rest == "0" {
        return Ok(0);
    }

    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        // "ms" must be tried before "m"
        let (unit, ms) = MS_PER_UNIT
            .iter()
            .filter(|(u, _)| rest.starts_with(u))
            .max_by_key(|(u, _)| u.len())
            .ok_or_else(invalid)?;
        rest = &rest[unit.len()..];

        total = value
            .checked_mul(*ms)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    Ok(if negative { -total } else { total })
}

/// A point in time given either absolutely (RFC 3339) or relative to now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrDuration {
    Time(Timestamp),
    Duration(i64),
}

impl TimeOrDuration {
    /// Resolve to a millisecond timestamp
    pub fn resolve(&self, now: DateTime<Utc>) -> Timestamp {
        match self {
            TimeOrDuration::Time(t) => *t,
            TimeOrDuration::Duration(d) => now.timestamp_millis().saturating_add(*d),
        }
    }

    /// Resolve against the current time
    pub fn resolve_now(&self) -> Timestamp {
        self.resolve(Utc::now())
    }
}

impl FromStr for TimeOrDuration {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(TimeOrDuration::Time(t.timestamp_millis()));
        }
        parse_duration(s).map(TimeOrDuration::Duration).map_err(|_| {
            SplitError::Config(format!(
                "{:?} is neither an RFC 3339 time nor a duration like -1d or 2h45m",
                s
            ))
        })
    }
}
