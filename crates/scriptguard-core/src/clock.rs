//! Time Source.
//!
//! Cron evaluation, execution timestamps and retention cutoffs all read the
//! same fixed-offset civil clock, so they agree no matter what time zone the
//! host is configured for.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};

use crate::error::{CoreError, Result};

/// Source of "now" in the canonical civil zone.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<FixedOffset>;

    /// The canonical offset; cron schedules are evaluated in this zone.
    fn offset(&self) -> FixedOffset;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock pinned to one fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetClock {
    offset: FixedOffset,
}

impl FixedOffsetClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Build from a config string such as `"+08:00"`, `"-05:30"` or `"Z"`.
    pub fn from_offset_str(s: &str) -> Result<Self> {
        parse_utc_offset(s).map(Self::new)
    }
}

impl Clock for FixedOffsetClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Clock that only moves when told to. Used by tests and dry runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offset(&self) -> FixedOffset {
        *self.now().offset()
    }
}

/// Parse `"+HH:MM"`, `"-HH:MM"`, `"+HH"` or `"Z"` into a [`FixedOffset`].
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| CoreError::InvalidOffset(s.to_string()));
    }

    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(CoreError::InvalidOffset(s.to_string())),
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| CoreError::InvalidOffset(s.to_string()))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| CoreError::InvalidOffset(s.to_string()))?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(CoreError::InvalidOffset(s.to_string()));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| CoreError::InvalidOffset(s.to_string()))
}

/// Fixed-width RFC 3339 with milliseconds.
///
/// Every persisted timestamp goes through here so that, with a single
/// canonical offset, lexical order in SQLite equals chronological order.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_common_offsets() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_utc_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("+02").unwrap().local_minus_utc(), 2 * 3600);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn rejects_garbage_offsets() {
        assert!(parse_utc_offset("08:00").is_err());
        assert!(parse_utc_offset("+24:00").is_err());
        assert!(parse_utc_offset("+08:75").is_err());
        assert!(parse_utc_offset("").is_err());
    }

    #[test]
    fn fixed_clock_reports_its_offset() {
        let clock = FixedOffsetClock::from_offset_str("+08:00").unwrap();
        assert_eq!(clock.now().offset().local_minus_utc(), 8 * 3600);
        assert_eq!(clock.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn manual_clock_advances() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let start = tz.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::milliseconds(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let a = tz.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + Duration::milliseconds(7);
        let (fa, fb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(fa, "2026-01-01T09:00:00.000+08:00");
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
    }
}
