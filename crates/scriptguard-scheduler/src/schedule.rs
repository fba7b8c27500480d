//! Cron expression parsing and next-occurrence evaluation.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Timelike};
use scriptguard_core::config::MAX_CRON_EXPRESSIONS;
use scriptguard_core::Clock;
use tokio::sync::watch;

use crate::error::{Result, SchedulerError};

/// How a [`CronSchedule::sleep_until_next`] wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The occurrence at this instant is due.
    Due(DateTime<FixedOffset>),
    /// The schedule has no occurrence after the cursor.
    Exhausted,
    /// The shutdown signal flipped (or its sender went away).
    ShutDown,
}

#[derive(Debug, Clone)]
enum Kind {
    Cron(::cron::Schedule),
    /// Day-of-month and day-of-week both restricted: a day matches when
    /// either field does.
    DayEither {
        by_month_day: ::cron::Schedule,
        by_week_day: ::cron::Schedule,
    },
    /// `@every <duration>`, counted from the previous occurrence.
    Every(Duration),
}

/// A parsed six-field cron expression or `@descriptor`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    kind: Kind,
}

impl CronSchedule {
    /// Parse one expression.
    ///
    /// Fields are `sec min hour day-of-month month day-of-week`, with
    /// day-of-week numbered 0-6 from Sunday. When both day fields are
    /// restricted a day matches if either one does, as in classic cron.
    /// Descriptors such as `@daily` and `@hourly` are accepted, as is
    /// `@every <duration>` with a duration like `90s` or `1h30m`.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let invalid = |reason: String| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        if expression.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let kind = if let Some(interval) = expression.strip_prefix("@every") {
            Kind::Every(parse_interval(interval.trim()).map_err(invalid)?)
        } else if expression.starts_with('@') {
            Kind::Cron(compile(expression).map_err(invalid)?)
        } else {
            let fields: Vec<&str> = expression.split_whitespace().collect();
            if fields.len() != 6 {
                return Err(invalid(format!(
                    "expected 6 fields (sec min hour dom month dow), got {}",
                    fields.len()
                )));
            }
            let dow = shift_day_of_week(fields[5]).map_err(invalid)?;
            let (sec, min, hour, dom, month) =
                (fields[0], fields[1], fields[2], fields[3], fields[4]);

            if is_unrestricted(dom) || is_unrestricted(fields[5]) {
                let source = format!("{sec} {min} {hour} {dom} {month} {dow}");
                Kind::Cron(compile(&source).map_err(invalid)?)
            } else {
                let by_month_day = format!("{sec} {min} {hour} {dom} {month} *");
                let by_week_day = format!("{sec} {min} {hour} * {month} {dow}");
                Kind::DayEither {
                    by_month_day: compile(&by_month_day).map_err(invalid)?,
                    by_week_day: compile(&by_week_day).map_err(invalid)?,
                }
            }
        };

        Ok(Self {
            expression: expression.to_string(),
            kind,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`, in the same offset.
    pub fn next_after(&self, after: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        match &self.kind {
            Kind::Cron(schedule) => schedule.after(after).next(),
            Kind::DayEither {
                by_month_day,
                by_week_day,
            } => {
                let a = by_month_day.after(after).next();
                let b = by_week_day.after(after).next();
                match (a, b) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            Kind::Every(interval) => {
                let whole = after.with_nanosecond(0).unwrap_or(*after);
                whole.checked_add_signed(*interval)
            }
        }
    }

    /// Sleep until the first occurrence after `cursor`, or until `shutdown`
    /// flips.
    ///
    /// The wait is measured against `clock`, so an occurrence already in
    /// the past is due at once.
    pub async fn sleep_until_next(
        &self,
        clock: &dyn Clock,
        cursor: &DateTime<FixedOffset>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Wake {
        let Some(next) = self.next_after(cursor) else {
            return Wake::Exhausted;
        };
        let wait = (next - clock.now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return Wake::ShutDown,
        }
        if *shutdown.borrow() {
            return Wake::ShutDown;
        }
        Wake::Due(next)
    }
}

fn compile(source: &str) -> std::result::Result<::cron::Schedule, String> {
    ::cron::Schedule::from_str(source).map_err(|e| e.to_string())
}

fn is_unrestricted(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Parse an `@every` duration: one or more `<integer><unit>` pairs with
/// units `h`, `m`, `s` or `ms`. Sub-second remainders are dropped and the
/// result must be at least one second.
fn parse_interval(text: &str) -> std::result::Result<Duration, String> {
    if text.is_empty() {
        return Err("@every needs a duration such as 30s or 1h30m".to_string());
    }

    let mut total_ms: i64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(format!("bad duration {text:?}: expected a number at {rest:?}"));
        }
        let value: i64 = rest[..digits]
            .parse()
            .map_err(|_| format!("bad duration {text:?}: number too large"))?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let unit_ms = match &rest[..unit_len] {
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            "ms" => 1,
            "" => return Err(format!("bad duration {text:?}: missing unit")),
            other => return Err(format!("bad duration {text:?}: unknown unit {other:?}")),
        };
        rest = &rest[unit_len..];

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| format!("bad duration {text:?}: too large"))?;
    }

    let seconds = total_ms / 1_000;
    if seconds < 1 {
        return Err(format!("interval {text:?} is shorter than one second"));
    }
    Duration::try_seconds(seconds).ok_or_else(|| format!("bad duration {text:?}: too large"))
}

/// Validate a task's full cron set and parse every entry.
///
/// Rejects an empty set, more than [`MAX_CRON_EXPRESSIONS`] entries,
/// duplicates (after trimming) and anything unparsable. The error names the
/// offending expression.
pub fn validate_expressions(expressions: &[String]) -> Result<Vec<CronSchedule>> {
    if expressions.is_empty() {
        return Err(SchedulerError::EmptyCronSet);
    }
    if expressions.len() > MAX_CRON_EXPRESSIONS {
        return Err(SchedulerError::TooManyCrons {
            count: expressions.len(),
            max: MAX_CRON_EXPRESSIONS,
        });
    }

    let mut seen = HashSet::with_capacity(expressions.len());
    let mut schedules = Vec::with_capacity(expressions.len());
    for raw in expressions {
        let expression = raw.trim();
        if !seen.insert(expression) {
            return Err(SchedulerError::DuplicateCron {
                expression: expression.to_string(),
            });
        }
        schedules.push(CronSchedule::parse(expression)?);
    }
    Ok(schedules)
}

/// Renumber day-of-week from 0-6 (Sunday = 0) to the parser's 1-7
/// (Sunday = 1). Names, `*` and `?` pass through; step values after `/`
/// are counts and stay as they are.
fn shift_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let mut bounds = Vec::new();
        for bound in base.split('-') {
            if !bound.is_empty() && bound.bytes().all(|b| b.is_ascii_digit()) {
                let day: u32 = bound
                    .parse()
                    .map_err(|_| format!("bad day-of-week value {bound:?}"))?;
                if day > 6 {
                    return Err(format!("day-of-week {day} out of range 0-6"));
                }
                bounds.push((day + 1).to_string());
            } else {
                bounds.push(bound.to_string());
            }
        }
        let mut shifted = bounds.join("-");
        if let Some(step) = step {
            shifted.push('/');
            shifted.push_str(step);
        }
        items.push(shifted);
    }
    Ok(items.join(","))
}
