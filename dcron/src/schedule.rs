//! When a job fires. Cron expressions go through the `cron` crate; `@every`
//! intervals are handled here.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

const EVERY_PREFIX: &str = "@every";
const TZ_PREFIXES: [&str; 2] = ["CRON_TZ=", "TZ="];

pub trait Schedule: Send + Sync + fmt::Debug {
    /// First fire time strictly after `after`, `None` once the schedule is exhausted.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Expressions carry a leading seconds field.
    pub with_seconds: bool,
    pub timezone: Tz,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            with_seconds: false,
            timezone: Tz::UTC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl Schedule for CronSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

/// Fires at a fixed interval, never more often than once a second.
#[derive(Debug, Clone, Copy)]
pub struct Every {
    interval: TimeDelta,
}

impl Every {
    pub fn new(interval: Duration) -> Self {
        let interval = interval.max(Duration::from_secs(1));
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval.to_std().unwrap_or_default()
    }
}

impl Schedule for Every {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        after.checked_add_signed(self.interval)
    }
}

/// Parse a schedule expression.
///
/// Accepts `@every <duration>` (`1h30m`, `45s`, `500ms`), the `cron` crate's
/// descriptors (`@hourly`, `@daily`, ...) and field expressions, optionally
/// prefixed with `CRON_TZ=<zone>` to override the configured timezone.
pub fn parse(expr: &str, options: ScheduleOptions) -> Result<Arc<dyn Schedule>> {
    let (timezone, body) = split_timezone(expr.trim(), options.timezone)?;

    if let Some(interval) = body.strip_prefix(EVERY_PREFIX) {
        let interval = parse_duration(interval.trim())
            .ok_or_else(|| Error::invalid_schedule(expr, "bad @every interval"))?;
        return Ok(Arc::new(Every::new(interval)));
    }

    let normalized = if body.starts_with('@') {
        body.to_string()
    } else {
        let fields = body.split_whitespace().count();
        match (options.with_seconds, fields) {
            (false, 5) => format!("0 {body}"),
            (true, 6) => body.to_string(),
            (with_seconds, n) => {
                let expected = if with_seconds { 6 } else { 5 };
                return Err(Error::invalid_schedule(
                    expr,
                    format!("expected {expected} fields, found {n}"),
                ));
            }
        }
    };

    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| Error::invalid_schedule(expr, e))?;
    Ok(Arc::new(CronSchedule { schedule, timezone }))
}

fn split_timezone(expr: &str, default: Tz) -> Result<(Tz, &str)> {
    for prefix in TZ_PREFIXES {
        if let Some(rest) = expr.strip_prefix(prefix) {
            let (zone, body) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::invalid_schedule(expr, "missing expression after timezone"))?;
            let timezone = zone
                .parse::<Tz>()
                .map_err(|e| Error::invalid_schedule(expr, e))?;
            return Ok((timezone, body.trim()));
        }
    }
    Ok((default, expr))
}

/// `1h30m`, `90s`, `250ms`. Units: h, m, s, ms.
fn parse_duration(input: &str) -> Option<Duration> {
    if input.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}
