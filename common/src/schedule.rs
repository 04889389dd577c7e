// Trigger parsing and fire time calculation
//
// A trigger is built from a persisted `(trigger_kind, trigger_args)` pair and
// answers one question for the dispatch loop: when does this job fire next.
// Three kinds exist: fixed `interval`, calendar `cron`, and one-shot `date`.

use crate::errors::ScheduleError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Cron calendar fields, most significant first
const CRON_FIELDS: [&str; 8] = [
    "year",
    "month",
    "day",
    "week",
    "day_of_week",
    "hour",
    "minute",
    "second",
];

const WEEKDAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Upper bound on cron fire times walked while coalescing one backlog
const MAX_COALESCE_STEPS: usize = 10_000;

/// The declared kind of a persisted trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Interval,
    Cron,
    Date,
}

impl FromStr for TriggerKind {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(TriggerKind::Interval),
            "cron" => Ok(TriggerKind::Cron),
            "date" => Ok(TriggerKind::Date),
            other => Err(ScheduleError::UnknownTriggerKind(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Interval => "interval",
            TriggerKind::Cron => "cron",
            TriggerKind::Date => "date",
        };
        f.write_str(s)
    }
}

/// Fixed-period trigger: fires at `start_date + k * interval`
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    interval: Duration,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
}

/// Calendar trigger evaluated in its own timezone
#[derive(Debug, Clone)]
pub struct CronTrigger {
    schedule: CronSchedule,
    description: String,
    timezone: Tz,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

/// One-shot trigger
#[derive(Debug, Clone)]
pub struct DateTrigger {
    run_date: DateTime<Utc>,
    timezone: Tz,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(IntervalTrigger),
    Cron(CronTrigger),
    Date(DateTrigger),
}

impl Trigger {
    /// Build a trigger from its persisted configuration
    ///
    /// `default_tz` applies to naive dates and cron fields when the arguments
    /// carry no `timezone`. `now` anchors an interval without `start_date`.
    pub fn from_config(
        kind: &str,
        trigger_args: &Value,
        default_tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let kind = TriggerKind::from_str(kind)?;
        let args = match trigger_args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ScheduleError::InvalidArguments(format!(
                    "expected a JSON object, got {}",
                    other
                )))
            }
        };

        match kind {
            TriggerKind::Interval => parse_interval(&args, default_tz, now).map(Trigger::Interval),
            TriggerKind::Cron => parse_cron(&args, default_tz).map(Trigger::Cron),
            TriggerKind::Date => parse_date(&args, default_tz).map(Trigger::Date),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Interval(_) => TriggerKind::Interval,
            Trigger::Cron(_) => TriggerKind::Cron,
            Trigger::Date(_) => TriggerKind::Date,
        }
    }

    /// Next fire time following `previous`, or the first one at or after `now`
    /// when the job has not fired yet. `None` means the series is exhausted.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match (self, previous) {
            (Trigger::Interval(t), Some(prev)) => {
                prev.checked_add_signed(t.interval).and_then(|fire| t.bounded(fire))
            }
            (Trigger::Interval(t), None) => {
                if t.start_date >= now {
                    t.bounded(t.start_date)
                } else {
                    let steps = div_ceil(now - t.start_date, t.step_ms());
                    t.grid_point(steps).and_then(|fire| t.bounded(fire))
                }
            }
            (Trigger::Cron(t), Some(prev)) => t.first_after(prev),
            (Trigger::Cron(t), None) => t.first_after(just_before(now)),
            (Trigger::Date(t), None) => Some(t.run_date),
            (Trigger::Date(_), Some(_)) => None,
        }
    }

    /// First fire time strictly after `now`
    pub fn next_fire_time_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(t) => {
                if t.start_date > now {
                    t.bounded(t.start_date)
                } else {
                    let steps = div_floor(now - t.start_date, t.step_ms()).checked_add(1)?;
                    t.grid_point(steps).and_then(|fire| t.bounded(fire))
                }
            }
            Trigger::Cron(t) => t.first_after(now),
            Trigger::Date(_) => None,
        }
    }

    /// Collapse every fire time in `[due, now]` into the latest one
    ///
    /// Fire times older than `horizon` are not walked; when none of the
    /// backlog reaches `horizon`, `due` itself is returned.
    pub fn latest_due(
        &self,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if due >= now {
            return due;
        }
        match self {
            Trigger::Interval(t) => {
                let limit = match t.end_date {
                    Some(end) if end < now => end,
                    _ => now,
                };
                if limit <= due {
                    return due;
                }
                let steps = div_floor(limit - due, t.step_ms());
                steps
                    .checked_mul(t.step_ms())
                    .and_then(Duration::try_milliseconds)
                    .and_then(|offset| due.checked_add_signed(offset))
                    .unwrap_or(due)
            }
            Trigger::Cron(t) => {
                let mut latest = due;
                let from = if due >= horizon { due } else { horizon };
                for fire in t
                    .iter_after(from)
                    .take_while(|fire| *fire <= now)
                    .take(MAX_COALESCE_STEPS)
                {
                    latest = fire;
                }
                latest
            }
            Trigger::Date(_) => due,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(t) => write!(f, "interval[{}]", format_timedelta(t.interval)),
            Trigger::Cron(t) => write!(f, "cron[{}]", t.description),
            Trigger::Date(t) => write!(
                f,
                "date[{}]",
                t.run_date
                    .with_timezone(&t.timezone)
                    .format("%Y-%m-%d %H:%M:%S %Z")
            ),
        }
    }
}

impl IntervalTrigger {
    fn bounded(&self, fire: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end_date {
            Some(end) if fire > end => None,
            _ => Some(fire),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn step_ms(&self) -> i64 {
        self.interval.num_milliseconds().max(1)
    }

    /// `start_date + steps * interval`; `None` outside the representable range
    fn grid_point(&self, steps: i64) -> Option<DateTime<Utc>> {
        let offset = Duration::try_milliseconds(steps.checked_mul(self.step_ms())?)?;
        self.start_date.checked_add_signed(offset)
    }
}

impl CronTrigger {
    fn iter_after(&self, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let reference = match self.start_date {
            Some(start) if start > after => just_before(start),
            _ => after,
        };
        let end = self.end_date;
        self.schedule
            .after(&reference.with_timezone(&self.timezone))
            .map(|fire| fire.with_timezone(&Utc))
            .take_while(move |fire| end.map_or(true, |end| *fire <= end))
    }

    fn first_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.iter_after(after).next()
    }
}

fn just_before(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_sub_signed(Duration::milliseconds(1)).unwrap_or(at)
}

/// Whole periods of `step_ms` in `span`, never negative
fn div_floor(span: Duration, step_ms: i64) -> i64 {
    span.num_milliseconds().div_euclid(step_ms).max(0)
}

/// Periods of `step_ms` needed to cover `span`, never negative
fn div_ceil(span: Duration, step_ms: i64) -> i64 {
    let span_ms = span.num_milliseconds();
    let steps = span_ms.div_euclid(step_ms) + i64::from(span_ms.rem_euclid(step_ms) != 0);
    steps.max(0)
}

/// Render a duration as `H:MM:SS`, prefixed with the day count when needed
fn format_timedelta(d: Duration) -> String {
    let total_ms = d.num_milliseconds();
    let days = total_ms.div_euclid(86_400_000);
    let rem_ms = total_ms.rem_euclid(86_400_000);
    let hours = rem_ms / 3_600_000;
    let minutes = (rem_ms % 3_600_000) / 60_000;
    let seconds = (rem_ms % 60_000) / 1000;
    let millis = rem_ms % 1000;

    let mut out = String::new();
    if days != 0 {
        let unit = if days.abs() == 1 { "day" } else { "days" };
        out.push_str(&format!("{} {}, ", days, unit));
    }
    out.push_str(&format!("{}:{:02}:{:02}", hours, minutes, seconds));
    if millis != 0 {
        out.push_str(&format!(".{:06}", millis * 1000));
    }
    out
}

// ============================================================================
// Argument parsing
// ============================================================================

fn reject_unknown(args: &Map<String, Value>, allowed: &[&str]) -> Result<(), ScheduleError> {
    match args.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(ScheduleError::InvalidArgument {
            name: key.clone(),
            reason: "unknown argument".to_string(),
        }),
        None => Ok(()),
    }
}

fn number_arg(args: &Map<String, Value>, name: &str) -> Result<f64, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidArgument {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let value = match args.get(name) {
        None | Some(Value::Null) => return Ok(0.0),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| invalid("not a finite number"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid("not a number"))?,
        Some(_) => return Err(invalid("expected a number")),
    };
    if !value.is_finite() || value < 0.0 {
        return Err(invalid("must be a non-negative number"));
    }
    Ok(value)
}

fn timezone_arg(args: &Map<String, Value>, default_tz: Tz) -> Result<Tz, ScheduleError> {
    match args.get("timezone") {
        None | Some(Value::Null) => Ok(default_tz),
        Some(Value::String(name)) => {
            Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.clone()))
        }
        Some(other) => Err(ScheduleError::InvalidTimezone(other.to_string())),
    }
}

fn date_arg(
    args: &Map<String, Value>,
    name: &str,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_datetime(value, tz).map(Some),
    }
}

/// Parse an absolute time from a JSON value
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DD[ T]HH:MM[:SS[.f]]` strings and
/// bare dates (interpreted in `tz`), and integer Unix timestamps.
pub fn parse_datetime(value: &Value, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidDate {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match value {
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| invalid("timestamp must be an integer"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| invalid("timestamp out of range"))
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            let naive = [
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M",
                "%Y-%m-%dT%H:%M",
            ]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .ok_or_else(|| invalid("unrecognized date format"))?;

            tz.from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| invalid("time does not exist in the timezone"))
        }
        _ => Err(invalid("expected a string or a timestamp")),
    }
}

fn parse_interval(
    args: &Map<String, Value>,
    default_tz: Tz,
    now: DateTime<Utc>,
) -> Result<IntervalTrigger, ScheduleError> {
    reject_unknown(
        args,
        &[
            "weeks",
            "days",
            "hours",
            "minutes",
            "seconds",
            "start_date",
            "end_date",
            "timezone",
        ],
    )?;

    let total_ms = number_arg(args, "weeks")? * 604_800_000.0
        + number_arg(args, "days")? * 86_400_000.0
        + number_arg(args, "hours")? * 3_600_000.0
        + number_arg(args, "minutes")? * 60_000.0
        + number_arg(args, "seconds")? * 1000.0;
    let total_ms = total_ms.round();
    if total_ms < 1.0 {
        return Err(ScheduleError::InvalidArgument {
            name: "interval".to_string(),
            reason: "must be a positive duration".to_string(),
        });
    }
    let out_of_range = || ScheduleError::InvalidArgument {
        name: "interval".to_string(),
        reason: "too large".to_string(),
    };
    if total_ms >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    let interval = Duration::try_milliseconds(total_ms as i64).ok_or_else(out_of_range)?;

    let tz = timezone_arg(args, default_tz)?;
    let start_date = match date_arg(args, "start_date", tz)? {
        Some(start) => start,
        None => now.checked_add_signed(interval).ok_or_else(out_of_range)?,
    };
    let end_date = date_arg(args, "end_date", tz)?;

    Ok(IntervalTrigger {
        interval,
        start_date,
        end_date,
    })
}

fn field_value(name: &str, value: &Value) -> Result<String, ScheduleError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) if n.is_u64() => Ok(n.to_string()),
        _ => Err(ScheduleError::InvalidArgument {
            name: name.to_string(),
            reason: "expected a non-empty string or a non-negative integer".to_string(),
        }),
    }
}

/// Translate a `day_of_week` expression (0 = Monday, or names) into
/// capitalized weekday names
fn translate_day_of_week(expr: &str) -> Result<String, ScheduleError> {
    let token = |raw: &str| -> Result<String, ScheduleError> {
        if raw == "*" {
            return Ok(raw.to_string());
        }
        if let Ok(n) = raw.parse::<usize>() {
            return WEEKDAY_NAMES
                .get(n)
                .map(|name| name.to_string())
                .ok_or_else(|| ScheduleError::InvalidArgument {
                    name: "day_of_week".to_string(),
                    reason: format!("{} is outside 0-6", n),
                });
        }
        let lower = raw.to_ascii_lowercase();
        WEEKDAY_NAMES
            .iter()
            .find(|name| lower.starts_with(&name.to_ascii_lowercase()))
            .map(|name| name.to_string())
            .ok_or_else(|| ScheduleError::InvalidArgument {
                name: "day_of_week".to_string(),
                reason: format!("unknown weekday '{}'", raw),
            })
    };

    expr.split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            let base = match base.split_once('-') {
                Some((from, to)) => format!("{}-{}", token(from.trim())?, token(to.trim())?),
                None => token(base.trim())?,
            };
            Ok(match step {
                Some(step) => format!("{}/{}", base, step.trim()),
                None => base,
            })
        })
        .collect::<Result<Vec<_>, ScheduleError>>()
        .map(|parts| parts.join(","))
}

fn parse_cron(args: &Map<String, Value>, default_tz: Tz) -> Result<CronTrigger, ScheduleError> {
    let mut allowed: Vec<&str> = CRON_FIELDS.to_vec();
    allowed.extend(["expression", "start_date", "end_date", "timezone"]);
    reject_unknown(args, &allowed)?;

    let tz = timezone_arg(args, default_tz)?;
    let start_date = date_arg(args, "start_date", tz)?;
    let end_date = date_arg(args, "end_date", tz)?;

    let (expression, description) = if let Some(raw) = args.get("expression") {
        if let Some(field) = CRON_FIELDS.iter().find(|f| args.contains_key(**f)) {
            return Err(ScheduleError::InvalidArgument {
                name: field.to_string(),
                reason: "cannot be combined with 'expression'".to_string(),
            });
        }
        let expression = field_value("expression", raw)?;
        let description = format!("expression='{}'", expression);
        (expression, description)
    } else {
        let mut values: Vec<(&str, String)> = Vec::new();
        for name in CRON_FIELDS {
            if let Some(value) = args.get(name) {
                values.push((name, field_value(name, value)?));
            }
        }
        if values.is_empty() {
            return Err(ScheduleError::InvalidArguments(
                "cron trigger needs 'expression' or at least one calendar field".to_string(),
            ));
        }

        // Unset fields up to the least significant given field stay open,
        // later ones default to their minimum.
        let mut resolved: Vec<String> = Vec::with_capacity(CRON_FIELDS.len());
        let mut remaining = values.len();
        for name in CRON_FIELDS {
            let given = values.iter().find(|(n, _)| *n == name).map(|(_, v)| v.clone());
            let expr = match given {
                Some(v) => {
                    remaining -= 1;
                    v
                }
                None if remaining > 0 => "*".to_string(),
                None => match name {
                    "month" | "day" => "1".to_string(),
                    "hour" | "minute" | "second" => "0".to_string(),
                    _ => "*".to_string(),
                },
            };
            resolved.push(expr);
        }

        // resolved follows CRON_FIELDS order
        let [year, month, day, week, day_of_week, hour, minute, second]: [String; 8] = resolved
            .try_into()
            .map_err(|_| ScheduleError::InvalidArguments("cron field count".to_string()))?;
        if week != "*" {
            return Err(ScheduleError::InvalidArgument {
                name: "week".to_string(),
                reason: "only '*' is supported".to_string(),
            });
        }
        let day_of_week = translate_day_of_week(&day_of_week)?;
        let expression = format!(
            "{} {} {} {} {} {} {}",
            second, minute, hour, day, month, day_of_week, year
        );
        let description = values
            .iter()
            .map(|(name, value)| format!("{}='{}'", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        (expression, description)
    };

    let schedule =
        CronSchedule::from_str(&expression).map_err(|e| ScheduleError::InvalidCronExpression {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;

    Ok(CronTrigger {
        schedule,
        description,
        timezone: tz,
        start_date,
        end_date,
    })
}

fn parse_date(args: &Map<String, Value>, default_tz: Tz) -> Result<DateTrigger, ScheduleError> {
    reject_unknown(args, &["run_date", "timezone"])?;
    let tz = timezone_arg(args, default_tz)?;
    let run_date = date_arg(args, "run_date", tz)?.ok_or_else(|| ScheduleError::InvalidArgument {
        name: "run_date".to_string(),
        reason: "required".to_string(),
    })?;
    Ok(DateTrigger {
        run_date,
        timezone: tz,
    })
}
