// Property-based tests for trigger construction and fire-time arithmetic
// Feature: chronocast-scheduler

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use common::errors::ScheduleError;
use common::schedule::{Trigger, TriggerKind};
use proptest::prelude::*;
use serde_json::json;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 8, 30, 0).unwrap()
}

// Property 20: Interval fire times stay on the start_date grid
// Feature: chronocast-scheduler, Property 20: Interval grid alignment
// For any start_date in the past (up to two centuries back) and any interval,
// the first fire time is the earliest grid point at or after now.
#[test]
fn property_20_interval_first_fire_is_next_grid_point() {
    proptest!(ProptestConfig::with_cases(256), |(
        interval_secs in prop_oneof![1i64..10i64, 1i64..10_000_000i64],
        start_offset_secs in prop_oneof![0i64..10_000_000i64, 0i64..6_400_000_000i64],
    )| {
        let now = base_time();
        let start = now - Duration::seconds(start_offset_secs);
        let trigger = Trigger::from_config(
            "interval",
            &json!({ "seconds": interval_secs, "start_date": start.to_rfc3339() }),
            chrono_tz::UTC,
            now,
        ).unwrap();

        let fire = trigger.next_fire_time(None, now).unwrap();
        prop_assert!(fire >= now);
        prop_assert!(fire - now < Duration::seconds(interval_secs));
        prop_assert_eq!((fire - start).num_seconds() % interval_secs, 0);

        let after = trigger.next_fire_time_after(fire).unwrap();
        prop_assert_eq!(after - fire, Duration::seconds(interval_secs));
    });
}

// Property 21: Coalescing never returns a time in the future or before due
// Feature: chronocast-scheduler, Property 21: Backlog coalescing
#[test]
fn property_21_interval_latest_due_is_latest_missed_fire() {
    proptest!(ProptestConfig::with_cases(256), |(
        interval_secs in prop_oneof![1i64..3_600i64, 1i64..10_000_000i64],
        backlog_secs in prop_oneof![0i64..100_000i64, 0i64..6_400_000_000i64],
    )| {
        let due = base_time();
        let now = due + Duration::seconds(backlog_secs);
        let trigger = Trigger::from_config(
            "interval",
            &json!({ "seconds": interval_secs, "start_date": due.to_rfc3339() }),
            chrono_tz::UTC,
            due,
        ).unwrap();

        let latest = trigger.latest_due(due, now, now - Duration::seconds(60));
        prop_assert!(latest >= due);
        prop_assert!(latest <= now);
        prop_assert!(now - latest < Duration::seconds(interval_secs));
        prop_assert_eq!((latest - due).num_seconds() % interval_secs, 0);
    });
}

// Property 22: Cron calendar fields are honoured
// Feature: chronocast-scheduler, Property 22: Cron hour/minute fields
// For any hour and minute, the next fire time lands on exactly that wall time
// with seconds defaulted to zero, within one day.
#[test]
fn property_22_cron_fields_fire_on_requested_wall_time() {
    proptest!(ProptestConfig::with_cases(256), |(
        hour in 0u32..24u32,
        minute in 0u32..60u32,
    )| {
        let now = base_time();
        let trigger = Trigger::from_config(
            "cron",
            &json!({ "hour": hour, "minute": minute.to_string() }),
            chrono_tz::UTC,
            now,
        ).unwrap();

        let fire = trigger.next_fire_time(None, now).unwrap();
        prop_assert_eq!(fire.hour(), hour);
        prop_assert_eq!(fire.minute(), minute);
        prop_assert_eq!(fire.second(), 0);
        prop_assert!(fire >= now);
        prop_assert!(fire - now < Duration::days(1));
        prop_assert_eq!(
            trigger.to_string(),
            format!("cron[hour='{}', minute='{}']", hour, minute)
        );
    });
}

// Property 23: Unknown trigger arguments are rejected
// Feature: chronocast-scheduler, Property 23: Strict trigger arguments
#[test]
fn property_23_unknown_arguments_are_rejected() {
    proptest!(ProptestConfig::with_cases(128), |(
        key in "x_[a-z]{1,10}",
        kind in prop::sample::select(vec!["interval", "cron", "date"]),
    )| {
        let mut args = match kind {
            "interval" => json!({ "seconds": 5 }),
            "cron" => json!({ "minute": "*/5" }),
            _ => json!({ "run_date": "2025-08-07 12:00:00" }),
        };
        args[key.as_str()] = json!(1);

        let result = Trigger::from_config(kind, &args, chrono_tz::UTC, base_time());
        let rejected = matches!(result, Err(ScheduleError::InvalidArgument { .. }));
        prop_assert!(rejected, "{} trigger accepted unknown key {}", kind, key);
    });
}

// Property 24: A date trigger fires exactly once
// Feature: chronocast-scheduler, Property 24: One-shot triggers
#[test]
fn property_24_date_trigger_fires_once() {
    proptest!(ProptestConfig::with_cases(128), |(
        offset_secs in -100_000i64..100_000i64,
    )| {
        let now = base_time();
        let run_date = now + Duration::seconds(offset_secs);
        let trigger = Trigger::from_config(
            "date",
            &json!({ "run_date": run_date.to_rfc3339() }),
            chrono_tz::UTC,
            now,
        ).unwrap();

        prop_assert_eq!(trigger.kind(), TriggerKind::Date);
        prop_assert_eq!(trigger.next_fire_time(None, now), Some(run_date));
        prop_assert_eq!(trigger.next_fire_time(Some(run_date), now), None);
        prop_assert_eq!(trigger.next_fire_time_after(now), None);
    });
}

// Property 25: Interval magnitude never breaks fire-time arithmetic
// Feature: chronocast-scheduler, Property 25: Interval range
// Any non-negative interval either builds a trigger whose fire times are not in
// the past, or is rejected as an invalid `interval` argument.
#[test]
fn property_25_interval_magnitude_is_validated() {
    proptest!(ProptestConfig::with_cases(256), |(
        weeks in prop_oneof![0.0f64..1_000.0f64, 0.0f64..1e20f64],
        seconds in 0u32..120u32,
        start_offset_secs in prop::option::of(0i64..6_400_000_000i64),
    )| {
        let now = base_time();
        let mut args = json!({ "weeks": weeks, "seconds": seconds });
        if let Some(offset) = start_offset_secs {
            args["start_date"] = json!((now - Duration::seconds(offset)).to_rfc3339());
        }

        match Trigger::from_config("interval", &args, chrono_tz::UTC, now) {
            Ok(trigger) => {
                if let Some(fire) = trigger.next_fire_time(None, now) {
                    prop_assert!(fire >= now);
                }
                if let Some(fire) = trigger.next_fire_time_after(now) {
                    prop_assert!(fire > now);
                }
            }
            Err(err) => {
                let interval_error = matches!(
                    err,
                    ScheduleError::InvalidArgument { ref name, .. } if name == "interval"
                );
                prop_assert!(interval_error, "unexpected error {:?}", err);
            }
        }
    });
}

// Property 26: An end_date before start_date yields no fire time
// Feature: chronocast-scheduler, Property 26: Empty interval series
#[test]
fn property_26_end_before_start_never_fires() {
    proptest!(ProptestConfig::with_cases(128), |(
        interval_secs in 1i64..100_000i64,
        start_offset_secs in -10_000_000i64..10_000_000i64,
        gap_secs in 1i64..10_000_000i64,
    )| {
        let now = base_time();
        let start = now + Duration::seconds(start_offset_secs);
        let end = start - Duration::seconds(gap_secs);
        let trigger = Trigger::from_config(
            "interval",
            &json!({
                "seconds": interval_secs,
                "start_date": start.to_rfc3339(),
                "end_date": end.to_rfc3339(),
            }),
            chrono_tz::UTC,
            now,
        ).unwrap();

        prop_assert_eq!(trigger.next_fire_time(None, now), None);
        prop_assert_eq!(trigger.next_fire_time_after(now), None);
    });
}
