use chrono::{DateTime, Duration, Utc};

use crate::{
    config::SchedulerConfig,
    types::{AlarmConfig, Forecast, ForecastPoint},
};

/// Computes when temperature conditions should next be re-evaluated.
///
/// `last_forecast_update` of `None` means the forecast has never been fetched. Whatever branch
/// produces the raw answer, the result is never earlier than the last update plus the minimum
/// refresh interval.
pub fn next_check_date(
    forecast: Option<&Forecast>,
    last_forecast_update: Option<DateTime<Utc>>,
    alarm: &AlarmConfig,
    any_device_operating: bool,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> DateTime<Utc> {
    let raw = raw_next_check(
        forecast,
        last_forecast_update,
        alarm,
        any_device_operating,
        now,
        config,
    );

    match last_forecast_update {
        Some(last) => raw.max(after(last, config.min_refresh_interval_ms)),
        None => raw,
    }
}

fn raw_next_check(
    forecast: Option<&Forecast>,
    last_forecast_update: Option<DateTime<Utc>>,
    alarm: &AlarmConfig,
    any_device_operating: bool,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> DateTime<Utc> {
    let Some(last_update) = last_forecast_update else {
        return now;
    };

    let bounds = match alarm.bounds.resolved() {
        Some(bounds) if alarm.enabled => bounds,
        _ => return after(last_update, config.idle_interval_ms),
    };

    if !any_device_operating {
        return after(now, config.idle_interval_ms);
    }

    let Some(forecast) = forecast.filter(|forecast| !forecast.points.is_empty()) else {
        return now;
    };

    comfort_boundary(forecast, bounds, now)
}

/// Latest-to-earliest fold over the forecast plus the current reading. The carried point is only
/// replaced when the next one falls on the other side of the comfort range, so the answer is the
/// start of the final classification run rather than the first crossing after `now`.
fn comfort_boundary(
    forecast: &Forecast,
    (low, high): (f64, f64),
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let in_range = |point: &ForecastPoint| (low..=high).contains(&point.temperature);

    let mut working = forecast.points.clone();
    working.push(ForecastPoint::new(now, forecast.current_temperature));
    working.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut points = working.into_iter();
    let Some(first) = points.next() else {
        return now;
    };

    points
        .fold(first, |carried, next| {
            if in_range(&next) != in_range(&carried) {
                next
            } else {
                carried
            }
        })
        .timestamp
}

/// Millisecond config value as a chrono duration, saturating at the largest representable span.
pub fn millis(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

fn after(instant: DateTime<Utc>, delay_ms: u64) -> DateTime<Utc> {
    instant
        .checked_add_signed(millis(delay_ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::ComfortBounds;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 14, 15, 0, 0).unwrap()
    }

    fn alarm() -> AlarmConfig {
        AlarmConfig {
            enabled: true,
            bounds: ComfortBounds::new(65.0, 78.0),
        }
    }

    fn hourly(temps: &[f64]) -> Forecast {
        let points = temps
            .iter()
            .enumerate()
            .map(|(i, t)| ForecastPoint::new(now() + Duration::hours(i as i64 + 1), *t))
            .collect();
        Forecast::new(70.0, points, now() - Duration::hours(1))
    }

    fn check(
        forecast: Option<&Forecast>,
        last: Option<DateTime<Utc>>,
        alarm: &AlarmConfig,
    ) -> DateTime<Utc> {
        next_check_date(forecast, last, alarm, true, now(), &SchedulerConfig::default())
    }

    #[test]
    fn never_updated_checks_now() {
        let forecast = hourly(&[70.0; 8]);
        assert_eq!(check(Some(&forecast), None, &alarm()), now());
    }

    #[test]
    fn disabled_alarm_waits_twelve_hours_from_last_update() {
        let last = now() - Duration::hours(2);
        let forecast = hourly(&[90.0; 8]);
        let disabled = AlarmConfig {
            enabled: false,
            ..alarm()
        };

        assert_eq!(check(Some(&forecast), Some(last), &disabled), last + Duration::hours(12));
        assert_eq!(check(None, Some(last), &disabled), last + Duration::hours(12));
    }

    #[test]
    fn missing_bound_waits_twelve_hours_from_last_update() {
        let last = now() - Duration::hours(2);
        let half = AlarmConfig {
            enabled: true,
            bounds: ComfortBounds {
                low: Some(60.0),
                high: None,
            },
        };

        assert_eq!(check(None, Some(last), &half), last + Duration::hours(12));
    }

    #[test]
    fn no_device_operating_waits_twelve_hours_from_now() {
        let last = now() - Duration::hours(2);
        let forecast = hourly(&[70.0; 8]);
        let next = next_check_date(
            Some(&forecast),
            Some(last),
            &alarm(),
            false,
            now(),
            &SchedulerConfig::default(),
        );

        assert_eq!(next, now() + Duration::hours(12));
    }

    #[test]
    fn empty_forecast_checks_now_when_update_is_old() {
        let last = now() - Duration::hours(3);
        let empty = Forecast::new(70.0, Vec::new(), last);

        assert_eq!(check(Some(&empty), Some(last), &alarm()), now());
        assert_eq!(check(None, Some(last), &alarm()), now());
    }

    #[test]
    fn empty_forecast_is_clamped_after_recent_update() {
        let last = now() - Duration::minutes(5);
        let next = check(None, Some(last), &alarm());

        assert_eq!(next, last + Duration::minutes(15));
    }

    #[test]
    fn uniformly_comfortable_forecast_returns_last_point() {
        let forecast = hourly(&[66.0, 68.0, 70.0, 72.0, 74.0, 75.0, 76.0, 77.0]);
        let last_point = forecast.points.last().unwrap().timestamp;

        assert_eq!(check(Some(&forecast), Some(now() - Duration::hours(1)), &alarm()), last_point);
    }

    #[test]
    fn in_then_out_forecast_reports_last_comfortable_point() {
        let mut temps = vec![70.0; 8];
        temps.extend(vec![85.0; 8]);
        let forecast = hourly(&temps);

        let next = check(Some(&forecast), Some(now() - Duration::hours(1)), &alarm());

        assert_eq!(next, forecast.points[7].timestamp);
    }

    #[test]
    fn fold_keeps_latest_run_on_non_monotonic_forecast() {
        // in, out, in, out: the carried point flips on every change, ending at the earliest flip.
        let forecast = hourly(&[70.0, 85.0, 70.0, 85.0]);
        let next = check(Some(&forecast), Some(now() - Duration::hours(1)), &alarm());

        assert_eq!(next, forecast.points[0].timestamp);
    }

    #[test]
    fn comfortable_now_with_hot_forecast_is_clamped() {
        let mut forecast = hourly(&[85.0, 85.0, 85.0]);
        forecast.current_temperature = 70.0;
        let last = now() - Duration::minutes(10);

        // Current reading is the only in-range point, so the fold lands on now.
        let next = check(Some(&forecast), Some(last), &alarm());

        assert_eq!(next, last + Duration::minutes(15));
    }

    #[test]
    fn huge_intervals_saturate_instead_of_overflowing() {
        let config = SchedulerConfig {
            idle_interval_ms: u64::MAX,
            min_refresh_interval_ms: u64::MAX,
            ..SchedulerConfig::default()
        };
        let last = now() - Duration::hours(2);
        let next = next_check_date(None, Some(last), &AlarmConfig::default(), true, now(), &config);

        assert_eq!(next, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(900_000), Duration::minutes(15));
        assert_eq!(millis(u64::MAX), Duration::MAX);
    }
}
