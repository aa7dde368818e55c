//! Daily trigger for the processor loop.

use chrono::{DateTime, Duration, NaiveTime, TimeZone};

/// Next instant strictly after `now` whose wall-clock time is `at`.
/// Falls back to 24 h from `now` when `at` does not exist that day (DST gap).
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive().and_time(at).and_local_timezone(tz.clone()).earliest();
    match today {
        Some(t) if t > *now => t,
        _ => (now.date_naive() + Duration::days(1))
            .and_time(at)
            .and_local_timezone(tz)
            .earliest()
            .unwrap_or_else(|| now.clone() + Duration::hours(24)),
    }
}

/// Wall-clock time to wait until `next`, zero if it has passed.
pub fn delay_until<Tz: TimeZone>(now: &DateTime<Tz>, next: &DateTime<Tz>) -> std::time::Duration {
    (next.clone() - now.clone()).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 1, 30, 0).unwrap();
        let next = next_run_after(&now, at(2, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap());
        assert_eq!(delay_until(&now, &next), std::time::Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 2, 0, 0).unwrap();
        let next = next_run_after(&now, at(2, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_past_target_has_no_delay() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap();
        let past = Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap();
        assert_eq!(delay_until(&now, &past), std::time::Duration::ZERO);
    }
}
