//! Interval policies and advancing a template's next run.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::error::{BillingError, Result};
use crate::models::IntervalPolicy;

/// Upper bound on periods skipped in one advance.
const MAX_CATCH_UP_STEPS: usize = 10_000;

pub fn validate_policy(policy: &IntervalPolicy) -> Result<()> {
    let valid = match *policy {
        IntervalPolicy::Weekly { weekday } => (1..=7).contains(&weekday),
        IntervalPolicy::Monthly { day } | IntervalPolicy::Quarterly { day } => (1..=31).contains(&day),
        IntervalPolicy::Yearly { month, day } => (1..=12).contains(&month) && (1..=31).contains(&day),
    };
    if valid {
        Ok(())
    } else {
        Err(BillingError::validation(format!("invalid interval policy {policy:?}")))
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// The anchor day in the given month, clamped to the month's last day.
fn anchored(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)))
        .ok_or_else(|| BillingError::validation(format!("no date for {year}-{month}-{day}")))
}

fn months_later(date: NaiveDate, months: u32, day: u32) -> Result<NaiveDate> {
    let index = date.year() * 12 + date.month0() as i32 + months as i32;
    anchored(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, day)
}

/// The anchor in `date`'s own month when it is still ahead, else the one `months` later.
fn next_anchor(date: NaiveDate, months: u32, day: u32) -> Result<NaiveDate> {
    let this_month = anchored(date.year(), date.month(), day)?;
    if this_month > date {
        Ok(this_month)
    } else {
        months_later(date, months, day)
    }
}

/// The first occurrence of `policy` strictly after `from`'s date, at `from`'s time of day.
pub fn step(policy: &IntervalPolicy, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    validate_policy(policy)?;
    let date = from.date_naive();
    let next = match *policy {
        IntervalPolicy::Weekly { weekday } => {
            let current = date.weekday().number_from_monday();
            let ahead = (weekday + 7 - current) % 7;
            let ahead = if ahead == 0 { 7 } else { ahead };
            date + chrono::Duration::days(ahead as i64)
        }
        IntervalPolicy::Monthly { day } => next_anchor(date, 1, day)?,
        IntervalPolicy::Quarterly { day } => next_anchor(date, 3, day)?,
        IntervalPolicy::Yearly { month, day } => {
            let this_year = anchored(date.year(), month, day)?;
            if this_year > date {
                this_year
            } else {
                anchored(date.year() + 1, month, day)?
            }
        }
    };
    Ok(next.and_time(from.time()).and_utc())
}

/// Advances `current` by whole periods until it lies after `now`.
///
/// Missed periods are skipped rather than replayed.
pub fn next_run_after(
    policy: &IntervalPolicy,
    current: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let mut next = step(policy, current)?;
    for _ in 0..MAX_CATCH_UP_STEPS {
        if next > now {
            return Ok(next);
        }
        next = step(policy, next)?;
    }
    Err(BillingError::validation(format!(
        "schedule {policy:?} is more than {MAX_CATCH_UP_STEPS} periods behind"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 6, 30, 0).unwrap()
    }

    #[test]
    fn monthly_keeps_anchor_day_and_clamps() {
        let policy = IntervalPolicy::Monthly { day: 31 };
        let feb = step(&policy, at(2026, 1, 31)).unwrap();
        assert_eq!(feb, at(2026, 2, 28));
        assert_eq!(step(&policy, feb).unwrap(), at(2026, 3, 31));
        assert_eq!(step(&policy, at(2026, 12, 31)).unwrap(), at(2027, 1, 31));
    }

    #[test]
    fn leap_years_clamp_to_the_29th() {
        let policy = IntervalPolicy::Monthly { day: 30 };
        assert_eq!(step(&policy, at(2028, 1, 30)).unwrap(), at(2028, 2, 29));
    }

    #[test]
    fn weekly_moves_to_next_matching_weekday() {
        // 2026-10-16 is a Friday.
        let monday = IntervalPolicy::Weekly { weekday: 1 };
        assert_eq!(step(&monday, at(2026, 10, 16)).unwrap(), at(2026, 10, 19));
        let friday = IntervalPolicy::Weekly { weekday: 5 };
        assert_eq!(step(&friday, at(2026, 10, 16)).unwrap(), at(2026, 10, 23));
    }

    #[test]
    fn quarterly_and_yearly() {
        let quarterly = IntervalPolicy::Quarterly { day: 15 };
        assert_eq!(step(&quarterly, at(2026, 11, 15)).unwrap(), at(2027, 2, 15));

        let yearly = IntervalPolicy::Yearly { month: 3, day: 1 };
        assert_eq!(step(&yearly, at(2026, 1, 10)).unwrap(), at(2026, 3, 1));
        assert_eq!(step(&yearly, at(2026, 3, 1)).unwrap(), at(2027, 3, 1));
    }

    #[test]
    fn anchor_later_in_the_same_month_comes_first() {
        let monthly = IntervalPolicy::Monthly { day: 16 };
        assert_eq!(step(&monthly, at(2026, 10, 5)).unwrap(), at(2026, 10, 16));
        assert_eq!(step(&monthly, at(2026, 10, 16)).unwrap(), at(2026, 11, 16));

        let quarterly = IntervalPolicy::Quarterly { day: 20 };
        assert_eq!(step(&quarterly, at(2026, 10, 5)).unwrap(), at(2026, 10, 20));
        assert_eq!(step(&quarterly, at(2026, 10, 20)).unwrap(), at(2027, 1, 20));

        let end_of_month = IntervalPolicy::Monthly { day: 31 };
        assert_eq!(step(&end_of_month, at(2026, 2, 10)).unwrap(), at(2026, 2, 28));
    }

    #[test]
    fn catch_up_from_before_the_anchor_day() {
        let policy = IntervalPolicy::Monthly { day: 16 };
        let next = next_run_after(&policy, at(2026, 10, 5), at(2026, 10, 10)).unwrap();
        assert_eq!(next, at(2026, 10, 16));
    }

    #[test]
    fn catch_up_skips_missed_periods() {
        let policy = IntervalPolicy::Monthly { day: 1 };
        let next = next_run_after(&policy, at(2026, 1, 1), at(2026, 5, 10)).unwrap();
        assert_eq!(next, at(2026, 6, 1));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(validate_policy(&IntervalPolicy::Weekly { weekday: 0 }).is_err());
        assert!(validate_policy(&IntervalPolicy::Monthly { day: 32 }).is_err());
        assert!(validate_policy(&IntervalPolicy::Yearly { month: 13, day: 1 }).is_err());
        assert!(step(&IntervalPolicy::Quarterly { day: 0 }, at(2026, 1, 1)).is_err());
    }
}
