use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Source of "now" for evaluations and bookings.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl FixedClock {
    pub fn at_date(date: NaiveDate) -> Self {
        Self(date.and_time(chrono::NaiveTime::MIN))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("unknown frequency '{0}'")]
    UnknownFrequency(String),
    #[error("date_from {from} must be less or equal date_to {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("date out of range")]
    OutOfRange,
}

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Moves day by day in the given direction until a business day is reached.
pub fn shift_to_business_day(mut date: NaiveDate, forward: bool) -> NaiveDate {
    let step = if forward { 1 } else { -1 };
    while !is_business_day(date) {
        date += Duration::days(step);
    }
    date
}

/// Returns `date` when it is a business day, else the preceding Friday.
pub fn rollback_business_day(date: NaiveDate) -> NaiveDate {
    shift_to_business_day(date, false)
}

/// Adds whole weeks for each five workdays plus the remainder in calendar days.
/// A result on a weekend moves to the following Monday when `only_workdays` is set.
pub fn add_workdays(date: NaiveDate, workdays: i64, only_workdays: bool) -> NaiveDate {
    let weeks = workdays.div_euclid(5);
    let days = workdays.rem_euclid(5);
    let date = date + Duration::weeks(weeks) + Duration::days(days);
    if !only_workdays {
        return date;
    }
    match date.weekday() {
        Weekday::Sat => date + Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Adds calendar months, clamping the day to the length of the target month.
pub fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let idx = month_index(date) + months;
    let (year, month) = from_month_index(idx);
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn quarter(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

/// Every calendar day from `from` to `to`, both inclusive.
pub fn dates_between(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, CalendarError> {
    if from > to {
        return Err(CalendarError::InvalidRange { from, to });
    }
    Ok(from.iter_days().take_while(|d| *d <= to).collect())
}

pub fn last_week_end_business(date: NaiveDate) -> NaiveDate {
    let since_sunday = date.weekday().num_days_from_sunday() as i64;
    rollback_business_day(date - Duration::days(since_sunday))
}

pub fn last_month_end_business(date: NaiveDate) -> NaiveDate {
    business_period_end_rollback(date, 1)
}

pub fn last_quarter_end_business(date: NaiveDate) -> NaiveDate {
    business_period_end_rollback(date, 3)
}

pub fn last_year_end_business(date: NaiveDate) -> NaiveDate {
    business_period_end_rollback(date, 12)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

fn from_month_index(idx: i64) -> (i32, u32) {
    (idx.div_euclid(12) as i32, idx.rem_euclid(12) as u32 + 1)
}

fn first_of(idx: i64) -> Option<NaiveDate> {
    let (y, m) = from_month_index(idx);
    NaiveDate::from_ymd_opt(y, m, 1)
}

fn last_of(idx: i64) -> Option<NaiveDate> {
    let (y, m) = from_month_index(idx);
    NaiveDate::from_ymd_opt(y, m, days_in_month(y, m))
}

/// Latest month index `<= idx` that closes a period of `period` months.
fn period_end_month(idx: i64, period: i64) -> i64 {
    idx - (idx + 1).rem_euclid(period)
}

fn business_period_end_rollback(date: NaiveDate, period: i64) -> NaiveDate {
    let mut idx = period_end_month(month_index(date), period);
    loop {
        match last_of(idx).map(rollback_business_day) {
            Some(end) if end <= date => return end,
            Some(_) => idx -= period,
            None => return date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    Custom,
}

impl FromStr for Frequency {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "D" => Ok(Frequency::Daily),
            "W" => Ok(Frequency::Weekly),
            "M" => Ok(Frequency::Monthly),
            "Q" => Ok(Frequency::Quarterly),
            "Y" => Ok(Frequency::Yearly),
            "C" => Ok(Frequency::Custom),
            other => Err(CalendarError::UnknownFrequency(other.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Frequency::Daily => "D",
            Frequency::Weekly => "W",
            Frequency::Monthly => "M",
            Frequency::Quarterly => "Q",
            Frequency::Yearly => "Y",
            Frequency::Custom => "C",
        };
        f.write_str(s)
    }
}

/// Steps `n` anchors of a month-based period from `date`.
///
/// Anchors are either the first (`end == false`) or the last day of every
/// `period`-th month. A date already on an anchor moves a full `n` periods; any
/// other date counts its first roll to the neighbouring anchor as one step.
fn step_anchors(date: NaiveDate, n: i64, period: i64, end: bool) -> Option<NaiveDate> {
    let idx = month_index(date);
    let anchor_of = |i: i64| if end { last_of(i) } else { first_of(i) };

    let mut base = if end {
        period_end_month(idx, period)
    } else {
        idx - idx.rem_euclid(period)
    };
    if anchor_of(base)? > date {
        base -= period;
    }
    let on_anchor = anchor_of(base)? == date;

    let steps = match n {
        0 if on_anchor => 0,
        0 => 1,
        n if n > 0 => n,
        n if on_anchor => n,
        n => n + 1,
    };
    anchor_of(base + steps * period)
}

/// Start or end of the period `shift` periods away from `date`.
///
/// Weekly periods first move to the Monday of the week (start) or six days
/// ahead (end, unless already a Sunday). With `only_business_days` the result
/// is moved forward for starts and back for ends until it is a business day.
pub fn calculate_period_date(
    date: NaiveDate,
    frequency: Frequency,
    shift: i64,
    only_business_days: bool,
    start: bool,
) -> Result<NaiveDate, CalendarError> {
    let shifted = match frequency {
        Frequency::Custom => return Ok(date),
        Frequency::Daily => date.checked_add_signed(Duration::days(shift)),
        Frequency::Weekly => {
            let anchored = if start {
                let back = match date.weekday().num_days_from_monday() {
                    0 => 7,
                    n => n as i64,
                };
                date - Duration::days(back)
            } else if date.weekday() == Weekday::Sun {
                date
            } else {
                date + Duration::days(6)
            };
            anchored.checked_add_signed(Duration::weeks(shift))
        }
        Frequency::Monthly => step_anchors(date, shift, 1, !start),
        Frequency::Quarterly => step_anchors(date, shift, 3, !start),
        Frequency::Yearly => step_anchors(date, shift, 12, !start),
    };
    let shifted = shifted.ok_or(CalendarError::OutOfRange)?;

    if only_business_days && !is_business_day(shifted) {
        return Ok(shift_to_business_day(shifted, start));
    }
    Ok(shifted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn period(date: &str, freq: &str, shift: i64, bday: bool, start: bool) -> String {
        calculate_period_date(d(date), freq.parse().unwrap(), shift, bday, start)
            .unwrap()
            .format("%Y-%m-%d")
            .to_string()
    }

    #[test]
    fn test_calculate_period_date() {
        assert_eq!(period("2024-12-01", "M", -3, false, false), "2024-09-30");
        assert_eq!(period("2024-12-01", "M", 3, true, true), "2025-03-03");
        assert_eq!(period("2024-09-01", "W", 2, false, true), "2024-09-09");
        assert_eq!(period("2024-09-01", "W", 2, true, false), "2024-09-13");
        assert_eq!(period("2024-12-01", "Y", -1, false, false), "2023-12-31");
        assert_eq!(period("2024-09-04", "D", 3, true, true), "2024-09-09");
        assert_eq!(period("2024-01-01", "Q", 1, false, true), "2024-04-01");
        assert_eq!(period("2024-01-01", "Q", 2, false, false), "2024-06-30");
        assert_eq!(period("2024-01-01", "D", 1, false, false), "2024-01-02");
        assert_eq!(period("2024-05-17", "C", 4, true, true), "2024-05-17");
    }

    #[test]
    fn test_unknown_frequency() {
        assert_eq!(
            "X".parse::<Frequency>(),
            Err(CalendarError::UnknownFrequency("X".into()))
        );
    }

    #[test]
    fn test_add_workdays() {
        // Friday + 1 workday lands on Saturday and moves to Monday.
        assert_eq!(add_workdays(d("2024-01-05"), 1, true), d("2024-01-08"));
        assert_eq!(add_workdays(d("2024-01-05"), 1, false), d("2024-01-06"));
        assert_eq!(add_workdays(d("2024-01-01"), 5, true), d("2024-01-08"));
    }

    #[test]
    fn test_business_rollbacks() {
        assert_eq!(rollback_business_day(d("2024-06-16")), d("2024-06-14"));
        assert_eq!(rollback_business_day(d("2024-06-12")), d("2024-06-12"));
        assert_eq!(last_week_end_business(d("2024-06-12")), d("2024-06-07"));
        assert_eq!(last_month_end_business(d("2024-06-15")), d("2024-05-31"));
        assert_eq!(last_month_end_business(d("2024-06-29")), d("2024-06-28"));
        assert_eq!(last_quarter_end_business(d("2024-05-10")), d("2024-03-29"));
        assert_eq!(last_year_end_business(d("2024-05-10")), d("2023-12-29"));
    }

    #[test]
    fn test_add_months_clamps() {
        assert_eq!(add_months(d("2024-01-31"), 1), Some(d("2024-02-29")));
        assert_eq!(add_months(d("2024-03-31"), -13), Some(d("2023-02-28")));
    }

    #[test]
    fn test_dates_between() {
        assert_eq!(dates_between(d("2024-01-01"), d("2024-01-03")).unwrap().len(), 3);
        assert!(dates_between(d("2024-01-03"), d("2024-01-01")).is_err());
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::at_date(d("2024-01-15"));
        assert_eq!(clock.today(), d("2024-01-15"));
    }
}
