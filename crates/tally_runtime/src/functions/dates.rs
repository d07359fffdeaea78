use chrono::{DateTime, Datelike, Duration, NaiveDate};
use std::fmt::Write;
use tally_common::time::{
    self, CalendarError, Frequency, add_workdays, dates_between, is_leap_year, last_month_end_business,
    last_quarter_end_business, last_week_end_business, last_year_end_business, rollback_business_day,
};

use super::{Args, FnContext, FunctionRegistry, to_date, to_f64, to_i64, to_text};
use crate::errors::EvalError;
use crate::value::{RelativeDelta, Value};

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.builtin("now", now);
    registry.builtin("date", date);
    registry.builtin("date_min", date_min);
    registry.builtin("date_max", date_max);
    registry.builtin("isleap", isleap);
    registry.builtin("days", days);
    registry.builtin("weeks", weeks);
    registry.builtin("months", months);
    registry.builtin("timedelta", relative_delta);
    registry.builtin("relative_delta", relative_delta);
    registry.builtin("add_days", add_days);
    registry.builtin("add_weeks", add_weeks);
    registry.builtin("add_workdays", add_workdays_);
    registry.builtin("days_diff", days_diff);
    registry.builtin("format_date", format_date);
    registry.builtin("get_list_of_dates_between_two_dates", list_of_dates);
    registry.builtin("get_quarter", get_quarter);
    registry.builtin("get_year", get_year);
    registry.builtin("get_month", get_month);
    registry.builtin("unix_to_date", unix_to_date);
    registry.builtin("last_business_day", last_business_day);
    registry.builtin("get_date_last_week_end_business", last_week_end);
    registry.builtin("get_date_last_month_end_business", last_month_end);
    registry.builtin("get_date_last_quarter_end_business", last_quarter_end);
    registry.builtin("get_date_last_year_end_business", last_year_end);
    registry.builtin("calculate_period_date", calculate_period_date);
    registry.builtin("simple_price", simple_price);
    registry.builtin("day_count_fraction", day_count_fraction);
}

const ISO: &str = "%Y-%m-%d";

/// Largest day shift accepted by the date helpers, roughly 2700 years.
const MAX_DAY_SHIFT: i64 = 1_000_000;

fn calendar(err: CalendarError) -> EvalError {
    EvalError::invalid(err.to_string())
}

fn out_of_range() -> EvalError {
    EvalError::invalid("date value out of range")
}

pub(crate) fn shift_days(date: NaiveDate, days: i64) -> Result<NaiveDate, EvalError> {
    if days.abs() > MAX_DAY_SHIFT {
        return Err(out_of_range());
    }
    Duration::try_days(days)
        .and_then(|d| date.checked_add_signed(d))
        .ok_or_else(out_of_range)
}

/// Formats with a strftime pattern, rejecting patterns chrono cannot render.
pub(crate) fn strftime(date: NaiveDate, pattern: &str) -> Result<String, EvalError> {
    let mut out = String::new();
    write!(out, "{}", date.format(pattern))
        .map_err(|_| EvalError::invalid(format!("invalid date format '{}'", pattern)))?;
    Ok(out)
}

fn now(ctx: &FnContext<'_>, _: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(ctx.now.date()))
}

fn date(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let year = to_i64(args.require(0, "year")?)?;
    let month = args.opt(1, "month").map(to_i64).transpose()?.unwrap_or(1);
    let day = args.opt(2, "day").map(to_i64).transpose()?.unwrap_or(1);
    let built = match (i32::try_from(year), u32::try_from(month), u32::try_from(day)) {
        (Ok(y), Ok(m), Ok(d)) if (1..=9999).contains(&y) => NaiveDate::from_ymd_opt(y, m, d),
        _ => None,
    };
    built
        .map(Value::Date)
        .ok_or_else(|| EvalError::invalid(format!("invalid date {}-{}-{}", year, month, day)))
}

fn date_min(_: &FnContext<'_>, _: &Args) -> Result<Value, EvalError> {
    NaiveDate::from_ymd_opt(1, 1, 1).map(Value::Date).ok_or_else(out_of_range)
}

fn date_max(_: &FnContext<'_>, _: &Args) -> Result<Value, EvalError> {
    NaiveDate::from_ymd_opt(9999, 12, 31).map(Value::Date).ok_or_else(out_of_range)
}

fn isleap(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let year = match args.require(0, "date_or_year")? {
        Value::Date(d) => d.year(),
        other => i32::try_from(to_i64(other)?).map_err(|_| out_of_range())?,
    };
    Ok(Value::Bool(is_leap_year(year)))
}

fn days(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::TimeDelta(to_i64(args.require(0, "days")?)?))
}

fn weeks(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let weeks = to_i64(args.require(0, "weeks")?)?;
    weeks
        .checked_mul(7)
        .map(Value::TimeDelta)
        .ok_or_else(out_of_range)
}

fn months(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let months = to_i64(args.require(0, "months")?)?;
    Ok(Value::RelDelta(RelativeDelta::new(0, months, 0)))
}

fn bounded<T: TryFrom<i64>>(args: &Args, index: usize, name: &str, range: std::ops::RangeInclusive<i64>) -> Result<Option<T>, EvalError> {
    match args.opt(index, name) {
        None => Ok(None),
        Some(v) => {
            let n = to_i64(v)?;
            if !range.contains(&n) {
                return Err(EvalError::invalid(format!("{} must be in {}..{}", name, range.start(), range.end())));
            }
            T::try_from(n)
                .map(Some)
                .map_err(|_| EvalError::invalid(format!("{} is out of range", name)))
        }
    }
}

/// `relative_delta(years, months, days, leapdays, weeks, year, month, day, weekday)`.
fn relative_delta(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let rel = |index: usize, name: &str| -> Result<i64, EvalError> {
        args.opt(index, name).map(to_i64).transpose().map(|v| v.unwrap_or(0))
    };
    let weeks = rel(4, "weeks")?;
    let delta = RelativeDelta {
        years: rel(0, "years")?,
        months: rel(1, "months")?,
        days: rel(2, "days")?.saturating_add(weeks.saturating_mul(7)),
        leapdays: rel(3, "leapdays")?,
        year: bounded(args, 5, "year", 1..=9999)?,
        month: bounded(args, 6, "month", 1..=12)?,
        day: bounded(args, 7, "day", 1..=31)?,
        weekday: bounded(args, 8, "weekday", 0..=6)?,
    };
    Ok(Value::RelDelta(delta.normalized()))
}

fn add_days(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let days = match args.require(1, "days")? {
        Value::TimeDelta(d) => *d,
        other => to_i64(other)?,
    };
    shift_days(date, days).map(Value::Date)
}

fn add_weeks(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let days = match args.require(1, "weeks")? {
        Value::TimeDelta(d) => *d,
        other => to_i64(other)?.checked_mul(7).ok_or_else(out_of_range)?,
    };
    shift_days(date, days).map(Value::Date)
}

fn add_workdays_(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let workdays = to_i64(args.require(1, "workdays")?)?;
    if workdays.abs() > MAX_DAY_SHIFT {
        return Err(out_of_range());
    }
    let only_workdays = args.get(2, "only_workdays").is_none_or(Value::truthy);
    let shifted = add_workdays(date, workdays, only_workdays);
    if shifted.year() > 9999 || shifted.year() < 1 {
        return Err(out_of_range());
    }
    Ok(Value::Date(shifted))
}

fn days_diff(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let first = to_date(args.require(0, "date_1")?)?;
    let second = to_date(args.require(1, "date_2")?)?;
    Ok(Value::Int((second - first).num_days()))
}

fn format_date(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let pattern = args.opt(1, "format_").map(to_text).filter(|p| !p.is_empty());
    strftime(date, pattern.as_deref().unwrap_or(ISO)).map(Value::Str)
}

fn list_of_dates(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let from = args
        .opt(0, "date_from")
        .ok_or_else(|| EvalError::invalid("Both parameters 'date_from' & 'date_to' must be set"))?;
    let to = args
        .opt(1, "date_to")
        .ok_or_else(|| EvalError::invalid("Both parameters 'date_from' & 'date_to' must be set"))?;
    let (from, to) = (to_date(from)?, to_date(to)?);
    if (to - from).num_days() > MAX_DAY_SHIFT {
        return Err(out_of_range());
    }
    let dates = dates_between(from, to).map_err(calendar)?;
    Ok(Value::List(dates.into_iter().map(Value::Date).collect()))
}

fn get_quarter(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Int(time::quarter(to_date(args.require(0, "date")?)?) as i64))
}

fn get_year(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Int(to_date(args.require(0, "date")?)?.year() as i64))
}

fn get_month(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Int(to_date(args.require(0, "date")?)?.month() as i64))
}

/// Seconds since the epoch rendered as a UTC date string.
fn unix_to_date(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let unix = match args.get(0, "unix") {
        None => return Ok(Value::None),
        Some(v) if !v.truthy() => return Ok(Value::None),
        Some(Value::Date(d)) => return Ok(Value::Date(*d)),
        Some(v) => to_i64(v)?,
    };
    let moment = DateTime::from_timestamp(unix, 0).ok_or_else(out_of_range)?;
    let pattern = args.opt(1, "format_").map(to_text).filter(|p| !p.is_empty());
    strftime(moment.date_naive(), pattern.as_deref().unwrap_or(ISO)).map(Value::Str)
}

fn last_business_day(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(rollback_business_day(to_date(args.require(0, "date")?)?)))
}

fn last_week_end(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(last_week_end_business(to_date(args.require(0, "date")?)?)))
}

fn last_month_end(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(last_month_end_business(to_date(args.require(0, "date")?)?)))
}

fn last_quarter_end(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(last_quarter_end_business(to_date(args.require(0, "date")?)?)))
}

fn last_year_end(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Date(last_year_end_business(to_date(args.require(0, "date")?)?)))
}

/// `calculate_period_date(date, frequency, shift, is_only_bday=False, start=False)`, as ISO text.
fn calculate_period_date(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let frequency: Frequency = to_text(args.require(1, "frequency")?).parse().map_err(calendar)?;
    let shift = to_i64(args.require(2, "shift")?)?;
    if shift.abs() > MAX_DAY_SHIFT {
        return Err(out_of_range());
    }
    let only_business_days = args.get(3, "is_only_bday").is_some_and(Value::truthy);
    let start = args.get(4, "start").is_some_and(Value::truthy);
    let result = time::calculate_period_date(date, frequency, shift, only_business_days, start).map_err(calendar)?;
    strftime(result, ISO).map(Value::Str)
}

/// Linear interpolation between two dated values; zero outside the range.
fn simple_price(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let date = to_date(args.require(0, "date")?)?;
    let date1 = to_date(args.require(1, "date1")?)?;
    let value1 = to_f64(args.require(2, "value1")?)?;
    let date2 = to_date(args.require(3, "date2")?)?;
    let value2 = to_f64(args.require(4, "value2")?)?;
    if date1 <= date && date <= date2 {
        let span = (date2 - date1).num_days();
        if span == 0 {
            return Err(EvalError::invalid("float division by zero"));
        }
        let d = (date - date1).num_days() as f64 / span as f64;
        return Ok(Value::Float(value1 + d * (value2 - value1)));
    }
    Ok(Value::Float(0.0))
}

/// Year fraction between two dates under a day-count convention.
fn day_count_fraction(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let start = to_date(args.require(0, "start")?)?;
    let end = to_date(args.require(1, "end")?)?;
    let convention = args
        .opt(2, "convention")
        .map(to_text)
        .unwrap_or_else(|| "ACT/365".to_string());
    let actual = (end - start).num_days() as f64;
    let fraction = match convention.to_uppercase().as_str() {
        "ACT/360" => actual / 360.0,
        "ACT/365" => actual / 365.0,
        "30/360" => thirty_360(start, end) / 360.0,
        "ACT/ACT" => act_act(start, end),
        other => return Err(EvalError::invalid(format!("unknown day count convention '{}'", other))),
    };
    Ok(Value::Float(fraction))
}

fn thirty_360(start: NaiveDate, end: NaiveDate) -> f64 {
    let d1 = start.day().min(30);
    let d2 = if end.day() == 31 && d1 == 30 { 30 } else { end.day() };
    let years = (end.year() - start.year()) as f64;
    let months = end.month() as f64 - start.month() as f64;
    360.0 * years + 30.0 * months + (d2 as f64 - d1 as f64)
}

/// ISDA actual/actual: each calendar year's days over that year's length.
fn act_act(start: NaiveDate, end: NaiveDate) -> f64 {
    if end < start {
        return -act_act(end, start);
    }
    let mut total = 0.0;
    let mut cursor = start;
    while cursor < end {
        let next_year = NaiveDate::from_ymd_opt(cursor.year() + 1, 1, 1).unwrap_or(end);
        let segment_end = next_year.min(end);
        let year_len = if is_leap_year(cursor.year()) { 366.0 } else { 365.0 };
        total += (segment_end - cursor).num_days() as f64 / year_len;
        cursor = segment_end;
    }
    total
}
