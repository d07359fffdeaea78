use chrono::NaiveDate;

use super::dates::{shift_days, strftime};
use super::{Args, FnContext, FunctionRegistry, NativeKind, ScopeFn, to_date, to_f64, to_text};
use crate::errors::EvalError;
use crate::value::Value;

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.insert("print", NativeKind::Scope(ScopeFn::Print));
    registry.insert("globals", NativeKind::Scope(ScopeFn::Globals));
    registry.insert("locals", NativeKind::Scope(ScopeFn::Locals));
    registry.insert("has_var", NativeKind::Scope(ScopeFn::HasVar));
    registry.insert("get_var", NativeKind::Scope(ScopeFn::GetVar));

    registry.builtin("if_null", if_null);
    registry.builtin("find_name", find_name);
    registry.builtin("simple_group", simple_group);
    registry.builtin("date_group", date_group);
    registry.builtin("convert_to_number", convert_to_number);
}

fn if_null(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let input = args.get(0, "input").cloned().unwrap_or(Value::None);
    if input.truthy() {
        return Ok(input);
    }
    Ok(args.get(1, "default").cloned().unwrap_or(Value::None))
}

/// First argument that is not None, as text.
fn find_name(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Str(
        args.values()
            .iter()
            .find(|v| !v.is_none())
            .map(to_text)
            .unwrap_or_default(),
    ))
}

/// `simple_group(val, [(begin, end, text), ...], default=None)` with half-open `(begin, end]` ranges.
fn simple_group(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let value = to_f64(args.require(0, "val")?)?;
    let ranges = args
        .require(1, "ranges")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("ranges must be a list"))?;
    for range in ranges {
        let parts = range
            .iter_items()
            .filter(|p| p.len() == 3)
            .ok_or_else(|| EvalError::invalid("each range needs (begin, end, text)"))?;
        let begin = if parts[0].is_none() { f64::NEG_INFINITY } else { to_f64(&parts[0])? };
        let end = if parts[1].is_none() { f64::INFINITY } else { to_f64(&parts[1])? };
        if begin < value && value <= end {
            return Ok(parts[2].clone());
        }
    }
    Ok(args.get(2, "default").cloned().unwrap_or(Value::None))
}

/// Names the date bucket `val` falls in.
///
/// Each range is `(begin, end, step, fmt)`. A missing begin or end stands for
/// 1900-01-01 and 2100-12-31. With a step the range is cut into consecutive
/// buckets of `step` days (or a timedelta/relativedelta). A list format
/// `[prefix, begin_fmt, mid1, mid2, end_fmt, suffix]` renders the bucket
/// bounds; anything else is used as text.
fn date_group(ctx: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let value = to_date(args.require(0, "val")?)?;
    let ranges = args
        .require(1, "ranges")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("ranges must be a list"))?;
    let floor = NaiveDate::from_ymd_opt(1900, 1, 1).ok_or_else(|| EvalError::invalid("bad floor date"))?;
    let ceiling = NaiveDate::from_ymd_opt(2100, 12, 31).ok_or_else(|| EvalError::invalid("bad ceiling date"))?;

    for range in ranges {
        let parts = range
            .iter_items()
            .filter(|p| p.len() == 4)
            .ok_or_else(|| EvalError::invalid("each range needs (begin, end, step, fmt)"))?;
        let begin = if parts[0].truthy() { to_date(&parts[0])? } else { floor };
        let end = if parts[1].truthy() { to_date(&parts[1])? } else { ceiling };
        if !(begin <= value && value <= end) {
            continue;
        }
        if !parts[2].truthy() {
            return bucket_name(begin, end, &parts[3]);
        }
        let mut cursor = begin;
        let mut buckets = 0usize;
        while cursor < end {
            buckets += 1;
            if buckets > ctx.limits.max_len.saturating_mul(100) {
                return Err(EvalError::invalid("date_group produced too many buckets"));
            }
            let next = step_date(cursor, &parts[2])?;
            if next <= cursor {
                return Err(EvalError::invalid("date_group step must move forward"));
            }
            let bucket_end = shift_days(next, -1)?.min(end);
            if cursor <= value && value <= bucket_end {
                return bucket_name(cursor, bucket_end, &parts[3]);
            }
            cursor = next;
        }
    }
    Ok(args.get(2, "default").cloned().unwrap_or(Value::None))
}

fn step_date(date: NaiveDate, step: &Value) -> Result<NaiveDate, EvalError> {
    match step {
        Value::TimeDelta(days) => shift_days(date, *days),
        Value::RelDelta(delta) => delta
            .apply(date)
            .ok_or_else(|| EvalError::invalid("date value out of range")),
        other => shift_days(date, super::to_i64(other)?),
    }
}

fn bucket_name(begin: NaiveDate, end: NaiveDate, fmt: &Value) -> Result<Value, EvalError> {
    let parts = match fmt {
        Value::List(p) | Value::Tuple(p) => p,
        other => return Ok(Value::Str(to_text(other))),
    };
    let piece = |i: usize| parts.get(i).filter(|v| v.truthy()).map(to_text).unwrap_or_default();
    let begin_text = match piece(1) {
        f if f.is_empty() => String::new(),
        f => strftime(begin, &f)?,
    };
    let end_text = match piece(4) {
        f if f.is_empty() => String::new(),
        f => strftime(end, &f)?,
    };
    Ok(Value::Str(
        [piece(0), begin_text, piece(2), piece(3), end_text, piece(5)].concat(),
    ))
}

/// Reads localized number text such as `1.234,5` or `(12)`.
fn convert_to_number(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = to_text(args.require(0, "text_number")?);
    let thousand = args.opt(1, "thousand_separator").map(to_text).unwrap_or_default();
    let decimal = args
        .opt(2, "decimal_separator")
        .map(to_text)
        .unwrap_or_else(|| ".".to_string());
    let has_braces = args.get(3, "has_braces").is_some_and(Value::truthy);

    let mut result = if thousand.is_empty() { text } else { text.replace(&thousand, "") };
    if !decimal.is_empty() {
        result = result.replace(&decimal, ".");
    }
    if has_braces {
        result = format!("-{}", result.replace(['(', ')'], ""));
    }
    Ok(Value::Float(to_f64(&Value::Str(result))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalLimits;

    fn call(f: fn(&FnContext<'_>, &Args) -> Result<Value, EvalError>, args: Vec<Value>) -> Result<Value, EvalError> {
        let limits = EvalLimits::default();
        let ctx = FnContext {
            now: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            limits: &limits,
        };
        f(&ctx, &Args::positional(args))
    }

    fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items)
    }

    #[test]
    fn test_if_null_and_find_name() {
        assert_eq!(call(if_null, vec![Value::str(""), Value::str("n/a")]).unwrap(), Value::str("n/a"));
        assert_eq!(call(if_null, vec![Value::Int(3), Value::Int(0)]).unwrap(), Value::Int(3));
        assert_eq!(
            call(find_name, vec![Value::None, Value::Int(7), Value::str("x")]).unwrap(),
            Value::str("7")
        );
        assert_eq!(call(find_name, vec![Value::None]).unwrap(), Value::str(""));
    }

    #[test]
    fn test_simple_group_ranges() {
        let ranges = Value::List(vec![
            tuple(vec![Value::None, Value::Int(0), Value::str("negative")]),
            tuple(vec![Value::Int(0), Value::Int(100), Value::str("small")]),
        ]);
        assert_eq!(
            call(simple_group, vec![Value::Int(-4), ranges.clone()]).unwrap(),
            Value::str("negative")
        );
        assert_eq!(
            call(simple_group, vec![Value::Int(100), ranges.clone()]).unwrap(),
            Value::str("small")
        );
        assert_eq!(
            call(simple_group, vec![Value::Int(500), ranges, Value::str("big")]).unwrap(),
            Value::str("big")
        );
    }

    #[test]
    fn test_date_group_steps() {
        let fmt = Value::List(vec![
            Value::str("["),
            Value::str("%m-%d"),
            Value::str(".."),
            Value::None,
            Value::str("%m-%d"),
            Value::str("]"),
        ]);
        let ranges = Value::List(vec![tuple(vec![
            Value::str("2024-01-01"),
            Value::str("2024-01-31"),
            Value::Int(10),
            fmt,
        ])]);
        assert_eq!(
            call(date_group, vec![Value::str("2024-01-15"), ranges.clone()]).unwrap(),
            Value::str("[01-11..01-20]")
        );
        assert_eq!(
            call(date_group, vec![Value::str("2024-01-05"), ranges.clone()]).unwrap(),
            Value::str("[01-01..01-10]")
        );
        // The last day is outside every whole step, so the default applies.
        assert_eq!(
            call(date_group, vec![Value::str("2024-01-31"), ranges]).unwrap(),
            Value::None
        );
    }

    #[test]
    fn test_convert_to_number() {
        let out = call(
            convert_to_number,
            vec![Value::str("1.234,5"), Value::str("."), Value::str(",")],
        )
        .unwrap();
        assert_eq!(out, Value::Float(1234.5));
        let out = call(
            convert_to_number,
            vec![Value::str("(12)"), Value::str(""), Value::str("."), Value::Bool(true)],
        )
        .unwrap();
        assert_eq!(out, Value::Float(-12.0));
    }
}
