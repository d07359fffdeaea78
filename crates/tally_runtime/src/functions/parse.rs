use chrono::{NaiveDate, NaiveDateTime};

use super::{Args, FnContext, FunctionRegistry, to_f64, to_i64, to_text};
use crate::errors::EvalError;
use crate::value::{Value, format_float};

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.builtin("parse_number", parse_number);
    registry.builtin("parse_bool", parse_bool);
    registry.builtin("parse_date", parse_date);
    registry.builtin("format_number", format_number);
    registry.builtin("to_json", to_json);
}

fn parse_number(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    match args.require(0, "a")? {
        v @ (Value::Int(_) | Value::Float(_)) => Ok(v.clone()),
        other => Ok(Value::Float(to_f64(other)?)),
    }
}

fn parse_bool(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Bool(args.get(0, "a").is_some_and(Value::truthy)))
}

fn strptime(text: &str, pattern: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, pattern)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(text, pattern).ok().map(|dt| dt.date()))
}

/// `parse_date(text, format=None)`; `format` may also be a list tried in order.
fn parse_date(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = match args.get(0, "date_string") {
        None => return Ok(Value::None),
        Some(v) if !v.truthy() => return Ok(Value::None),
        Some(Value::Date(d)) => return Ok(Value::Date(*d)),
        Some(v) => to_text(v),
    };
    match args.opt(1, "format") {
        Some(Value::List(patterns) | Value::Tuple(patterns)) => Ok(patterns
            .iter()
            .find_map(|p| strptime(&text, &to_text(p)))
            .map(Value::Date)
            .unwrap_or(Value::None)),
        format => {
            let pattern = format.map(to_text).filter(|p| !p.is_empty());
            let pattern = pattern.as_deref().unwrap_or("%Y-%m-%d");
            strptime(&text, pattern)
                .map(Value::Date)
                .ok_or_else(|| EvalError::invalid(format!("time data '{}' does not match format '{}'", text, pattern)))
        }
    }
}

/// Renders a number with explicit separators; decimals are cut, not rounded.
///
/// `format_number(number, decimal_sep=".", decimal_pos=None, grouping=3,
/// thousand_sep="", use_grouping=False)`
fn format_number(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let number = to_f64(args.require(0, "number")?)?;
    let decimal_sep = args.opt(1, "decimal_sep").map(to_text).unwrap_or_else(|| ".".into());
    let decimal_pos = args
        .opt(2, "decimal_pos")
        .map(to_i64)
        .transpose()?
        .map(|p| p.clamp(0, 64) as usize);
    let grouping = args.opt(3, "grouping").map(to_i64).transpose()?.unwrap_or(3);
    let thousand_sep = args.opt(4, "thousand_sep").map(to_text).unwrap_or_default();
    let use_grouping = args.get(5, "use_grouping").is_some_and(Value::truthy) && grouping > 0;

    if !number.is_finite() {
        return Ok(Value::Str(format_float(number)));
    }
    let mut text = format_float(number);
    if text.contains('e') {
        text = format!("{}", number);
    }
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest.to_string()),
        None => ("", text),
    };
    let (int_part, mut dec_part) = match digits.split_once('.') {
        Some((i, d)) => (i.to_string(), d.to_string()),
        None => (digits, String::new()),
    };
    if let Some(pos) = decimal_pos {
        dec_part.truncate(pos);
        while dec_part.len() < pos {
            dec_part.push('0');
        }
    }
    let int_part = if use_grouping {
        group_digits(&int_part, grouping as usize, &thousand_sep)
    } else {
        int_part
    };
    let dec_part = if dec_part.is_empty() {
        dec_part
    } else {
        format!("{}{}", decimal_sep, dec_part)
    };
    Ok(Value::Str(format!("{}{}{}", sign, int_part, dec_part)))
}

fn group_digits(digits: &str, size: usize, separator: &str) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut groups: Vec<String> = chars
        .rchunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect();
    groups.reverse();
    groups.join(separator)
}

fn to_json(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let value = args.require(0, "obj")?.to_json();
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(&value, &mut ser).map_err(|e| EvalError::invalid(e.to_string()))?;
    String::from_utf8(out)
        .map(Value::Str)
        .map_err(|e| EvalError::invalid(e.to_string()))
}
