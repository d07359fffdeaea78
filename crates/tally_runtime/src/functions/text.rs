use regex::Regex;

use super::{Args, FnContext, FunctionRegistry, to_i64, to_text};
use crate::errors::EvalError;
use crate::value::{Value, slice_positions};

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.builtin("str", str_);
    registry.builtin("upper", upper);
    registry.builtin("lower", lower);
    registry.builtin("contains", contains);
    registry.builtin("replace", replace);
    registry.builtin("substr", substr);
    registry.builtin("reg_search", reg_search);
    registry.builtin("reg_replace", reg_replace);
    registry.builtin("join", join);
    registry.builtin("split", split);
    registry.builtin("strip", strip);
    registry.builtin("reverse", reverse);
    registry.builtin("len", len);
}

fn str_(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Str(args.get(0, "a").map(to_text).unwrap_or_default()))
}

fn upper(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Str(to_text(args.require(0, "a")?).to_uppercase()))
}

fn lower(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Str(to_text(args.require(0, "a")?).to_lowercase()))
}

fn contains(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let haystack = to_text(args.require(0, "a")?);
    let needle = to_text(args.require(1, "b")?);
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn replace(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = str_arg(args, 0, "text")?;
    let old = to_text(args.require(1, "oldvalue")?);
    let new = to_text(args.require(2, "newvalue")?);
    Ok(Value::Str(text.replace(&old, &new)))
}

fn substr(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = str_arg(args, 0, "text")?;
    let start = args.opt(1, "start_index").map(to_i64).transpose()?;
    let end = args.opt(2, "end_index").map(to_i64).transpose()?;
    let chars: Vec<char> = text.chars().collect();
    let positions = slice_positions(chars.len(), start, end, None).unwrap_or_default();
    Ok(Value::Str(positions.into_iter().map(|i| chars[i]).collect()))
}

fn compile(pattern: &str) -> Result<Regex, EvalError> {
    Regex::new(pattern).map_err(|e| EvalError::invalid(format!("bad pattern '{}': {}", pattern, e)))
}

fn reg_search(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = str_arg(args, 0, "text")?;
    let re = compile(&str_arg(args, 1, "expression")?)?;
    re.find(&text)
        .map(|m| Value::Str(m.as_str().to_string()))
        .ok_or_else(|| EvalError::invalid(format!("pattern '{}' does not match", re.as_str())))
}

fn reg_replace(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = str_arg(args, 0, "text")?;
    let re = compile(&str_arg(args, 1, "expression")?)?;
    let replacement = backrefs_to_braces(&str_arg(args, 2, "replace_text")?);
    Ok(Value::Str(re.replace_all(&text, replacement.as_str()).into_owned()))
}

/// `\1` style group references become `${1}`; a bare `$` is escaped.
fn backrefs_to_braces(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut group = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    group.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{}}}", group));
            }
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}

fn join(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let items = args
        .require(0, "data")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("can only join an iterable"))?;
    let separator = str_arg(args, 1, "separator")?;
    let parts = items
        .iter()
        .map(|item| match item {
            Value::Str(s) => Ok(s.clone()),
            other => Err(EvalError::invalid(format!(
                "sequence item: expected str instance, {} found",
                other.type_name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Str(parts.join(&separator)))
}

fn split(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let text = str_arg(args, 0, "text")?;
    let delimiter = str_arg(args, 1, "delimeter")?;
    if delimiter.is_empty() {
        return Err(EvalError::invalid("empty separator"));
    }
    Ok(Value::List(text.split(delimiter.as_str()).map(Value::str).collect()))
}

fn strip(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Str(str_arg(args, 0, "data")?.trim().to_string()))
}

fn reverse(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    match args.require(0, "items")? {
        Value::Str(s) => Ok(Value::Str(s.chars().rev().collect())),
        Value::List(items) => Ok(Value::List(items.iter().rev().cloned().collect())),
        other => Err(EvalError::invalid(format!("cannot reverse {}", other.type_name()))),
    }
}

fn len(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let value = args.require(0, "a")?;
    value
        .len()
        .map(|n| Value::Int(n as i64))
        .ok_or_else(|| EvalError::invalid(format!("object of type '{}' has no len()", value.type_name())))
}

fn str_arg(args: &Args, index: usize, name: &str) -> Result<String, EvalError> {
    match args.require(index, name)? {
        Value::Str(s) => Ok(s.clone()),
        other => Err(EvalError::invalid(format!(
            "argument '{}' must be str, not {}",
            name,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalLimits;
    use chrono::NaiveDate;

    fn call(f: fn(&FnContext<'_>, &Args) -> Result<Value, EvalError>, args: Vec<Value>) -> Result<Value, EvalError> {
        let limits = EvalLimits::default();
        let ctx = FnContext {
            now: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            limits: &limits,
        };
        f(&ctx, &Args::positional(args))
    }

    #[test]
    fn test_substr_slices_by_characters() {
        let out = call(substr, vec![Value::str("ISIN-US0378"), Value::Int(5), Value::None]).unwrap();
        assert_eq!(out, Value::str("US0378"));
        let out = call(substr, vec![Value::str("abcdef"), Value::Int(-3), Value::Int(-1)]).unwrap();
        assert_eq!(out, Value::str("de"));
    }

    #[test]
    fn test_regex_helpers() {
        let out = call(reg_search, vec![Value::str("trade 2024-01-15"), Value::str(r"\d{4}")]).unwrap();
        assert_eq!(out, Value::str("2024"));
        assert!(call(reg_search, vec![Value::str("abc"), Value::str(r"\d")]).is_err());

        let out = call(
            reg_replace,
            vec![Value::str("2024-01-15"), Value::str(r"(\d+)-(\d+)-(\d+)"), Value::str(r"\3.\2.\1")],
        )
        .unwrap();
        assert_eq!(out, Value::str("15.01.2024"));
    }

    #[test]
    fn test_join_requires_strings() {
        let list = Value::List(vec![Value::str("a"), Value::str("b")]);
        assert_eq!(call(join, vec![list, Value::str("-")]).unwrap(), Value::str("a-b"));
        let mixed = Value::List(vec![Value::str("a"), Value::Int(1)]);
        assert!(call(join, vec![mixed, Value::str("-")]).is_err());
    }

    #[test]
    fn test_len_and_reverse() {
        assert_eq!(call(len, vec![Value::str("héllo")]).unwrap(), Value::Int(5));
        assert!(call(len, vec![Value::Int(3)]).is_err());
        assert_eq!(call(reverse, vec![Value::str("abc")]).unwrap(), Value::str("cba"));
    }
}
