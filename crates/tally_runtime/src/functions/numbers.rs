use std::cmp::Ordering;

use super::{Args, FnContext, FunctionRegistry, to_f64, to_i64};
use crate::errors::EvalError;
use crate::value::Value;

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.builtin("int", int);
    registry.builtin("float", float);
    registry.builtin("bool", bool_);
    registry.builtin("round", round);
    registry.builtin("trunc", int);
    registry.builtin("abs", abs);
    registry.builtin("sign", sign);
    registry.builtin("isclose", isclose);
    registry.builtin("min", min);
    registry.builtin("max", max);
    registry.builtin("sum", sum);
    registry.builtin("weighted_sum", weighted_sum);
    registry.builtin("iff", iff);
    registry.builtin("range", range);
}

fn int(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Int(to_i64(args.require(0, "a")?)?))
}

fn float(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Float(to_f64(args.require(0, "a")?)?))
}

fn bool_(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    Ok(Value::Bool(args.get(0, "a").is_some_and(Value::truthy)))
}

/// Half-to-even rounding; without `ndigits` the result is an integer.
fn round(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let a = to_f64(args.require(0, "a")?)?;
    match args.opt(1, "ndigits") {
        None => {
            let r = a.round_ties_even();
            if !r.is_finite() || r.abs() >= 9.2e18 {
                return Err(EvalError::invalid("cannot convert float to integer"));
            }
            Ok(Value::Int(r as i64))
        }
        Some(n) => {
            let n = to_i64(n)?.clamp(-308, 308) as i32;
            let scale = 10f64.powi(n);
            let scaled = a * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(a));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
    }
}

fn abs(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    match args.require(0, "a")? {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| EvalError::invalid("integer overflow")),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::TimeDelta(d) => Ok(Value::TimeDelta(d.abs())),
        other => Ok(Value::Float(to_f64(other)?.abs())),
    }
}

fn sign(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    match args.require(0, "a")? {
        Value::Int(i) => Ok(Value::Int(i.signum())),
        other => {
            let f = to_f64(other)?;
            Ok(Value::Float(if f > 0.0 {
                1.0
            } else if f < 0.0 {
                -1.0
            } else {
                0.0
            }))
        }
    }
}

fn isclose(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let a = to_f64(args.require(0, "a")?)?;
    let b = to_f64(args.require(1, "b")?)?;
    let rel_tol = args.opt(2, "rel_tol").map(to_f64).transpose()?.unwrap_or(1e-9);
    let abs_tol = args.opt(3, "abs_tol").map(to_f64).transpose()?.unwrap_or(0.0);
    if a == b {
        return Ok(Value::Bool(true));
    }
    let diff = (a - b).abs();
    Ok(Value::Bool(diff <= (rel_tol * a.abs().max(b.abs())).max(abs_tol)))
}

/// Either one iterable argument or several scalar arguments.
fn candidates(args: &Args) -> Result<Vec<Value>, EvalError> {
    let values = args.values();
    let items = match values {
        [single] => single
            .iter_items()
            .ok_or_else(|| EvalError::invalid(format!("'{}' object is not iterable", single.type_name())))?,
        _ => values.to_vec(),
    };
    if items.is_empty() {
        return Err(EvalError::invalid("arg is an empty sequence"));
    }
    Ok(items)
}

fn extreme(args: &Args, wanted: Ordering) -> Result<Value, EvalError> {
    let mut items = candidates(args)?.into_iter();
    let mut best = items.next().unwrap_or(Value::None);
    for item in items {
        let ord = item.compare(&best).ok_or_else(|| {
            EvalError::invalid(format!(
                "'{}' not supported between '{}' and '{}'",
                if wanted == Ordering::Less { "<" } else { ">" },
                item.type_name(),
                best.type_name()
            ))
        })?;
        if ord == wanted {
            best = item;
        }
    }
    Ok(best)
}

fn min(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    extreme(args, Ordering::Less)
}

fn max(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    extreme(args, Ordering::Greater)
}

fn sum(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let items = args
        .require(0, "items")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("sum() needs an iterable"))?;
    let mut int_total: Option<i64> = match args.opt(1, "start") {
        None => Some(0),
        Some(Value::Int(i)) => Some(*i),
        Some(_) => None,
    };
    let mut float_total = args.opt(1, "start").map(to_f64).transpose()?.unwrap_or(0.0);
    for item in &items {
        int_total = match (int_total, item) {
            (Some(acc), Value::Int(i)) => acc.checked_add(*i),
            _ => None,
        };
        float_total += to_f64(item)?;
    }
    Ok(int_total.map(Value::Int).unwrap_or(Value::Float(float_total)))
}

fn weighted_sum(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let values = args
        .require(0, "values")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("weighted_sum() needs a list of values"))?;
    let weights = args
        .require(1, "weights")?
        .iter_items()
        .ok_or_else(|| EvalError::invalid("weighted_sum() needs a list of weights"))?;
    if values.len() != weights.len() {
        return Err(EvalError::invalid(format!(
            "weighted_sum() got {} values and {} weights",
            values.len(),
            weights.len()
        )));
    }
    let mut total = 0.0;
    for (v, w) in values.iter().zip(weights.iter()) {
        total += to_f64(v)? * to_f64(w)?;
    }
    Ok(Value::Float(total))
}

fn iff(_: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let test = args.require(0, "test")?;
    let picked = if test.truthy() {
        args.require(1, "a")?
    } else {
        args.require(2, "b")?
    };
    Ok(picked.clone())
}

fn range(ctx: &FnContext<'_>, args: &Args) -> Result<Value, EvalError> {
    let ints = args.values().iter().map(to_i64).collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(EvalError::invalid("range expected 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(EvalError::invalid("range() arg 3 must not be zero"));
    }
    let span = if step > 0 { stop.saturating_sub(start) } else { start.saturating_sub(stop) };
    let count = if span <= 0 { 0 } else { (span - 1) / step.saturating_abs() + 1 };
    let cap = (ctx.limits.max_len as i64).saturating_mul(100);
    if count > cap {
        return Err(EvalError::invalid(format!("range is too long, max is {}", cap)));
    }
    Ok(Value::List((0..count).map(|i| Value::Int(start + i * step)).collect()))
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
    fn test_round_is_half_even() {
        assert_eq!(call(round, vec![Value::Float(2.5)]).unwrap(), Value::Int(2));
        assert_eq!(call(round, vec![Value::Float(3.5)]).unwrap(), Value::Int(4));
        assert_eq!(call(round, vec![Value::Float(1.23456), Value::Int(2)]).unwrap(), Value::Float(1.23));
    }

    #[test]
    fn test_min_max_over_list_or_args() {
        let list = Value::List(vec![Value::Int(3), Value::Float(1.5), Value::Int(2)]);
        assert_eq!(call(min, vec![list.clone()]).unwrap(), Value::Float(1.5));
        assert_eq!(call(max, vec![list]).unwrap(), Value::Int(3));
        assert_eq!(call(max, vec![Value::Int(1), Value::Int(7)]).unwrap(), Value::Int(7));
        assert!(call(min, vec![Value::List(vec![])]).is_err());
        assert!(call(min, vec![Value::Int(1), Value::str("a")]).is_err());
    }

    #[test]
    fn test_sums() {
        let ints = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(call(sum, vec![ints]).unwrap(), Value::Int(3));
        let mixed = Value::List(vec![Value::Int(1), Value::Float(0.5)]);
        assert_eq!(call(sum, vec![mixed]).unwrap(), Value::Float(1.5));

        let values = Value::List(vec![Value::Float(10.0), Value::Float(20.0)]);
        let weights = Value::List(vec![Value::Float(0.25), Value::Float(0.75)]);
        assert_eq!(call(weighted_sum, vec![values, weights]).unwrap(), Value::Float(17.5));
    }

    #[test]
    fn test_isclose_tolerances() {
        assert_eq!(call(isclose, vec![Value::Float(1.0), Value::Float(1.0 + 1e-12)]).unwrap(), Value::Bool(true));
        assert_eq!(call(isclose, vec![Value::Float(1.0), Value::Float(1.1)]).unwrap(), Value::Bool(false));
        assert_eq!(
            call(isclose, vec![Value::Float(1.0), Value::Float(1.1), Value::Float(0.0), Value::Float(0.2)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_range_forms() {
        assert_eq!(
            call(range, vec![Value::Int(3)]).unwrap(),
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            call(range, vec![Value::Int(5), Value::Int(0), Value::Int(-2)]).unwrap(),
            Value::List(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
        assert!(call(range, vec![Value::Int(10_000_000)]).is_err());
    }
}
