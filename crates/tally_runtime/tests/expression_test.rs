use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use tally_runtime::{EvalError, Value, eval};

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 15)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

async fn run(expr: &str) -> Result<Value, EvalError> {
    eval(expr, BTreeMap::new(), now()).await
}

async fn run_with(expr: &str, names: &[(&str, Value)]) -> Result<Value, EvalError> {
    let names = names.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    eval(expr, names, now()).await
}

#[tokio::test]
async fn test_same_inputs_same_value() {
    let expr = "d = date(2024, 2, 29) + relative_delta(years=1)\n[str(d), now(), round(10 / 3, 4)]";
    let first = run(expr).await.unwrap();
    for _ in 0..3 {
        assert_eq!(run(expr).await.unwrap(), first);
    }
}

#[tokio::test]
async fn test_bounds_are_enforced() {
    assert!(matches!(run("2 ** 10001").await, Err(EvalError::InvalidExpression(_))));
    assert!(matches!(run("10001 ** 2").await, Err(EvalError::InvalidExpression(_))));
    assert!(matches!(run("1 << 11").await, Err(EvalError::InvalidExpression(_))));
    assert_eq!(run("1 << 10").await.unwrap(), Value::Int(1024));

    let long = Value::Str("x".repeat(15_000));
    assert!(matches!(
        run_with("s + s", &[("s", long.clone())]).await,
        Err(EvalError::InvalidExpression(_))
    ));
    assert!(run_with("len(s + 'y')", &[("s", long)]).await.is_ok());

    let items = Value::List(vec![Value::Int(0); 600]);
    assert!(matches!(
        run_with("l + l", &[("l", items)]).await,
        Err(EvalError::InvalidExpression(_))
    ));
    assert!(run("'ab' * 3").await.is_err());
}

#[tokio::test]
async fn test_bool_operators_short_circuit() {
    assert_eq!(run("False and missing_function(1)").await.unwrap(), Value::Bool(false));
    assert_eq!(run("True or missing_function(1)").await.unwrap(), Value::Bool(true));
    assert_eq!(run("0 or 'fallback'").await.unwrap(), Value::Str("fallback".into()));
    assert_eq!(run("'' and missing_name").await.unwrap(), Value::Str(String::new()));
    assert!(matches!(
        run("True and missing_function(1)").await,
        Err(EvalError::FunctionNotDefined(_) | EvalError::NameNotDefined(_))
    ));
}

#[tokio::test]
async fn test_function_calls_do_not_leak_names() {
    let src = "total = 1\ndef bump(n):\n    total = n * 10\n    inner = True\n    return total\nresult = bump(5)\n[total, result]";
    assert_eq!(
        run(src).await.unwrap(),
        Value::List(vec![Value::Int(1), Value::Int(50)])
    );
    let leaked = run("def f():\n    hidden = 1\n    return hidden\nf()\nhidden").await;
    assert!(matches!(leaked, Err(EvalError::NameNotDefined(ref n)) if n == "hidden"));
}

#[tokio::test]
async fn test_missing_keys_and_indexes_yield_none() {
    assert_eq!(run("{'a': 1}['b']").await.unwrap(), Value::None);
    assert_eq!(run("[1, 2][5]").await.unwrap(), Value::None);
    assert_eq!(run("[1, 2][-1]").await.unwrap(), Value::Int(2));
    assert_eq!(run("'abc'[10]").await.unwrap(), Value::None);
}

#[tokio::test]
async fn test_empty_expression_is_rejected() {
    assert!(matches!(run("   ").await, Err(EvalError::InvalidExpression(_))));
    assert!(matches!(run("amount +").await, Err(EvalError::Syntax { .. })));
}

#[tokio::test]
async fn test_reserved_names_cannot_be_supplied() {
    for name in ["true", "now", "print", "round"] {
        let out = run_with("1", &[(name, Value::Bool(false))]).await;
        assert!(matches!(out, Err(EvalError::InvalidExpression(_))), "{name}: {out:?}");
    }
    assert_eq!(run("true").await.unwrap(), Value::Bool(true));
}
