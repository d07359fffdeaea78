use chrono::{Datelike, Duration, NaiveDate};
use serde_json::json;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tally_common::time::{days_in_month, is_leap_year};
use tally_expr::ast::FunctionDef;
use tally_ir::EntityRef;

use crate::functions::NativeFunction;
use crate::record::RecordView;

/// A value living in the evaluator's name table.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    /// Whole-day time delta.
    TimeDelta(i64),
    RelDelta(RelativeDelta),
    Dict(Dict),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Record(Arc<RecordView>),
    /// A stored entity not yet materialized into a record view.
    Ref(EntityRef),
    Function(Callable),
}

#[derive(Clone)]
pub enum Callable {
    Native(Arc<NativeFunction>),
    User(Arc<UserFunction>),
}

impl Callable {
    pub fn name(&self) -> &str {
        match self {
            Callable::Native(f) => &f.name,
            Callable::User(f) => &f.def.name,
        }
    }

    fn same(&self, other: &Callable) -> bool {
        match (self, other) {
            (Callable::Native(a), Callable::Native(b)) => Arc::ptr_eq(a, b),
            (Callable::User(a), Callable::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A function defined by a `def` statement, with defaults evaluated at definition time.
pub struct UserFunction {
    pub def: Arc<FunctionDef>,
    pub defaults: Vec<Option<Value>>,
}

/// Insertion-ordered mapping with value keys.
#[derive(Clone, Default)]
pub struct Dict(Vec<(Value, Value)>);

impl Dict {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &Value) -> Option<&mut Value> {
        self.0.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| matches!(k, Value::Str(s) if s == key))
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.0.iter()
    }
}

impl FromIterator<(Value, Value)> for Dict {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// Calendar-aware delta: relative parts are added, absolute parts replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelativeDelta {
    pub years: i64,
    pub months: i64,
    pub days: i64,
    pub leapdays: i64,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub weekday: Option<u32>,
}

impl RelativeDelta {
    pub fn new(years: i64, months: i64, days: i64) -> Self {
        Self {
            years,
            months,
            days,
            ..Default::default()
        }
        .normalized()
    }

    /// Folds months beyond a year into `years`, keeping the sign of `months`.
    pub fn normalized(mut self) -> Self {
        if self.months.abs() > 11 {
            let sign = self.months.signum();
            let total = self.months.abs();
            self.years += sign * (total / 12);
            self.months = sign * (total % 12);
        }
        self
    }

    pub fn negate(&self) -> Self {
        Self {
            years: self.years.saturating_neg(),
            months: self.months.saturating_neg(),
            days: self.days.saturating_neg(),
            leapdays: self.leapdays.saturating_neg(),
            ..*self
        }
    }

    pub fn combine(&self, other: &RelativeDelta) -> Self {
        Self {
            years: self.years.saturating_add(other.years),
            months: self.months.saturating_add(other.months),
            days: self.days.saturating_add(other.days),
            leapdays: self.leapdays.saturating_add(other.leapdays),
            year: other.year.or(self.year),
            month: other.month.or(self.month),
            day: other.day.or(self.day),
            weekday: other.weekday.or(self.weekday),
        }
        .normalized()
    }

    pub fn apply(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut year = self.year.unwrap_or(date.year()) as i64 + self.years.clamp(-10_000, 10_000);
        let mut month = self.month.unwrap_or(date.month()) as i64;
        if self.months != 0 {
            month += self.months;
            if month > 12 {
                year += 1;
                month -= 12;
            } else if month < 1 {
                year -= 1;
                month += 12;
            }
        }
        let year = i32::try_from(year).ok()?;
        let month = u32::try_from(month).ok()?;
        let day = self.day.unwrap_or(date.day()).min(days_in_month(year, month));
        let mut days = self.days;
        if self.leapdays != 0 && month > 2 && is_leap_year(year) {
            days = days.saturating_add(self.leapdays);
        }
        let mut result = NaiveDate::from_ymd_opt(year, month, day)?.checked_add_signed(Duration::try_days(days)?)?;
        if let Some(weekday) = self.weekday {
            let current = result.weekday().num_days_from_monday() as i64;
            let jump = (7 - current + weekday as i64).rem_euclid(7);
            result = result.checked_add_signed(Duration::try_days(jump)?)?;
        }
        Some(result)
    }
}

impl fmt::Display for RelativeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (name, v) in [
            ("years", self.years),
            ("months", self.months),
            ("days", self.days),
            ("leapdays", self.leapdays),
        ] {
            if v != 0 {
                parts.push(format!("{}={:+}", name, v));
            }
        }
        for (name, v) in [
            ("year", self.year.map(|v| v as i64)),
            ("month", self.month.map(|v| v as i64)),
            ("day", self.day.map(|v| v as i64)),
            ("weekday", self.weekday.map(|v| v as i64)),
        ] {
            if let Some(v) = v {
                parts.push(format!("{}={}", name, v));
            }
        }
        write!(f, "relativedelta({})", parts.join(", "))
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Date(_) => "date",
            Value::TimeDelta(_) => "timedelta",
            Value::RelDelta(_) => "relativedelta",
            Value::Dict(_) => "dict",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Record(_) | Value::Ref(_) => "record",
            Value::Function(_) => "function",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::TimeDelta(d) => *d != 0,
            Value::RelDelta(r) => *r != RelativeDelta::default(),
            Value::Dict(d) => !d.is_empty(),
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => !v.is_empty(),
            Value::Date(_) | Value::Record(_) | Value::Ref(_) | Value::Function(_) => true,
        }
    }

    /// Numeric view used by arithmetic; booleans count as 0 and 1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of any sequence-like value, strings yield their characters.
    pub fn iter_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => Some(v.clone()),
            Value::Dict(d) => Some(d.keys().cloned().collect()),
            Value::Str(s) => Some(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => Some(v.len()),
            Value::Dict(d) => Some(d.len()),
            Value::Record(r) => Some(r.fields.len()),
            _ => None,
        }
    }

    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::TimeDelta(a), Value::TimeDelta(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Membership test for `in`.
    pub fn contains(&self, needle: &Value) -> Option<bool> {
        match self {
            Value::Str(s) => needle.as_str().map(|n| s.contains(n)),
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => Some(v.contains(needle)),
            Value::Dict(d) => Some(d.contains_key(needle)),
            Value::Record(r) => Some(needle.as_str().is_some_and(|k| r.has_field(k))),
            _ => None,
        }
    }

    /// Rendering used by `str()` and string conversion of stored fields.
    pub fn py_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::TimeDelta(days) => match days {
                0 => "0:00:00".to_string(),
                1 | -1 => format!("{} day, 0:00:00", days),
                _ => format!("{} days, 0:00:00", days),
            },
            Value::RelDelta(r) => r.to_string(),
            Value::Dict(d) => {
                let items: Vec<String> = d.iter().map(|(k, v)| format!("{}: {}", k.repr(), v.repr())).collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::List(v) => format!("[{}]", join_repr(v)),
            Value::Tuple(v) if v.len() == 1 => format!("({},)", v[0].repr()),
            Value::Tuple(v) => format!("({})", join_repr(v)),
            Value::Set(v) if v.is_empty() => "set()".to_string(),
            Value::Set(v) => format!("{{{}}}", join_repr(v)),
            Value::Record(r) => format!("<{} {}>", r.object_class, r.display_key()),
            Value::Ref(r) => format!("<{}>", r),
            Value::Function(f) => format!("<def {}>", f.name()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => json!(s),
            Value::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Value::TimeDelta(days) => json!(days),
            Value::RelDelta(r) => json!({
                "years": r.years,
                "months": r.months,
                "days": r.days,
                "leapdays": r.leapdays,
            }),
            Value::Dict(d) => {
                let map = d.iter().map(|(k, v)| (k.py_str(), v.to_json())).collect();
                serde_json::Value::Object(map)
            }
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => {
                serde_json::Value::Array(v.iter().map(Value::to_json).collect())
            }
            Value::Record(r) => r.to_json(),
            Value::Ref(r) => json!(r.id),
            Value::Function(f) => json!(format!("<def {}>", f.name())),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Positions selected by `seq[lower:upper:step]`; `None` when the step is zero.
pub fn slice_positions(len: usize, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> Option<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return None;
    }
    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| if v < 0 { (v + len).max(lo) } else { v.min(hi) };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map(|v| clamp(v, 0, len)).unwrap_or(0);
        let stop = upper.map(|v| clamp(v, 0, len)).unwrap_or(len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = lower.map(|v| clamp(v, -1, len - 1)).unwrap_or(len - 1);
        let stop = upper.map(|v| clamp(v, -1, len - 1)).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Some(out)
}

fn join_repr(values: &[Value]) -> String {
    values.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

/// Shortest round-trip float text in the usual scripting notation: `1000.0`, `1e+16`, `1.5e-05`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{:e}", f);
        return match text.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => text,
        };
    }
    let text = f.to_string();
    if text.contains('.') { text } else { format!("{}.0", text) }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::TimeDelta(a), Value::TimeDelta(b)) => a == b,
            (Value::RelDelta(a), Value::RelDelta(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a.len() == b.len() && a.iter().all(|x| b.contains(x)),
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| w == v))
            }
            (Value::Record(a), Value::Record(b)) => a.object_class == b.object_class && a.id == b.id,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Record(a), Value::Ref(b)) | (Value::Ref(b), Value::Record(a)) => {
                a.object_class == b.class && a.id == b.id
            }
            (Value::Function(a), Value::Function(b)) => a.same(b),
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.py_str())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_float_rendering() {
        assert_eq!(format_float(1000.0), "1000.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-5), "1.5e-05");
        assert_eq!(format_float(-2.5), "-2.5");
    }

    #[test]
    fn test_repr_of_containers() {
        let v = Value::List(vec![Value::Int(1), Value::str("a"), Value::None, Value::Bool(true)]);
        assert_eq!(v.repr(), "[1, 'a', None, True]");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::Set(vec![]).repr(), "set()");
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::str("1"), Value::Int(1));
    }

    #[test]
    fn test_relative_delta_clamps_month_end() {
        let delta = RelativeDelta::new(0, 1, 0);
        assert_eq!(delta.apply(d(2024, 1, 31)), Some(d(2024, 2, 29)));
        assert_eq!(delta.negate().apply(d(2024, 3, 31)), Some(d(2024, 2, 29)));
    }

    #[test]
    fn test_relative_delta_normalizes_months() {
        let delta = RelativeDelta::new(0, 14, 0);
        assert_eq!(delta.years, 1);
        assert_eq!(delta.months, 2);
        assert_eq!(delta.apply(d(2023, 11, 15)), Some(d(2025, 1, 15)));
    }

    #[test]
    fn test_relative_delta_weekday_moves_forward() {
        let delta = RelativeDelta {
            weekday: Some(0),
            ..Default::default()
        };
        // 2024-01-17 is a Wednesday.
        assert_eq!(delta.apply(d(2024, 1, 17)), Some(d(2024, 1, 22)));
    }

    #[test]
    fn test_slice_positions() {
        assert_eq!(slice_positions(5, Some(1), Some(3), None), Some(vec![1, 2]));
        assert_eq!(slice_positions(5, Some(-2), None, None), Some(vec![3, 4]));
        assert_eq!(slice_positions(5, None, None, Some(-1)), Some(vec![4, 3, 2, 1, 0]));
        assert_eq!(slice_positions(5, Some(10), None, None), Some(vec![]));
        assert_eq!(slice_positions(5, None, None, Some(0)), None);
    }

    #[test]
    fn test_json_round_trip_of_plain_values() {
        let json = serde_json::json!({"a": [1, 2.5, "x", null, true]});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }
}
