use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tally_ir::EntityClass;
use tally_ir::utils::is_identifier;

use crate::config::EvalLimits;
use crate::errors::EvalError;
use crate::value::Value;

pub mod dates;
pub mod lookup;
pub mod numbers;
pub mod parse;
pub mod text;
pub mod util;

/// Names no expression may assign to, on top of every registered function.
pub const RESERVED_NAMES: [&str; 6] = ["now", "globals", "locals", "true", "false", "print"];

pub type NativeFn = Arc<dyn Fn(&FnContext<'_>, &Args) -> Result<Value, EvalError> + Send + Sync>;

/// What a pure function can see besides its arguments.
pub struct FnContext<'a> {
    pub now: NaiveDateTime,
    pub limits: &'a EvalLimits,
}

/// Functions that need the evaluator's name table or output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFn {
    Print,
    Globals,
    Locals,
    HasVar,
    GetVar,
}

pub enum NativeKind {
    Pure(NativeFn),
    /// `get_<entity>_by_user_code(user_code)`.
    Lookup(EntityClass),
    /// `get_relation_by_user_code(content_type, user_code)`.
    RelationLookup,
    Scope(ScopeFn),
}

pub struct NativeFunction {
    pub name: String,
    pub kind: NativeKind,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<def {}>", self.name)
    }
}

/// Call arguments as written: positional first, then keywords.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Self {
        Self { positional, keywords }
    }

    pub fn positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &[(String, Value)] {
        &self.keywords
    }

    /// Argument by position, falling back to its keyword name.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v))
    }

    /// Like `get`, but an explicit `None` counts as absent.
    pub fn opt(&self, index: usize, name: &str) -> Option<&Value> {
        self.get(index, name).filter(|v| !v.is_none())
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&Value, EvalError> {
        self.get(index, name)
            .ok_or_else(|| EvalError::invalid(format!("missing required argument '{}'", name)))
    }
}

/// The set of host functions visible to expressions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<NativeFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in function plus one lookup per entity class with a user code.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        text::register(&mut registry);
        numbers::register(&mut registry);
        dates::register(&mut registry);
        parse::register(&mut registry);
        lookup::register(&mut registry);
        util::register(&mut registry);
        registry
    }

    /// Registers a host function under a fresh, non-reserved name.
    pub fn register<F>(&mut self, name: &str, f: F) -> Result<(), EvalError>
    where
        F: Fn(&FnContext<'_>, &Args) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        if !is_identifier(name) {
            return Err(EvalError::invalid(format!("invalid function name '{}'", name)));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(EvalError::invalid(format!("'{}' is a reserved name", name)));
        }
        if self.functions.contains_key(name) {
            return Err(EvalError::invalid(format!(
                "function with name '{}' already registered",
                name
            )));
        }
        self.insert(name, NativeKind::Pure(Arc::new(f)));
        Ok(())
    }

    pub(crate) fn builtin(&mut self, name: &str, f: fn(&FnContext<'_>, &Args) -> Result<Value, EvalError>) {
        self.insert(name, NativeKind::Pure(Arc::new(f)));
    }

    pub(crate) fn insert(&mut self, name: &str, kind: NativeKind) {
        self.functions.insert(
            name.to_string(),
            Arc::new(NativeFunction {
                name: name.to_string(),
                kind,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NativeFunction>> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        RESERVED_NAMES.contains(&name) || self.contains(name)
    }

    /// Ends registration; evaluators only ever see a frozen registry.
    pub fn freeze(self) -> Arc<FunctionRegistry> {
        Arc::new(self)
    }
}

pub(crate) fn to_f64(v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EvalError::invalid(format!("could not convert string to float: '{}'", s))),
        other => other
            .as_f64()
            .ok_or_else(|| EvalError::invalid(format!("expected a number, got {}", other.type_name()))),
    }
}

pub(crate) fn to_i64(v: &Value) -> Result<i64, EvalError> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(f.trunc() as i64),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| EvalError::invalid(format!("invalid literal for int(): '{}'", s))),
        other => Err(EvalError::invalid(format!(
            "expected an integer, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn to_text(v: &Value) -> String {
    v.py_str()
}

/// Dates pass through; anything else is read as `YYYY-MM-DD` text.
pub(crate) fn to_date(v: &Value) -> Result<NaiveDate, EvalError> {
    match v {
        Value::Date(d) => Ok(*d),
        other => {
            let text = other.py_str();
            NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map_err(|_| EvalError::invalid(format!("time data '{}' does not match format '%Y-%m-%d'", text)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicates_and_reserved_names() {
        let mut registry = FunctionRegistry::with_defaults();
        let err = registry.register("upper", |_, _| Ok(Value::None)).unwrap_err();
        assert!(err.to_string().contains("already registered"));

        let err = registry.register("globals", |_, _| Ok(Value::None)).unwrap_err();
        assert!(err.to_string().contains("reserved"));

        registry.register("double", |_, args| Ok(Value::Float(to_f64(args.require(0, "x")?)? * 2.0))).unwrap();
        assert!(registry.is_reserved("double"));
    }

    #[test]
    fn test_lookup_functions_cover_user_code_classes() {
        let registry = FunctionRegistry::with_defaults();
        assert!(registry.contains("get_instrument_by_user_code"));
        assert!(registry.contains("get_strategy3_by_user_code"));
        assert!(registry.contains("get_relation_by_user_code"));
        assert!(!registry.contains("get_transaction_by_user_code"));
    }

    #[test]
    fn test_args_keyword_fallback() {
        let args = Args::new(vec![Value::Int(1)], vec![("b".into(), Value::Int(2)), ("c".into(), Value::None)]);
        assert_eq!(args.get(0, "a"), Some(&Value::Int(1)));
        assert_eq!(args.get(1, "b"), Some(&Value::Int(2)));
        assert!(args.opt(2, "c").is_none());
        assert!(args.require(3, "d").is_err());
    }
}
