use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tally_ir::{TransactionType, TransactionTypeInput, ValueType};
use tracing::debug;

use crate::config::EngineConfig;
use crate::datastore::RecordSource;
use crate::errors::{EvalError, expression_failure};
use crate::evaluator::Evaluator;
use crate::functions::FunctionRegistry;
use crate::record::RecordView;
use crate::value::Value;

pub const REQUIRED: &str = "This field is required.";

/// Inputs after coercion and default evaluation.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    /// Every declared input, `None` when it has no value.
    pub values: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ResolvedInputs {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Storable form; relation inputs keep only their id.
    pub fn snapshot(&self) -> BTreeMap<String, Json> {
        self.values
            .iter()
            .map(|(name, value)| {
                let json = match value {
                    Value::Record(view) => Json::String(view.id.clone()),
                    other => other.to_json(),
                };
                (name.clone(), json)
            })
            .collect()
    }

    fn error(&mut self, name: &str, message: impl Into<String>) {
        self.errors.entry(name.to_string()).or_default().push(message.into());
    }
}

/// Turns raw request values into typed expression values.
pub struct InputResolver<'a> {
    tt: &'a TransactionType,
    registry: Arc<FunctionRegistry>,
    config: &'a EngineConfig,
    now: NaiveDateTime,
    source: &'a dyn RecordSource,
    base: BTreeMap<String, Value>,
    deadline: Option<Instant>,
}

impl<'a> InputResolver<'a> {
    pub fn new(
        tt: &'a TransactionType,
        registry: Arc<FunctionRegistry>,
        config: &'a EngineConfig,
        now: NaiveDateTime,
        source: &'a dyn RecordSource,
    ) -> Self {
        Self {
            tt,
            registry,
            config,
            now,
            source,
            base: BTreeMap::new(),
            deadline: None,
        }
    }

    /// Names visible to default expressions besides the inputs themselves.
    pub fn with_base_names(mut self, base: BTreeMap<String, Value>) -> Self {
        self.base = base;
        self
    }

    /// Default expressions draw on the time left before `deadline` rather than
    /// a fresh `max_time` each.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Resolves every input. With `recalculate`, only the named inputs and the
    /// inputs linked to them re-run their default expression; everything else
    /// is taken as given.
    pub async fn resolve(
        &self,
        values: &Map<String, Json>,
        context: &Map<String, Json>,
        recalculate: Option<&[String]>,
    ) -> Result<ResolvedInputs, EvalError> {
        let mut out = ResolvedInputs::default();
        let mut supplied = BTreeSet::new();

        for input in self.tt.ordered_inputs() {
            let raw = self.raw_value(input, values, context);
            let value = match raw {
                Some(raw) => match self.coerce_json(input, raw).await {
                    Ok(v) => {
                        supplied.insert(input.name.clone());
                        v
                    }
                    Err(message) => {
                        out.error(&input.name, message);
                        Value::None
                    }
                },
                None => Value::None,
            };
            out.values.insert(input.name.clone(), value);
        }

        let pending: Vec<&TransactionTypeInput> = match recalculate {
            Some(names) => {
                let targets = self.recalc_closure(names);
                self.tt
                    .ordered_inputs()
                    .into_iter()
                    .filter(|i| targets.contains(&i.name) && has_expr(i))
                    .collect()
            }
            None => self
                .tt
                .ordered_inputs()
                .into_iter()
                .filter(|i| has_expr(i) && !supplied.contains(&i.name) && !out.errors.contains_key(&i.name))
                .collect(),
        };
        self.run_defaults(&pending, &mut out).await?;

        for input in self.tt.ordered_inputs() {
            let blank = out.values.get(&input.name).is_none_or(is_blank);
            if input.is_required && blank && !out.errors.contains_key(&input.name) {
                out.error(&input.name, REQUIRED);
            }
        }
        Ok(out)
    }

    fn raw_value<'j>(
        &self,
        input: &'j TransactionTypeInput,
        values: &'j Map<String, Json>,
        context: &'j Map<String, Json>,
    ) -> Option<&'j Json> {
        if let Some(v) = values.get(&input.name).filter(|v| !is_blank_json(v)) {
            return Some(v);
        }
        if input.is_fill_from_context {
            let key = input.context_property.as_deref().unwrap_or(&input.name);
            if let Some(v) = context.get(key).filter(|v| !is_blank_json(v)) {
                return Some(v);
            }
        }
        if !has_expr(input) {
            return input.value.as_ref().filter(|v| !is_blank_json(v));
        }
        None
    }

    fn recalc_closure(&self, names: &[String]) -> BTreeSet<String> {
        let mut targets: BTreeSet<String> = names.iter().cloned().collect();
        loop {
            let before = targets.len();
            for input in &self.tt.inputs {
                if input
                    .settings
                    .recalc_on_change_linked_inputs
                    .iter()
                    .any(|linked| targets.contains(linked))
                {
                    targets.insert(input.name.clone());
                }
            }
            if targets.len() == before {
                return targets;
            }
        }
    }

    /// Evaluates default expressions until nothing changes or the iteration
    /// cap is reached. A failing expression keeps the input's previous value.
    async fn run_defaults(&self, pending: &[&TransactionTypeInput], out: &mut ResolvedInputs) -> Result<(), EvalError> {
        let cap = self.config.recalculate_iterations.max(1);
        let passes = pending
            .iter()
            .map(|i| i.expression_iterations_count.max(1))
            .max()
            .unwrap_or(0)
            .min(cap);
        let mut failures: BTreeMap<String, String> = BTreeMap::new();

        for pass in 0..passes {
            let mut changed = false;
            for input in pending.iter().filter(|i| i.expression_iterations_count.max(1) > pass) {
                let Some(expr) = input.value_expr.as_deref() else { continue };
                match self.eval_default(expr, &out.values).await {
                    Ok(v) => match self.coerce_value(input, v).await {
                        Ok(v) => {
                            failures.remove(&input.name);
                            if out.values.get(&input.name) != Some(&v) {
                                changed = true;
                                out.values.insert(input.name.clone(), v);
                            }
                        }
                        Err(message) => {
                            failures.insert(input.name.clone(), message);
                        }
                    },
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        debug!(input = %input.name, error = %err, "default expression failed");
                        failures.insert(input.name.clone(), expression_failure(expr, &err));
                    }
                }
            }
            if !changed {
                break;
            }
        }
        for (name, message) in failures {
            out.error(&name, message);
        }
        Ok(())
    }

    async fn eval_default(&self, expr: &str, values: &BTreeMap<String, Value>) -> Result<Value, EvalError> {
        let limits = self.config.limits.until(self.deadline)?;
        let mut ev = Evaluator::new(self.registry.clone(), limits, self.now)
            .with_source(self.source)
            .with_print(false);
        for (name, value) in self.base.iter().chain(values) {
            ev.set(name.clone(), value.clone());
        }
        ev.eval(expr).await
    }

    async fn coerce_json(&self, input: &TransactionTypeInput, raw: &Json) -> Result<Value, String> {
        match input.value_type {
            ValueType::String | ValueType::Selector => Ok(match raw {
                Json::String(s) => Value::Str(s.clone()),
                other => Value::Str(other.to_string()),
            }),
            ValueType::Number => match raw {
                Json::Number(n) => n.as_f64().map(Value::Float).ok_or_else(not_a_number),
                Json::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| not_a_number()),
                _ => Err(not_a_number()),
            },
            ValueType::Date => match raw {
                Json::String(s) => parse_iso_date(s).map(Value::Date).ok_or_else(bad_date),
                _ => Err(bad_date()),
            },
            ValueType::Relation => {
                let key = match raw {
                    Json::String(s) => s.clone(),
                    Json::Number(n) => n.to_string(),
                    Json::Object(obj) => match obj.get("id").or_else(|| obj.get("user_code")) {
                        Some(Json::String(s)) => s.clone(),
                        Some(Json::Number(n)) => n.to_string(),
                        _ => return Err("Relation must carry an id or user_code.".to_string()),
                    },
                    _ => return Err("Relation must be an id or user_code.".to_string()),
                };
                self.lookup(input, &key).await
            }
            ValueType::Button => Ok(Value::from_json(raw)),
        }
    }

    async fn coerce_value(&self, input: &TransactionTypeInput, value: Value) -> Result<Value, String> {
        match (input.value_type, value) {
            (_, Value::None) => Ok(Value::None),
            (ValueType::Relation, Value::Record(view)) => Ok(Value::Record(view)),
            (ValueType::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (ValueType::Number, v @ (Value::Int(_) | Value::Float(_) | Value::Bool(_))) => {
                v.as_f64().map(Value::Float).ok_or_else(not_a_number)
            }
            (ValueType::String | ValueType::Selector, v) => Ok(Value::Str(v.py_str())),
            (_, v) => self.coerce_json(input, &v.to_json()).await,
        }
    }

    async fn lookup(&self, input: &TransactionTypeInput, key: &str) -> Result<Value, String> {
        let Some(class) = input.target_class() else {
            return Err(format!(
                "Unknown content_type '{}'.",
                input.content_type.as_deref().unwrap_or_default()
            ));
        };
        let found = match self.source.get(class, key).await.map_err(|e| e.to_string())? {
            Some(record) => Some(record),
            None => self
                .source
                .find_by_user_code(class, key)
                .await
                .map_err(|e| e.to_string())?,
        };
        found
            .and_then(|record| RecordView::from_json(class, &record))
            .map(|view| Value::Record(Arc::new(view)))
            .ok_or_else(|| format!("{} '{}' does not exist.", class, key))
    }
}

fn has_expr(input: &TransactionTypeInput) -> bool {
    input.value_expr.as_deref().is_some_and(|e| !e.trim().is_empty())
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::None => true,
        Value::Str(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn is_blank_json(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
pub(crate) fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| s.get(..10).and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()))
}

fn not_a_number() -> String {
    "A valid number is required.".to_string()
}

fn bad_date() -> String {
    "Date has wrong format. Use YYYY-MM-DD.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDataStore;
    use serde_json::json;
    use tally_ir::EntityClass;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    fn trade_type() -> TransactionType {
        let mut settlement = TransactionTypeInput::new("settlement_date", ValueType::Date)
            .with_expr("accounting_date + relative_delta(days=2)");
        settlement.order = 3;
        let mut accounting = TransactionTypeInput::new("accounting_date", ValueType::Date);
        accounting.order = 2;
        TransactionType {
            user_code: "trade".into(),
            inputs: vec![
                TransactionTypeInput::new("amount", ValueType::Number).required(),
                TransactionTypeInput::relation("currency", EntityClass::Currency),
                accounting,
                settlement,
            ],
            ..Default::default()
        }
    }

    fn store() -> MemoryDataStore {
        let store = MemoryDataStore::new();
        store
            .put(EntityClass::Currency, json!({"id": "c-usd", "user_code": "USD"}))
            .unwrap();
        store
    }

    async fn resolve(values: Json) -> ResolvedInputs {
        let tt = trade_type();
        let config = EngineConfig::default();
        let store = store();
        let resolver = InputResolver::new(&tt, FunctionRegistry::with_defaults().freeze(), &config, now(), &store);
        let values = values.as_object().cloned().unwrap_or_default();
        resolver.resolve(&values, &Map::new(), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_spent_run_budget_stops_default_expressions() {
        let tt = trade_type();
        let config = EngineConfig::default();
        let store = store();
        let resolver = InputResolver::new(&tt, FunctionRegistry::with_defaults().freeze(), &config, now(), &store)
            .with_deadline(Some(Instant::now()));
        let values = json!({"amount": 1, "accounting_date": "2024-01-15"});
        let out = resolver
            .resolve(values.as_object().unwrap(), &Map::new(), None)
            .await;
        assert!(matches!(out, Err(EvalError::TimeLimitExceeded)), "{:?}", out.map(|o| o.errors));
    }

    #[tokio::test]
    async fn test_coercion_and_default_chain() {
        let out = resolve(json!({"amount": "1000", "currency": "USD", "accounting_date": "2024-01-15"})).await;
        assert!(out.is_ok(), "{:?}", out.errors);
        assert_eq!(out.values["amount"], Value::Float(1000.0));
        assert_eq!(out.values["settlement_date"], Value::Date(NaiveDate::from_ymd_opt(2024, 1, 17).unwrap()));
        match &out.values["currency"] {
            Value::Record(view) => assert_eq!(view.id, "c-usd"),
            other => panic!("expected record, got {:?}", other),
        }
        assert_eq!(out.snapshot()["currency"], json!("c-usd"));
    }

    #[tokio::test]
    async fn test_explicit_value_wins_over_default() {
        let out = resolve(json!({
            "amount": 1,
            "accounting_date": "2024-01-15",
            "settlement_date": "2024-02-01"
        }))
        .await;
        assert_eq!(out.values["settlement_date"], Value::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
    }

    #[tokio::test]
    async fn test_errors_are_collected_per_input() {
        let out = resolve(json!({"amount": "", "currency": "EUR", "accounting_date": "15/01/2024"})).await;
        assert_eq!(out.errors["amount"], vec![REQUIRED.to_string()]);
        assert_eq!(out.errors["currency"], vec!["Currency 'EUR' does not exist.".to_string()]);
        assert!(out.errors.contains_key("accounting_date"));
        assert!(out.errors["settlement_date"][0].starts_with("Invalid expression \"accounting_date"));
        assert_eq!(out.values["settlement_date"], Value::None);
    }

    #[tokio::test]
    async fn test_recalculate_only_touches_named_inputs() {
        let mut tt = trade_type();
        let mut fee = TransactionTypeInput::new("fee", ValueType::Number).with_expr("amount * 0.01");
        fee.settings.recalc_on_change_linked_inputs = vec!["amount".into()];
        tt.inputs.push(fee);
        let mut doubled = TransactionTypeInput::new("doubled", ValueType::Number).with_expr("amount * 2");
        doubled.order = 9;
        tt.inputs.push(doubled);

        let config = EngineConfig::default();
        let store = store();
        let resolver = InputResolver::new(&tt, FunctionRegistry::with_defaults().freeze(), &config, now(), &store);
        let values = json!({"amount": 200, "fee": 5, "doubled": 1, "accounting_date": "2024-01-15"});
        let out = resolver
            .resolve(values.as_object().unwrap(), &Map::new(), Some(&["amount".to_string()]))
            .await
            .unwrap();
        assert_eq!(out.values["fee"], Value::Float(2.0));
        assert_eq!(out.values["doubled"], Value::Float(1.0));
    }

    #[tokio::test]
    async fn test_fill_from_context() {
        let mut tt = trade_type();
        tt.inputs[1].is_fill_from_context = true;
        tt.inputs[1].context_property = Some("context_currency".into());
        let config = EngineConfig::default();
        let store = store();
        let resolver = InputResolver::new(&tt, FunctionRegistry::with_defaults().freeze(), &config, now(), &store);
        let context = json!({"context_currency": "USD"});
        let values = json!({"amount": 1});
        let out = resolver
            .resolve(values.as_object().unwrap(), context.as_object().unwrap(), None)
            .await
            .unwrap();
        assert!(matches!(&out.values["currency"], Value::Record(v) if v.id == "c-usd"));
    }
}
