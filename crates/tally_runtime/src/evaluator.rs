use chrono::{Datelike, NaiveDateTime};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tally_expr::ast::{BinaryOp, BoolOp, CompareOp, Constant, Expr, Program, Stmt, UnaryOp};
use tally_ir::{EntityClass, EntityRef};
use tracing::debug;

use crate::config::EvalLimits;
use crate::datastore::RecordSource;
use crate::errors::EvalError;
use crate::functions::dates::shift_days;
use crate::functions::{Args, FnContext, FunctionRegistry, NativeFunction, NativeKind, ScopeFn, to_text};
use crate::record::RecordView;
use crate::value::{Callable, Dict, RelativeDelta, UserFunction, Value, slice_positions};

/// How a statement finished.
enum Flow {
    Normal(Value),
    Return(Value),
    Break,
}

enum Step<'e> {
    Index(&'e Expr),
    Attr(&'e str),
}

/// One resolved step of an assignment path.
enum PathKey {
    Index(Value),
    Attr(String),
}

/// Tree-walking interpreter over a name table.
///
/// Every call to [`Evaluator::eval`] runs against a private copy of the table,
/// so assignments made by one expression are never seen by the next. Record
/// references are materialized through the optional [`RecordSource`] and cached
/// for the duration of a single evaluation.
pub struct Evaluator<'a> {
    registry: Arc<FunctionRegistry>,
    limits: EvalLimits,
    now: NaiveDateTime,
    source: Option<&'a dyn RecordSource>,
    enable_print: bool,
    deadline: Option<Instant>,
    depth: usize,
    table: BTreeMap<String, Value>,
    cache: HashMap<EntityRef, Arc<RecordView>>,
    log: Vec<String>,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: Arc<FunctionRegistry>, limits: EvalLimits, now: NaiveDateTime) -> Self {
        Self {
            registry,
            limits,
            now,
            source: None,
            enable_print: false,
            deadline: None,
            depth: 0,
            table: BTreeMap::new(),
            cache: HashMap::new(),
            log: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: &'a dyn RecordSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_print(mut self, enable: bool) -> Self {
        self.enable_print = enable;
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.table.insert(name.into(), value);
    }

    /// Like [`Evaluator::set`], but refuses reserved and registered names.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> Result<(), EvalError> {
        let name = name.into();
        self.check_assignable(&name)?;
        self.table.insert(name, value);
        Ok(())
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    /// Lines written by `print` since the last call.
    pub fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }

    /// Parses and runs `src`, returning the value of the last statement.
    pub async fn eval(&mut self, src: &str) -> Result<Value, EvalError> {
        if src.trim().is_empty() {
            return Err(EvalError::invalid("Empty expression"));
        }
        let program = tally_expr::parse(src)?;
        let result = self.eval_program(&program).await;
        if let Err(err) = &result {
            debug!(expr = src, error = %err, "expression failed");
        }
        result
    }

    pub async fn eval_program(&mut self, program: &Program) -> Result<Value, EvalError> {
        self.deadline = Instant::now().checked_add(self.limits.max_time);
        self.depth = 0;
        self.cache.clear();
        let saved = self.table.clone();
        let outcome = self.exec_block(&program.body).await;
        self.table = saved;
        self.cache.clear();
        match outcome? {
            Flow::Normal(v) | Flow::Return(v) => Ok(v),
            Flow::Break => Err(EvalError::invalid("'break' outside loop")),
        }
    }

    fn tick(&self) -> Result<(), EvalError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EvalError::TimeLimitExceeded),
            _ => Ok(()),
        }
    }

    fn exec_block<'b>(&'b mut self, body: &'b [Stmt]) -> BoxFuture<'b, Result<Flow, EvalError>> {
        Box::pin(async move {
            let mut last = Value::None;
            for stmt in body {
                match self.exec_stmt(stmt).await? {
                    Flow::Normal(v) => last = v,
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal(last))
        })
    }

    fn exec_stmt<'b>(&'b mut self, stmt: &'b Stmt) -> BoxFuture<'b, Result<Flow, EvalError>> {
        Box::pin(async move {
            self.tick()?;
            match stmt {
                Stmt::Expr(e) => Ok(Flow::Normal(self.eval_expr(e).await?)),
                Stmt::Assign { targets, value, .. } => {
                    let v = self.eval_expr(value).await?;
                    for target in targets {
                        self.assign(target, v.clone()).await?;
                    }
                    Ok(Flow::Normal(v))
                }
                Stmt::AugAssign { target, op, value, .. } => {
                    let current = self.eval_expr(target).await?;
                    let rhs = self.eval_expr(value).await?;
                    let updated = self.binary(*op, current, rhs)?;
                    self.assign(target, updated.clone()).await?;
                    Ok(Flow::Normal(updated))
                }
                Stmt::If { test, body, orelse, .. } => {
                    if self.eval_expr(test).await?.truthy() {
                        self.exec_block(body).await
                    } else {
                        self.exec_block(orelse).await
                    }
                }
                Stmt::For { target, iter, body, .. } => {
                    self.check_assignable(target)?;
                    let iterable = self.eval_expr(iter).await?;
                    let items = iterable.iter_items().ok_or_else(|| {
                        EvalError::eval(format!("'{}' object is not iterable", iterable.type_name()))
                    })?;
                    let mut last = Value::None;
                    for item in items {
                        self.tick()?;
                        self.table.insert(target.clone(), item);
                        match self.exec_block(body).await? {
                            Flow::Normal(v) => last = v,
                            Flow::Break => break,
                            ret @ Flow::Return(_) => return Ok(ret),
                        }
                    }
                    Ok(Flow::Normal(last))
                }
                Stmt::While { test, body, .. } => {
                    let mut last = Value::None;
                    while self.eval_expr(test).await?.truthy() {
                        match self.exec_block(body).await? {
                            Flow::Normal(v) => last = v,
                            Flow::Break => break,
                            ret @ Flow::Return(_) => return Ok(ret),
                        }
                    }
                    Ok(Flow::Normal(last))
                }
                Stmt::FunctionDef(def) => {
                    self.check_assignable(&def.name)?;
                    let mut defaults = Vec::with_capacity(def.params.len());
                    for param in &def.params {
                        defaults.push(match &param.default {
                            Some(e) => Some(self.eval_expr(e).await?),
                            None => None,
                        });
                    }
                    let function = UserFunction {
                        def: def.clone(),
                        defaults,
                    };
                    self.table
                        .insert(def.name.clone(), Value::Function(Callable::User(Arc::new(function))));
                    Ok(Flow::Normal(Value::None))
                }
                Stmt::Return { value, .. } => {
                    let v = match value {
                        Some(e) => self.eval_expr(e).await?,
                        None => Value::None,
                    };
                    Ok(Flow::Return(v))
                }
                Stmt::Break(_) => Ok(Flow::Break),
                Stmt::Pass(_) => Ok(Flow::Normal(Value::None)),
                Stmt::Try {
                    body,
                    handlers,
                    orelse,
                    finalbody,
                    ..
                } => {
                    let outcome = match self.exec_block(body).await {
                        Err(err) if !err.is_fatal() => match handlers.first() {
                            Some(handler) => {
                                if let Some(alias) = &handler.alias {
                                    self.table.insert(alias.clone(), Value::Str(err.to_string()));
                                }
                                self.exec_block(&handler.body).await
                            }
                            None => Err(err),
                        },
                        Ok(Flow::Normal(v)) if orelse.is_empty() => Ok(Flow::Normal(v)),
                        Ok(Flow::Normal(_)) => self.exec_block(orelse).await,
                        other => other,
                    };
                    if finalbody.is_empty() {
                        return outcome;
                    }
                    if matches!(outcome, Err(ref e) if e.is_fatal()) {
                        return outcome;
                    }
                    match (self.exec_block(finalbody).await?, outcome) {
                        (Flow::Normal(v), Ok(Flow::Normal(_))) => Ok(Flow::Normal(v)),
                        (Flow::Normal(_), other) => other,
                        (control, _) => Ok(control),
                    }
                }
            }
        })
    }

    fn check_assignable(&self, name: &str) -> Result<(), EvalError> {
        if self.registry.is_reserved(name) {
            return Err(EvalError::invalid(format!("'{}' is a reserved name", name)));
        }
        Ok(())
    }

    fn assign<'b>(&'b mut self, target: &'b Expr, value: Value) -> BoxFuture<'b, Result<(), EvalError>> {
        Box::pin(async move {
            match target {
                Expr::Name(name, _) => {
                    self.check_assignable(name)?;
                    self.table.insert(name.clone(), value);
                    Ok(())
                }
                Expr::Tuple(items, _) | Expr::List(items, _) => {
                    let values = value.iter_items().ok_or_else(|| {
                        EvalError::eval(format!("cannot unpack non-iterable {} object", value.type_name()))
                    })?;
                    if values.len() != items.len() {
                        return Err(EvalError::eval(format!(
                            "expected {} values to unpack, got {}",
                            items.len(),
                            values.len()
                        )));
                    }
                    for (item, v) in items.iter().zip(values) {
                        self.assign(item, v).await?;
                    }
                    Ok(())
                }
                Expr::Subscript { .. } | Expr::Attribute { .. } => self.assign_path(target, value).await,
                _ => Err(EvalError::invalid("Invalid assign")),
            }
        })
    }

    /// Root name and key path of a place such as `d["a"][0]` or `d.a`; `None` when
    /// `target` is not rooted at a name.
    async fn place<'e>(&mut self, target: &'e Expr) -> Result<Option<(&'e str, Vec<PathKey>)>, EvalError> {
        let mut steps: Vec<Step<'e>> = Vec::new();
        let mut cursor = target;
        let root = loop {
            match cursor {
                Expr::Subscript { value, index, .. } => {
                    if matches!(index.as_ref(), Expr::Slice { .. }) {
                        return Ok(None);
                    }
                    steps.push(Step::Index(index.as_ref()));
                    cursor = value.as_ref();
                }
                Expr::Attribute { value, attr, .. } => {
                    steps.push(Step::Attr(attr.as_str()));
                    cursor = value.as_ref();
                }
                Expr::Name(name, _) => break name.as_str(),
                _ => return Ok(None),
            }
        };
        let mut path = Vec::with_capacity(steps.len());
        for step in steps {
            path.push(match step {
                Step::Index(e) => PathKey::Index(self.eval_expr(e).await?),
                Step::Attr(a) => PathKey::Attr(a.to_string()),
            });
        }
        path.reverse();
        Ok(Some((root, path)))
    }

    /// Reads a place resolved by [`Evaluator::place`] without evaluating its keys again.
    async fn read_place(&mut self, root: &str, path: Vec<PathKey>) -> Result<Value, EvalError> {
        let mut value = self.lookup(root).await?;
        for key in path {
            value = match key {
                PathKey::Index(k) => self.index_value(value, k).await?,
                PathKey::Attr(a) => self.attribute(value, &a).await?,
            };
        }
        Ok(value)
    }

    fn slot_mut(&mut self, root: &str, path: &[PathKey]) -> Result<&mut Value, EvalError> {
        let mut slot = self
            .table
            .get_mut(root)
            .ok_or_else(|| EvalError::NameNotDefined(root.to_string()))?;
        for key in path {
            slot = child_mut(slot, key)?;
        }
        Ok(slot)
    }

    async fn assign_path(&mut self, target: &Expr, value: Value) -> Result<(), EvalError> {
        let Some((root, path)) = self.place(target).await? else {
            return Err(EvalError::invalid("Invalid assign"));
        };
        let Some((last, walk)) = path.split_last() else {
            return Err(EvalError::invalid("Invalid assign"));
        };
        let max_len = self.limits.max_len;
        match (self.slot_mut(root, walk)?, last) {
            (Value::Dict(d), PathKey::Index(k)) => {
                check_hashable(k)?;
                if !d.contains_key(k) && d.len() >= max_len {
                    return Err(EvalError::invalid("Dict is too long"));
                }
                d.insert(k.clone(), value);
            }
            (Value::Dict(d), PathKey::Attr(a)) => {
                let key = Value::Str(a.clone());
                if !d.contains_key(&key) && d.len() >= max_len {
                    return Err(EvalError::invalid("Dict is too long"));
                }
                d.insert(key, value);
            }
            (Value::List(items), PathKey::Index(k)) => {
                let i = k
                    .as_i64()
                    .ok_or_else(|| EvalError::eval("list indices must be integers"))?;
                let pos = position(items.len(), i)
                    .ok_or_else(|| EvalError::eval("list assignment index out of range"))?;
                items[pos] = value;
            }
            _ => return Err(EvalError::invalid("Invalid assign")),
        }
        Ok(())
    }

    /// Evaluates one expression node.
    pub(crate) fn eval_expr<'b>(&'b mut self, expr: &'b Expr) -> BoxFuture<'b, Result<Value, EvalError>> {
        Box::pin(async move {
            self.tick()?;
            match expr {
                Expr::Constant(c, _) => self.constant(c),
                Expr::Name(name, _) => self.lookup(name).await,
                Expr::Attribute { value, attr, .. } => {
                    let base = self.eval_expr(value).await?;
                    self.attribute(base, attr).await
                }
                Expr::Subscript { value, index, .. } => {
                    let base = self.eval_expr(value).await?;
                    self.subscript(base, index).await
                }
                Expr::Slice { .. } => Err(EvalError::invalid("slice outside of a subscript")),
                Expr::Unary { op, operand, .. } => {
                    let v = self.eval_expr(operand).await?;
                    unary(*op, v)
                }
                Expr::Binary { left, op, right, .. } => {
                    let l = self.eval_expr(left).await?;
                    let r = self.eval_expr(right).await?;
                    self.binary(*op, l, r)
                }
                Expr::Bool { op, values, .. } => {
                    let mut last = Value::None;
                    for e in values {
                        last = self.eval_expr(e).await?;
                        let stop = match op {
                            BoolOp::And => !last.truthy(),
                            BoolOp::Or => last.truthy(),
                        };
                        if stop {
                            break;
                        }
                    }
                    Ok(last)
                }
                Expr::Compare {
                    left, ops, comparators, ..
                } => {
                    let (Some(op), Some(right)) = (ops.first(), comparators.first()) else {
                        return self.eval_expr(left).await;
                    };
                    let l = self.eval_expr(left).await?;
                    let r = self.eval_expr(right).await?;
                    compare(*op, &l, &r).map(Value::Bool)
                }
                Expr::IfExp { test, body, orelse, .. } => {
                    if self.eval_expr(test).await?.truthy() {
                        self.eval_expr(body).await
                    } else {
                        self.eval_expr(orelse).await
                    }
                }
                Expr::List(items, _) => Ok(Value::List(self.eval_items(items, "List").await?)),
                Expr::Tuple(items, _) => Ok(Value::Tuple(self.eval_items(items, "Tuple").await?)),
                Expr::Set(items, _) => {
                    let values = self.eval_items(items, "Set").await?;
                    let mut unique: Vec<Value> = Vec::with_capacity(values.len());
                    for v in values {
                        check_hashable(&v)?;
                        if !unique.contains(&v) {
                            unique.push(v);
                        }
                    }
                    Ok(Value::Set(unique))
                }
                Expr::Dict(pairs, _) => {
                    if pairs.len() > self.limits.max_len {
                        return Err(EvalError::invalid("Dict is too long"));
                    }
                    let mut dict = Dict::new();
                    for (k, v) in pairs {
                        let key = self.eval_expr(k).await?;
                        check_hashable(&key)?;
                        let value = self.eval_expr(v).await?;
                        dict.insert(key, value);
                    }
                    Ok(Value::Dict(dict))
                }
                Expr::Call { func, args, kwargs, .. } => self.call(func, args, kwargs).await,
            }
        })
    }

    fn constant(&self, c: &Constant) -> Result<Value, EvalError> {
        Ok(match c {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => {
                if s.chars().count() > self.limits.max_str_len {
                    return Err(EvalError::invalid(format!(
                        "String literal is too long, max length is {}",
                        self.limits.max_str_len
                    )));
                }
                Value::Str(s.clone())
            }
        })
    }

    async fn eval_items(&mut self, items: &[Expr], kind: &str) -> Result<Vec<Value>, EvalError> {
        if items.len() > self.limits.max_len {
            return Err(EvalError::invalid(format!("{} is too long", kind)));
        }
        let mut out = Vec::with_capacity(items.len());
        for e in items {
            out.push(self.eval_expr(e).await?);
        }
        Ok(out)
    }

    async fn lookup(&mut self, name: &str) -> Result<Value, EvalError> {
        match name {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
        if let Some(v) = self.table.get(name) {
            let v = v.clone();
            return self.materialize(v).await;
        }
        match self.registry.get(name) {
            Some(f) => Ok(Value::Function(Callable::Native(f.clone()))),
            None => Err(EvalError::NameNotDefined(name.to_string())),
        }
    }

    async fn materialize(&mut self, value: Value) -> Result<Value, EvalError> {
        match value {
            Value::Ref(r) => self.resolve_ref(r).await,
            other => Ok(other),
        }
    }

    async fn resolve_ref(&mut self, entity: EntityRef) -> Result<Value, EvalError> {
        if let Some(view) = self.cache.get(&entity) {
            return Ok(Value::Record(view.clone()));
        }
        let Some(source) = self.source else {
            return Ok(Value::Ref(entity));
        };
        match source.get(entity.class, &entity.id).await? {
            Some(raw) => Ok(self.remember(entity.class, &raw)),
            None => Ok(Value::None),
        }
    }

    fn remember(&mut self, class: EntityClass, raw: &serde_json::Value) -> Value {
        match RecordView::from_json(class, raw) {
            Some(view) => {
                let view = Arc::new(view);
                self.cache.insert(view.entity_ref(), view.clone());
                Value::Record(view)
            }
            None => Value::None,
        }
    }

    async fn attribute(&mut self, base: Value, attr: &str) -> Result<Value, EvalError> {
        let missing = || EvalError::AttributeDoesNotExist(attr.to_string());
        let base = self.materialize(base).await?;
        match &base {
            Value::None => Ok(Value::None),
            Value::Dict(d) => {
                let v = d.get_str(attr).cloned().ok_or_else(missing)?;
                self.materialize(v).await
            }
            Value::Record(view) => {
                let v = view.attr(attr).ok_or_else(missing)?;
                self.materialize(v).await
            }
            Value::Ref(r) => match attr {
                "id" => Ok(Value::Str(r.id.clone())),
                "object_class" => Ok(Value::Str(r.class.as_str().to_string())),
                _ => Err(missing()),
            },
            Value::Date(d) => match attr {
                "year" => Ok(Value::Int(d.year() as i64)),
                "month" => Ok(Value::Int(d.month() as i64)),
                "day" => Ok(Value::Int(d.day() as i64)),
                "weekday" => Ok(Value::Int(d.weekday().num_days_from_monday() as i64)),
                _ => Err(missing()),
            },
            Value::TimeDelta(days) => match attr {
                "days" => Ok(Value::Int(*days)),
                _ => Err(missing()),
            },
            Value::RelDelta(r) => {
                let opt = |v: Option<i64>| v.map(Value::Int).unwrap_or(Value::None);
                match attr {
                    "years" => Ok(Value::Int(r.years)),
                    "months" => Ok(Value::Int(r.months)),
                    "days" => Ok(Value::Int(r.days)),
                    "leapdays" => Ok(Value::Int(r.leapdays)),
                    "year" => Ok(opt(r.year.map(i64::from))),
                    "month" => Ok(opt(r.month.map(i64::from))),
                    "day" => Ok(opt(r.day.map(i64::from))),
                    "weekday" => Ok(opt(r.weekday.map(i64::from))),
                    _ => Err(missing()),
                }
            }
            _ => Err(missing()),
        }
    }

    async fn subscript(&mut self, base: Value, index: &Expr) -> Result<Value, EvalError> {
        if let Expr::Slice { lower, upper, step, .. } = index {
            let lower = self.slice_bound(lower.as_deref()).await?;
            let upper = self.slice_bound(upper.as_deref()).await?;
            let step = self.slice_bound(step.as_deref()).await?;
            let len = match &base {
                Value::Str(s) => s.chars().count(),
                Value::List(v) | Value::Tuple(v) => v.len(),
                _ => return Ok(Value::None),
            };
            let positions = slice_positions(len, lower, upper, step)
                .ok_or_else(|| EvalError::eval("slice step cannot be zero"))?;
            return Ok(match base {
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    Value::Str(positions.into_iter().map(|i| chars[i]).collect())
                }
                Value::List(v) => Value::List(positions.into_iter().map(|i| v[i].clone()).collect()),
                Value::Tuple(v) => Value::Tuple(positions.into_iter().map(|i| v[i].clone()).collect()),
                _ => Value::None,
            });
        }

        let key = self.eval_expr(index).await?;
        self.index_value(base, key).await
    }

    /// `base[key]` with the key already evaluated.
    async fn index_value(&mut self, base: Value, key: Value) -> Result<Value, EvalError> {
        let base = self.materialize(base).await?;
        let found = match &base {
            Value::Dict(d) => d.get(&key).cloned(),
            Value::List(v) | Value::Tuple(v) => {
                let i = key.as_i64().ok_or_else(|| {
                    EvalError::eval(format!("indices must be integers, not {}", key.type_name()))
                })?;
                position(v.len(), i).map(|p| v[p].clone())
            }
            Value::Str(s) => {
                let i = key.as_i64().ok_or_else(|| {
                    EvalError::eval(format!("string indices must be integers, not {}", key.type_name()))
                })?;
                let chars: Vec<char> = s.chars().collect();
                position(chars.len(), i).map(|p| Value::Str(chars[p].to_string()))
            }
            Value::Record(view) => key.as_str().and_then(|k| view.attr(k)),
            _ => None,
        };
        self.materialize(found.unwrap_or(Value::None)).await
    }

    async fn slice_bound(&mut self, bound: Option<&Expr>) -> Result<Option<i64>, EvalError> {
        let Some(e) = bound else { return Ok(None) };
        match self.eval_expr(e).await? {
            Value::None => Ok(None),
            v => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| EvalError::eval("slice indices must be integers or None")),
        }
    }

    async fn call(&mut self, func: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, EvalError> {
        if let Expr::Attribute { value, attr, .. } = func {
            if let Some(result) = self.call_method(value, attr, args, kwargs).await? {
                return Ok(result);
            }
        }
        let callee = match self.eval_expr(func).await {
            Ok(v) => v,
            Err(EvalError::NameNotDefined(name)) => return Err(EvalError::FunctionNotDefined(name)),
            Err(EvalError::AttributeDoesNotExist(name)) => return Err(EvalError::FunctionNotDefined(name)),
            Err(e) => return Err(e),
        };
        let Value::Function(callable) = callee else {
            return Err(EvalError::FunctionNotDefined(func.callee_name()));
        };
        let args = self.eval_args(args, kwargs).await?;
        match callable {
            Callable::Native(f) => self.call_native(&f, args).await,
            Callable::User(f) => self.call_user(&f, args).await,
        }
    }

    async fn eval_args(&mut self, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Args, EvalError> {
        let mut positional = Vec::with_capacity(args.len());
        for e in args {
            positional.push(self.eval_expr(e).await?);
        }
        let mut keywords = Vec::with_capacity(kwargs.len());
        for (name, e) in kwargs {
            keywords.push((name.clone(), self.eval_expr(e).await?));
        }
        Ok(Args::new(positional, keywords))
    }

    /// Bound methods on lists and dates; `None` when `attr` is not one of them.
    async fn call_method(
        &mut self,
        receiver: &Expr,
        attr: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Option<Value>, EvalError> {
        let is_list_method = matches!(attr, "append" | "pop" | "remove");
        if !is_list_method && !matches!(attr, "weekday" | "isoweekday" | "isoformat") {
            return Ok(None);
        }
        let place = if is_list_method {
            self.place(receiver).await?
        } else {
            None
        };
        let base = match place {
            Some((root, path)) => {
                if matches!(self.slot_mut(root, &path), Ok(Value::List(_))) {
                    let args = self.eval_args(args, kwargs).await?;
                    let max_len = self.limits.max_len;
                    let Value::List(items) = self.slot_mut(root, &path)? else {
                        return Err(EvalError::invalid("Invalid assign"));
                    };
                    return list_method(items, attr, &args, max_len).map(Some);
                }
                self.read_place(root, path).await?
            }
            None => self.eval_expr(receiver).await?,
        };
        match base {
            Value::List(mut items) if is_list_method => {
                let args = self.eval_args(args, kwargs).await?;
                list_method(&mut items, attr, &args, self.limits.max_len).map(Some)
            }
            Value::Date(d) => Ok(Some(match attr {
                "weekday" => Value::Int(d.weekday().num_days_from_monday() as i64),
                "isoweekday" => Value::Int(d.weekday().number_from_monday() as i64),
                "isoformat" => Value::Str(d.format("%Y-%m-%d").to_string()),
                _ => return Err(EvalError::AttributeDoesNotExist(attr.to_string())),
            })),
            // A dict may carry a callable under these names.
            Value::Dict(_) | Value::Record(_) | Value::Ref(_) => {
                let callee = self.attribute(base, attr).await.map_err(|e| match e {
                    EvalError::AttributeDoesNotExist(n) => EvalError::FunctionNotDefined(n),
                    other => other,
                })?;
                let Value::Function(callable) = callee else {
                    return Err(EvalError::FunctionNotDefined(attr.to_string()));
                };
                let args = self.eval_args(args, kwargs).await?;
                let result = match callable {
                    Callable::Native(f) => self.call_native(&f, args).await?,
                    Callable::User(f) => self.call_user(&f, args).await?,
                };
                Ok(Some(result))
            }
            _ => Err(EvalError::FunctionNotDefined(attr.to_string())),
        }
    }

    async fn call_native(&mut self, f: &NativeFunction, args: Args) -> Result<Value, EvalError> {
        match &f.kind {
            NativeKind::Pure(func) => {
                let ctx = FnContext {
                    now: self.now,
                    limits: &self.limits,
                };
                func(&ctx, &args)
            }
            NativeKind::Lookup(class) => {
                let code = args.get(0, "user_code").cloned().unwrap_or(Value::None);
                self.find_by_user_code(*class, code).await
            }
            NativeKind::RelationLookup => {
                let content_type = args.require(0, "content_type").map(to_text)?;
                let class = EntityClass::from_content_type(&content_type)
                    .ok_or_else(|| EvalError::invalid(format!("unknown content type '{}'", content_type)))?;
                let code = args.get(1, "user_code").cloned().unwrap_or(Value::None);
                self.find_by_user_code(class, code).await
            }
            NativeKind::Scope(scope) => self.call_scope(*scope, &args),
        }
    }

    async fn find_by_user_code(&mut self, class: EntityClass, code: Value) -> Result<Value, EvalError> {
        let code = match code {
            Value::Record(view) => return Ok(Value::Record(view)),
            Value::Ref(r) => return self.resolve_ref(r).await,
            v if !v.truthy() => return Ok(Value::None),
            v => to_text(&v),
        };
        let Some(source) = self.source else {
            return Ok(Value::None);
        };
        match source.find_by_user_code(class, &code).await? {
            Some(raw) => Ok(self.remember(class, &raw)),
            None => Ok(Value::None),
        }
    }

    fn call_scope(&mut self, scope: ScopeFn, args: &Args) -> Result<Value, EvalError> {
        match scope {
            ScopeFn::Print => {
                if self.enable_print {
                    let line: Vec<String> = args.values().iter().map(to_text).collect();
                    self.log.push(line.join(" "));
                }
                Ok(Value::None)
            }
            ScopeFn::Globals => Ok(Value::Dict(
                self.registry
                    .names()
                    .filter_map(|name| {
                        self.registry
                            .get(name)
                            .map(|f| (Value::str(name), Value::Function(Callable::Native(f.clone()))))
                    })
                    .collect(),
            )),
            ScopeFn::Locals => Ok(Value::Dict(
                self.table
                    .iter()
                    .map(|(k, v)| (Value::str(k.as_str()), v.clone()))
                    .collect(),
            )),
            ScopeFn::HasVar => {
                let name = args.require(0, "name").map(to_text)?;
                Ok(Value::Bool(self.table.contains_key(&name)))
            }
            ScopeFn::GetVar => {
                let name = args.require(0, "name").map(to_text)?;
                Ok(self
                    .table
                    .get(&name)
                    .cloned()
                    .or_else(|| args.get(1, "default").cloned())
                    .unwrap_or(Value::None))
            }
        }
    }

    async fn call_user(&mut self, f: &UserFunction, args: Args) -> Result<Value, EvalError> {
        if self.depth >= self.limits.max_call_depth {
            return Err(EvalError::invalid(format!(
                "recursion limit exceeded, max depth is {}",
                self.limits.max_call_depth
            )));
        }
        let def = &f.def;
        if args.values().len() > def.params.len() {
            return Err(EvalError::eval(format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                def.params.len(),
                args.values().len()
            )));
        }
        if let Some((unknown, _)) = args
            .keywords()
            .iter()
            .find(|(k, _)| !def.params.iter().any(|p| p.name == *k))
        {
            return Err(EvalError::eval(format!(
                "{}() got an unexpected keyword argument '{}'",
                def.name, unknown
            )));
        }
        let mut scope = self.table.clone();
        for (i, param) in def.params.iter().enumerate() {
            let value = args
                .values()
                .get(i)
                .cloned()
                .or_else(|| args.keywords().iter().find(|(k, _)| *k == param.name).map(|(_, v)| v.clone()))
                .or_else(|| f.defaults.get(i).cloned().flatten())
                .ok_or_else(|| {
                    EvalError::eval(format!("{}() missing required argument '{}'", def.name, param.name))
                })?;
            scope.insert(param.name.clone(), value);
        }

        let saved = std::mem::replace(&mut self.table, scope);
        self.depth += 1;
        let outcome = self.exec_block(&def.body).await;
        self.depth -= 1;
        self.table = saved;
        match outcome? {
            Flow::Return(v) => Ok(v),
            Flow::Normal(_) => Ok(Value::None),
            Flow::Break => Err(EvalError::invalid("'break' outside loop")),
        }
    }

    fn binary(&self, op: BinaryOp, l: Value, r: Value) -> Result<Value, EvalError> {
        binary(op, l, r, &self.limits)
    }
}

fn child_mut<'v>(slot: &'v mut Value, key: &PathKey) -> Result<&'v mut Value, EvalError> {
    match (slot, key) {
        (Value::Dict(d), PathKey::Index(k)) => d
            .get_mut(k)
            .ok_or_else(|| EvalError::eval(format!("key {} not found", k.repr()))),
        (Value::Dict(d), PathKey::Attr(a)) => d
            .get_mut(&Value::Str(a.clone()))
            .ok_or_else(|| EvalError::AttributeDoesNotExist(a.clone())),
        (Value::List(items), PathKey::Index(k)) => {
            let i = k
                .as_i64()
                .ok_or_else(|| EvalError::eval("list indices must be integers"))?;
            let len = items.len();
            position(len, i)
                .and_then(|p| items.get_mut(p))
                .ok_or_else(|| EvalError::eval("list index out of range"))
        }
        _ => Err(EvalError::invalid("Invalid assign")),
    }
}

/// Resolves a possibly negative index against `len`.
fn position(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn check_hashable(v: &Value) -> Result<(), EvalError> {
    match v {
        Value::List(_) | Value::Dict(_) | Value::Set(_) => {
            Err(EvalError::eval(format!("unhashable type: '{}'", v.type_name())))
        }
        _ => Ok(()),
    }
}

fn list_method(items: &mut Vec<Value>, method: &str, args: &Args, max_len: usize) -> Result<Value, EvalError> {
    match method {
        "append" => {
            let item = args.require(0, "object")?.clone();
            if items.len() >= max_len {
                return Err(EvalError::invalid("List is too long"));
            }
            items.push(item);
            Ok(Value::None)
        }
        "pop" => {
            if items.is_empty() {
                return Err(EvalError::eval("pop from empty list"));
            }
            let index = match args.opt(0, "index") {
                Some(v) => v.as_i64().ok_or_else(|| EvalError::eval("list indices must be integers"))?,
                None => -1,
            };
            let pos = position(items.len(), index).ok_or_else(|| EvalError::eval("pop index out of range"))?;
            Ok(items.remove(pos))
        }
        "remove" => {
            let item = args.require(0, "value")?;
            let pos = items
                .iter()
                .position(|v| v == item)
                .ok_or_else(|| EvalError::eval("list.remove(x): x not in list"))?;
            items.remove(pos);
            Ok(Value::None)
        }
        other => Err(EvalError::AttributeDoesNotExist(other.to_string())),
    }
}

fn is_same(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => l.type_name() == r.type_name() && l == r,
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    let ordering = |symbol: &str| {
        l.compare(r).ok_or_else(|| {
            EvalError::eval(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                symbol,
                l.type_name(),
                r.type_name()
            ))
        })
    };
    let membership = || {
        r.contains(l)
            .ok_or_else(|| EvalError::eval(format!("argument of type '{}' is not iterable", r.type_name())))
    };
    Ok(match op {
        CompareOp::Eq => l == r,
        CompareOp::NotEq => l != r,
        CompareOp::Lt => ordering("<")?.is_lt(),
        CompareOp::LtE => ordering("<=")?.is_le(),
        CompareOp::Gt => ordering(">")?.is_gt(),
        CompareOp::GtE => ordering(">=")?.is_ge(),
        CompareOp::In => membership()?,
        CompareOp::NotIn => !membership()?,
        CompareOp::Is => is_same(l, r),
        CompareOp::IsNot => !is_same(l, r),
    })
}

fn unary(op: UnaryOp, v: Value) -> Result<Value, EvalError> {
    let bad = |v: &Value, symbol: &str| EvalError::eval(format!("bad operand type for unary {}: '{}'", symbol, v.type_name()));
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
        UnaryOp::Neg => match v {
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
            Value::Bool(b) => Ok(Value::Int(-(b as i64))),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::TimeDelta(d) => d.checked_neg().map(Value::TimeDelta).ok_or_else(overflow),
            Value::RelDelta(r) => Ok(Value::RelDelta(r.negate())),
            other => Err(bad(&other, "-")),
        },
        UnaryOp::Pos => match v {
            Value::Int(_) | Value::Float(_) | Value::TimeDelta(_) | Value::RelDelta(_) => Ok(v),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            other => Err(bad(&other, "+")),
        },
        UnaryOp::Invert => match v {
            Value::Int(i) => Ok(Value::Int(!i)),
            Value::Bool(b) => Ok(Value::Int(!(b as i64))),
            other => Err(bad(&other, "~")),
        },
    }
}

fn overflow() -> EvalError {
    EvalError::invalid("integer overflow")
}

fn out_of_range() -> EvalError {
    EvalError::invalid("date value out of range")
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::FloorDiv => "//",
        BinaryOp::Mod => "%",
        BinaryOp::Pow => "**",
        BinaryOp::LShift => "<<",
        BinaryOp::RShift => ">>",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
    }
}

fn ints(l: &Value, r: &Value) -> Option<(i64, i64)> {
    Some((l.as_i64()?, r.as_i64()?))
}

fn floats(l: &Value, r: &Value) -> Option<(f64, f64)> {
    Some((l.as_f64()?, r.as_f64()?))
}

fn finite(f: f64) -> Result<Value, EvalError> {
    if f.is_finite() {
        Ok(Value::Float(f))
    } else {
        Err(EvalError::invalid("numerical result out of range"))
    }
}

/// Applies a binary operator under the evaluation limits.
pub(crate) fn binary(op: BinaryOp, l: Value, r: Value, limits: &EvalLimits) -> Result<Value, EvalError> {
    let unsupported = |l: &Value, r: &Value| {
        EvalError::eval(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            symbol(op),
            l.type_name(),
            r.type_name()
        ))
    };
    match op {
        BinaryOp::Add => match (&l, &r) {
            (Value::Str(a), Value::Str(b)) => {
                if a.chars().count() + b.chars().count() > limits.max_str_len {
                    return Err(EvalError::invalid(
                        "Sorry, adding those two strings would make a too long string.",
                    ));
                }
                Ok(Value::Str(format!("{}{}", a, b)))
            }
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                if a.len() + b.len() > limits.max_len {
                    return Err(EvalError::invalid("Sorry, adding those two sequences would make it too long."));
                }
                let joined: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
                Ok(if matches!(l, Value::List(_)) {
                    Value::List(joined)
                } else {
                    Value::Tuple(joined)
                })
            }
            (Value::Date(d), Value::TimeDelta(days)) | (Value::TimeDelta(days), Value::Date(d)) => {
                shift_days(*d, *days).map(Value::Date)
            }
            (Value::Date(d), Value::RelDelta(delta)) | (Value::RelDelta(delta), Value::Date(d)) => {
                delta.apply(*d).map(Value::Date).ok_or_else(out_of_range)
            }
            (Value::TimeDelta(a), Value::TimeDelta(b)) => a.checked_add(*b).map(Value::TimeDelta).ok_or_else(overflow),
            (Value::RelDelta(a), Value::RelDelta(b)) => Ok(Value::RelDelta(a.combine(b))),
            (Value::TimeDelta(a), Value::RelDelta(b)) | (Value::RelDelta(b), Value::TimeDelta(a)) => {
                Ok(Value::RelDelta(b.combine(&RelativeDelta::new(0, 0, *a))))
            }
            _ => match (ints(&l, &r), floats(&l, &r)) {
                (Some((a, b)), _) => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
                (None, Some((a, b))) => finite(a + b),
                _ => Err(unsupported(&l, &r)),
            },
        },
        BinaryOp::Sub => match (&l, &r) {
            (Value::Date(a), Value::Date(b)) => Ok(Value::TimeDelta((*a - *b).num_days())),
            (Value::Date(d), Value::TimeDelta(days)) => {
                let days = days.checked_neg().ok_or_else(overflow)?;
                shift_days(*d, days).map(Value::Date)
            }
            (Value::Date(d), Value::RelDelta(delta)) => delta.negate().apply(*d).map(Value::Date).ok_or_else(out_of_range),
            (Value::TimeDelta(a), Value::TimeDelta(b)) => a.checked_sub(*b).map(Value::TimeDelta).ok_or_else(overflow),
            (Value::RelDelta(a), Value::RelDelta(b)) => Ok(Value::RelDelta(a.combine(&b.negate()))),
            _ => match (ints(&l, &r), floats(&l, &r)) {
                (Some((a, b)), _) => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
                (None, Some((a, b))) => finite(a - b),
                _ => Err(unsupported(&l, &r)),
            },
        },
        BinaryOp::Mul => match (&l, &r) {
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                Err(EvalError::eval("Can't convert 'str' object to str implicitly"))
            }
            (Value::List(_) | Value::Tuple(_), _) | (_, Value::List(_) | Value::Tuple(_)) => Err(unsupported(&l, &r)),
            (Value::TimeDelta(d), n) | (n, Value::TimeDelta(d)) if n.as_i64().is_some() => d
                .checked_mul(n.as_i64().unwrap_or(0))
                .map(Value::TimeDelta)
                .ok_or_else(overflow),
            _ => match (ints(&l, &r), floats(&l, &r)) {
                (Some((a, b)), _) => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
                (None, Some((a, b))) => finite(a * b),
                _ => Err(unsupported(&l, &r)),
            },
        },
        BinaryOp::Div => {
            let (a, b) = floats(&l, &r).ok_or_else(|| unsupported(&l, &r))?;
            if b == 0.0 {
                return Err(EvalError::invalid("division by zero"));
            }
            finite(a / b)
        }
        BinaryOp::FloorDiv => match (ints(&l, &r), floats(&l, &r)) {
            (Some((_, 0)), _) => Err(EvalError::invalid("integer division or modulo by zero")),
            (Some((a, b)), _) => {
                let q = a.checked_div(b).ok_or_else(overflow)?;
                let adjust = a % b != 0 && ((a < 0) != (b < 0));
                Ok(Value::Int(if adjust { q - 1 } else { q }))
            }
            (None, Some((_, b))) if b == 0.0 => Err(EvalError::invalid("float floor division by zero")),
            (None, Some((a, b))) => finite((a / b).floor()),
            _ => Err(unsupported(&l, &r)),
        },
        BinaryOp::Mod => match (ints(&l, &r), floats(&l, &r)) {
            (Some((_, 0)), _) => Err(EvalError::invalid("integer division or modulo by zero")),
            (Some((a, b)), _) => {
                let m = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Value::Int(if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m }))
            }
            (None, Some((_, b))) if b == 0.0 => Err(EvalError::invalid("float modulo")),
            (None, Some((a, b))) => finite(a - b * (a / b).floor()),
            _ => Err(unsupported(&l, &r)),
        },
        BinaryOp::Pow => {
            let (fa, fb) = floats(&l, &r).ok_or_else(|| unsupported(&l, &r))?;
            if fa.abs() > limits.max_exponent || fb.abs() > limits.max_exponent {
                return Err(EvalError::invalid(format!(
                    "Invalid exponent, max exponent is {}",
                    limits.max_exponent
                )));
            }
            match ints(&l, &r) {
                Some((a, b)) if b >= 0 => {
                    let exp = u32::try_from(b).map_err(|_| overflow())?;
                    a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
                }
                Some((0, _)) => Err(EvalError::invalid("0.0 cannot be raised to a negative power")),
                _ => finite(fa.powf(fb)),
            }
        }
        BinaryOp::LShift => {
            let (a, b) = ints(&l, &r).ok_or_else(|| unsupported(&l, &r))?;
            if b > limits.max_shift {
                return Err(EvalError::invalid(format!(
                    "Invalid left shift, max left shift is {}",
                    limits.max_shift
                )));
            }
            if b < 0 {
                return Err(EvalError::eval("negative shift count"));
            }
            let factor = 1i64.checked_shl(b as u32).ok_or_else(overflow)?;
            a.checked_mul(factor).map(Value::Int).ok_or_else(overflow)
        }
        BinaryOp::RShift => {
            let (a, b) = ints(&l, &r).ok_or_else(|| unsupported(&l, &r))?;
            if b < 0 {
                return Err(EvalError::eval("negative shift count"));
            }
            Ok(Value::Int(a >> b.min(63)))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            if let (Value::Bool(a), Value::Bool(b)) = (&l, &r) {
                return Ok(Value::Bool(match op {
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    _ => a ^ b,
                }));
            }
            let (a, b) = ints(&l, &r).ok_or_else(|| unsupported(&l, &r))?;
            Ok(Value::Int(match op {
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                _ => a ^ b,
            }))
        }
    }
}
