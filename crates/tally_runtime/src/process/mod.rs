//! Booking runs: inputs, then actions in order, then the header, then one commit.

mod actions;
pub mod log;
pub mod session;
mod unique;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tally_common::{Clock, SystemClock};
use tally_ir::{
    ComplexTransaction, ComplexTransactionStatus, EntityClass, EntityRef, Transaction, TransactionType,
    UniqueCodeOption,
};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::context::{PermissionGate, RuntimeContext};
use crate::datastore::Persistence;
use crate::errors::{EvalError, PersistenceError, RuntimeError, expression_failure};
use crate::evaluator::Evaluator;
use crate::functions::FunctionRegistry;
use crate::inputs::InputResolver;
use crate::phantom::PhantomGraph;
use crate::record::RecordView;
use crate::validation::{ValidationReport, Validator};
use crate::value::Value;

use self::log::ExecutionLog;
use self::session::Session;
use self::unique::UniqueCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    #[default]
    Book,
    Rebook,
    Recalculate,
}

/// A stored type by user code, or a full definition sent with the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionTypeRef {
    UserCode(String),
    Inline(Box<TransactionType>),
}

impl Default for TransactionTypeRef {
    fn default() -> Self {
        TransactionTypeRef::UserCode(String::new())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookRequest {
    pub transaction_type: TransactionTypeRef,
    pub values: Map<String, Json>,
    pub context: Map<String, Json>,
    pub status: ComplexTransactionStatus,
    pub complex_transaction_code: Option<i64>,
    pub mode: ProcessMode,
    /// Inputs whose default expressions re-run in recalculate mode.
    pub recalculate_inputs: Vec<String>,
}

impl BookRequest {
    pub fn new(user_code: impl Into<String>) -> Self {
        Self {
            transaction_type: TransactionTypeRef::UserCode(user_code.into()),
            ..Default::default()
        }
    }

    pub fn inline(tt: TransactionType) -> Self {
        Self {
            transaction_type: TransactionTypeRef::Inline(Box::new(tt)),
            ..Default::default()
        }
    }

    /// Replaces the input values with the entries of a JSON object.
    pub fn with_values(mut self, values: Json) -> Self {
        self.values = match values {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Json) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_context(mut self, name: impl Into<String>, value: Json) -> Self {
        self.context.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, status: ComplexTransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn rebook(mut self, code: i64) -> Self {
        self.mode = ProcessMode::Rebook;
        self.complex_transaction_code = Some(code);
        self
    }

    pub fn recalculate<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mode = ProcessMode::Recalculate;
        self.recalculate_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }
}

/// A failure not tied to an input or an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneralError {
    /// HTTP-style reason: 409 for a unique code collision, 410 for a skipped run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u16>,
    pub message: String,
}

impl GeneralError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            reason: None,
            message: message.into(),
        }
    }

    pub fn with_reason(reason: u16, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BookResult {
    pub complex_transaction: Option<ComplexTransaction>,
    /// Instrument-side records written by the run.
    pub instruments: Vec<Json>,
    pub transactions: Vec<Transaction>,
    pub values: BTreeMap<String, Json>,
    pub value_errors: BTreeMap<String, Vec<String>>,
    pub instruments_errors: BTreeMap<i32, Vec<String>>,
    pub transactions_errors: BTreeMap<i32, Vec<String>>,
    pub general_errors: Vec<GeneralError>,
    pub has_errors: bool,
    pub execution_log: Vec<String>,
    pub committed: bool,
}

impl BookResult {
    /// True when the run stopped on a `transaction_unique_code` collision.
    pub fn is_conflict(&self) -> bool {
        self.general_errors.iter().any(|e| e.reason == Some(409))
    }

    fn settle(mut self) -> Self {
        self.has_errors = !self.value_errors.is_empty()
            || !self.instruments_errors.is_empty()
            || !self.transactions_errors.is_empty()
            || !self.general_errors.is_empty();
        self
    }
}

/// Lets a caller abandon a run; checked between actions and before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PersistenceError> {
        if self.is_cancelled() {
            Err(PersistenceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Runs transaction types against a store.
pub struct Engine {
    store: Arc<dyn Persistence>,
    registry: Arc<FunctionRegistry>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn PermissionGate>,
}

impl Engine {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            registry: crate::default_registry(),
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            gate: Arc::new(RuntimeContext::system()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validate(&self, tt: &TransactionType) -> ValidationReport {
        Validator::new(tt).with_registry(self.registry.clone()).validate()
    }

    /// Evaluates one expression with records readable from the store.
    pub async fn eval(&self, expr: &str, names: BTreeMap<String, Value>) -> Result<Value, EvalError> {
        let session = Session::new(self.store.as_ref());
        let mut ev = Evaluator::new(self.registry.clone(), self.config.limits.clone(), self.clock.now())
            .with_source(&session)
            .with_print(self.config.enable_print);
        for (name, value) in names {
            ev.bind(name, value)?;
        }
        ev.eval(expr).await
    }

    pub async fn book(&self, request: BookRequest) -> Result<BookResult, RuntimeError> {
        self.book_with_cancel(request, &CancelHandle::new()).await
    }

    pub async fn book_with_cancel(
        &self,
        request: BookRequest,
        cancel: &CancelHandle,
    ) -> Result<BookResult, RuntimeError> {
        let tt = self.load_type(&request.transaction_type).await?;
        if !tt.is_bookable() {
            return Err(RuntimeError::Request(format!(
                "transaction type '{}' is inactive or deleted",
                tt.user_code
            )));
        }
        if !self.gate.can_book(&tt) {
            return Err(RuntimeError::PermissionDenied(format!(
                "not allowed to book '{}'",
                tt.user_code
            )));
        }
        let report = self.validate(&tt);
        if !report.is_valid() {
            return Err(RuntimeError::Schema(report.summary()));
        }

        let mut mode = request.mode;
        let mut code = request.complex_transaction_code;
        let mut restarted = false;
        loop {
            info!(transaction_type = %tt.user_code, ?mode, code, "starting run");
            let run = Run::new(self, &tt, &request, mode, cancel);
            match run.execute(code).await? {
                Outcome::Done(result) => {
                    info!(
                        transaction_type = %tt.user_code,
                        committed = result.committed,
                        has_errors = result.has_errors,
                        "run finished"
                    );
                    return Ok(result);
                }
                Outcome::Overwrite(existing) if !restarted => {
                    info!(code = existing, "unique code taken, rebooking the existing complex transaction");
                    mode = ProcessMode::Rebook;
                    code = Some(existing);
                    restarted = true;
                }
                Outcome::Overwrite(existing) => {
                    return Err(RuntimeError::Request(format!(
                        "complex transaction {} could not be overwritten",
                        existing
                    )));
                }
            }
        }
    }

    async fn load_type(&self, reference: &TransactionTypeRef) -> Result<TransactionType, RuntimeError> {
        match reference {
            TransactionTypeRef::Inline(tt) => Ok((**tt).clone()),
            TransactionTypeRef::UserCode(code) if code.is_empty() => {
                Err(RuntimeError::Request("transaction_type is required".to_string()))
            }
            TransactionTypeRef::UserCode(code) => Ok(self.store.load_transaction_type(code).await?),
        }
    }
}

enum Outcome {
    Done(BookResult),
    /// The unique code belongs to this existing complex transaction.
    Overwrite(i64),
}

/// How one action ended.
pub(crate) enum ActionError {
    /// Recorded in the action's error bucket; the run goes on.
    Failed(Vec<String>),
    Fatal(RuntimeError),
}

impl From<PersistenceError> for ActionError {
    fn from(err: PersistenceError) -> Self {
        ActionError::Fatal(err.into())
    }
}

/// State of one booking run.
pub(crate) struct Run<'e> {
    engine: &'e Engine,
    tt: &'e TransactionType,
    request: &'e BookRequest,
    mode: ProcessMode,
    cancel: &'e CancelHandle,
    now: NaiveDateTime,
    deadline: Option<Instant>,
    session: Session<'e>,
    names: BTreeMap<String, Value>,
    graph: PhantomGraph,
    log: ExecutionLog,
    header: ComplexTransaction,
    previous: Option<ComplexTransaction>,
    /// Prior transactions marked cancelled by `cancel_previous`.
    canceled: BTreeSet<EntityRef>,
    /// Unique code before any `-<n>` suffix.
    unique_base: Option<String>,
    transactions: Vec<Transaction>,
    result: BookResult,
}

impl<'e> Run<'e> {
    fn new(
        engine: &'e Engine,
        tt: &'e TransactionType,
        request: &'e BookRequest,
        mode: ProcessMode,
        cancel: &'e CancelHandle,
    ) -> Self {
        let now = engine.clock.now();
        Self {
            engine,
            tt,
            request,
            mode,
            cancel,
            now,
            deadline: Instant::now().checked_add(engine.config.limits.max_time),
            session: Session::new(engine.store.as_ref()),
            names: BTreeMap::new(),
            graph: PhantomGraph::new(tt),
            log: ExecutionLog::new(engine.config.record_execution_log, engine.clock.clone()),
            header: ComplexTransaction::default(),
            previous: None,
            canceled: BTreeSet::new(),
            unique_base: None,
            transactions: Vec::new(),
            result: BookResult::default(),
        }
    }

    fn config(&self) -> &'e EngineConfig {
        &self.engine.config
    }

    /// Evaluates against the run's names and staged records. All evaluations
    /// of a run share one time budget.
    pub(crate) async fn eval(&mut self, expr: &str) -> Result<Value, EvalError> {
        let limits = self.config().limits.until(self.deadline)?;
        let (result, printed) = {
            let mut ev = Evaluator::new(self.engine.registry.clone(), limits, self.now)
                .with_source(&self.session)
                .with_print(self.config().enable_print);
            for (name, value) in &self.names {
                ev.set(name.clone(), value.clone());
            }
            let result = ev.eval(expr).await;
            (result, ev.take_log())
        };
        for line in printed {
            self.log.record(line);
        }
        result
    }

    async fn execute(mut self, code: Option<i64>) -> Result<Outcome, RuntimeError> {
        self.prepare(code).await?;

        if !self.resolve_inputs().await? {
            return Ok(Outcome::Done(self.result.settle()));
        }
        if self.mode == ProcessMode::Recalculate {
            self.log.record("recalculated inputs");
            self.result.execution_log = self.log.lines().to_vec();
            return Ok(Outcome::Done(self.result.settle()));
        }

        if self.mode == ProcessMode::Book {
            self.header.id = uuid::Uuid::new_v4().to_string();
            self.header.code = self.session.store().next_code().await?;
        }
        self.header.transaction_type = self.tt.user_code.clone();
        self.header.status = self.request.status;
        self.header.action_outputs.clear();
        self.log.record(format!(
            "{:?} of '{}' as complex transaction {}",
            self.mode, self.tt.user_code, self.header.code
        ));

        let tt = self.tt;
        for action in tt.ordered_actions() {
            self.cancel.check()?;
            self.run_action(action).await?;
        }
        if self.mode == ProcessMode::Rebook {
            self.drop_stale_outputs();
        }
        if self.has_action_errors() && self.config().strict {
            warn!(transaction_type = %self.tt.user_code, "actions failed, nothing committed");
            self.result.execution_log = self.log.lines().to_vec();
            return Ok(Outcome::Done(self.result.settle()));
        }

        self.compute_header().await?;
        let unique = self.resolve_unique_code().await?;
        let unique = match unique {
            UniqueCode::Overwrite(existing) => return Ok(Outcome::Overwrite(existing)),
            UniqueCode::Stop => {
                self.result.execution_log = self.log.lines().to_vec();
                return Ok(Outcome::Done(self.result.settle()));
            }
            UniqueCode::Assign(code) => code,
        };
        if !self.result.general_errors.is_empty() && self.config().strict {
            self.result.execution_log = self.log.lines().to_vec();
            return Ok(Outcome::Done(self.result.settle()));
        }
        self.header.transaction_unique_code = unique;

        self.commit().await?;
        Ok(Outcome::Done(self.result.settle()))
    }

    /// Loads the header being rebooked; rejects inconsistent requests.
    async fn prepare(&mut self, code: Option<i64>) -> Result<(), RuntimeError> {
        match (self.mode, code) {
            (ProcessMode::Book, Some(code)) => Err(RuntimeError::Request(format!(
                "complex_transaction_code {} given for a new booking",
                code
            ))),
            (ProcessMode::Rebook, None) => Err(RuntimeError::Request(
                "complex_transaction_code is required to rebook".to_string(),
            )),
            (ProcessMode::Rebook, Some(code)) => {
                let raw = self
                    .session
                    .store()
                    .find_complex_transaction(code)
                    .await?
                    .ok_or_else(|| PersistenceError::not_found(EntityClass::ComplexTransaction, code.to_string()))?;
                let header: ComplexTransaction = serde_json::from_value((*raw).clone())
                    .map_err(|e| PersistenceError::Validation(e.to_string()))?;
                if header.is_locked {
                    return Err(PersistenceError::Locked(code).into());
                }
                if !self.engine.gate.can_rebook(&header) {
                    return Err(RuntimeError::PermissionDenied(format!(
                        "not allowed to rebook complex transaction {}",
                        code
                    )));
                }
                self.header = header.clone();
                self.previous = Some(header);
                Ok(())
            }
            (ProcessMode::Book, None) | (ProcessMode::Recalculate, _) => Ok(()),
        }
    }

    /// Returns false when input errors stop the run.
    async fn resolve_inputs(&mut self) -> Result<bool, RuntimeError> {
        let mut values = Map::new();
        if let Some(previous) = &self.previous {
            for (name, value) in &previous.inputs {
                values.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in &self.request.values {
            values.insert(name.clone(), value.clone());
        }

        let mut base = BTreeMap::new();
        for param in &self.tt.context_parameters {
            if let Some(raw) = self.request.context.get(&param.name) {
                base.insert(param.name.clone(), Value::from_json(raw));
            }
        }
        let recalculate = match self.mode {
            ProcessMode::Recalculate => Some(self.request.recalculate_inputs.as_slice()),
            _ => None,
        };

        let resolved = {
            let resolver = InputResolver::new(
                self.tt,
                self.engine.registry.clone(),
                self.config(),
                self.now,
                &self.session,
            )
            .with_base_names(base.clone())
            .with_deadline(self.deadline);
            resolver.resolve(&values, &self.request.context, recalculate).await?
        };

        self.result.values = resolved.snapshot();
        if !resolved.is_ok() {
            self.log.record(format!("{} input(s) failed to resolve", resolved.errors.len()));
            self.result.value_errors = resolved.errors;
            self.result.execution_log = self.log.lines().to_vec();
            return Ok(false);
        }
        self.header.inputs = self.result.values.clone();
        self.names = base;
        self.names.extend(resolved.values);
        Ok(true)
    }

    fn has_action_errors(&self) -> bool {
        !self.result.instruments_errors.is_empty()
            || !self.result.transactions_errors.is_empty()
            || !self.result.general_errors.is_empty()
    }

    /// Removes what the previous run produced and this one did not.
    /// Instruments are shared with other bookings and are never removed.
    fn drop_stale_outputs(&mut self) {
        let Some(previous) = self.previous.take() else { return };
        let kept: BTreeSet<&EntityRef> = self.header.action_outputs.values().collect();
        let mut stale: Vec<EntityRef> = previous
            .action_outputs
            .values()
            .filter(|e| e.class != EntityClass::Instrument && !kept.contains(e))
            .cloned()
            .collect();
        for id in &previous.transactions {
            let entity = EntityRef::new(EntityClass::Transaction, id.clone());
            if !kept.contains(&entity) && !stale.contains(&entity) {
                stale.push(entity);
            }
        }
        for entity in stale {
            if self.canceled.contains(&entity) {
                continue;
            }
            self.log.record(format!("removing {} from the previous run", entity));
            self.session.delete(entity);
        }
        self.previous = Some(previous);
    }

    /// Evaluates the header expressions with `transactions` bound to the
    /// records produced by this run.
    async fn compute_header(&mut self) -> Result<(), RuntimeError> {
        let views: Vec<Value> = self
            .transactions
            .iter()
            .filter_map(|tx| RecordView::from_json(EntityClass::Transaction, &tx.to_json()))
            .map(|view| Value::Record(Arc::new(view)))
            .collect();
        self.names.insert("transactions".to_string(), Value::List(views));

        let tt = self.tt;
        self.header.date = Some(self.now.date());
        if let Some(value) = self.header_expr("date_expr", &tt.date_expr).await? {
            match value {
                Value::Date(date) => self.header.date = Some(date),
                Value::None => {}
                other => self.result.general_errors.push(GeneralError::new(format!(
                    "date_expr: expected a date, got {}",
                    other.type_name()
                ))),
            }
        }
        self.header.text = match self.header_expr("display_expr", &tt.display_expr).await? {
            Some(Value::None) | None => String::new(),
            Some(value) => value.py_str(),
        };

        self.header.user_text.clear();
        for (i, expr) in tt.user_text_exprs.iter().enumerate() {
            if let Some(value) = self.header_expr(&format!("user_text_{}", i + 1), expr).await?
                && value != Value::None
            {
                self.header.user_text.insert(slot(i), value.py_str());
            }
        }
        self.header.user_number.clear();
        for (i, expr) in tt.user_number_exprs.iter().enumerate() {
            let name = format!("user_number_{}", i + 1);
            match self.header_expr(&name, expr).await? {
                Some(Value::None) | None => {}
                Some(value) => match value.as_f64() {
                    Some(n) => {
                        self.header.user_number.insert(slot(i), n);
                    }
                    None => self
                        .result
                        .general_errors
                        .push(GeneralError::new(format!("{}: A valid number is required.", name))),
                },
            }
        }
        self.header.user_date.clear();
        for (i, expr) in tt.user_date_exprs.iter().enumerate() {
            let name = format!("user_date_{}", i + 1);
            match self.header_expr(&name, expr).await? {
                Some(Value::Date(date)) => {
                    self.header.user_date.insert(slot(i), date);
                }
                Some(Value::None) | None => {}
                Some(other) => self.result.general_errors.push(GeneralError::new(format!(
                    "{}: expected a date, got {}",
                    name,
                    other.type_name()
                ))),
            }
        }
        self.header.recon_fields.clear();
        for field in &tt.recon_fields {
            let name = format!("recon_fields.{}", field.reference_name);
            if let Some(value) = self.header_expr(&name, &field.expr).await? {
                self.header.recon_fields.insert(field.reference_name.clone(), value.to_json());
            }
        }

        self.header.transactions = self.transactions.iter().map(|tx| tx.id.clone()).collect();
        self.header.is_canceled = self.transactions.iter().any(|tx| tx.is_canceled);
        self.header.is_deleted = false;
        Ok(())
    }

    /// `None` for an empty expression or a recorded failure.
    async fn header_expr(&mut self, name: &str, expr: &str) -> Result<Option<Value>, RuntimeError> {
        if expr.trim().is_empty() {
            return Ok(None);
        }
        match self.eval(expr).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                self.result
                    .general_errors
                    .push(GeneralError::new(format!("{}: {}", name, expression_failure(expr, &err))));
                Ok(None)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), RuntimeError> {
        let header_ref = EntityRef::new(EntityClass::ComplexTransaction, self.header.id.clone());
        let mut attempts = 0;
        loop {
            self.cancel.check()?;
            self.log.record(format!(
                "committing complex transaction {} with {} transaction(s)",
                self.header.code,
                self.header.transactions.len()
            ));
            self.header.execution_log = self.log.joined();
            let mut changes = self.session.changes().clone();
            changes.write(header_ref.clone(), self.header.to_json());

            match self.session.store().commit(changes).await {
                Ok(()) => break,
                Err(PersistenceError::Conflict { key, value })
                    if key == "transaction_unique_code"
                        && self.tt.transaction_unique_code_options == UniqueCodeOption::AppendNumber
                        && attempts < self.config().append_number_attempts =>
                {
                    attempts += 1;
                    warn!(value, attempt = attempts, "unique code taken at commit, renumbering");
                    let base = self.unique_base.clone().unwrap_or_else(|| value.clone());
                    match self.append_number(&base).await? {
                        Some(code) => self.header.transaction_unique_code = Some(code),
                        None => {
                            return Err(PersistenceError::Conflict { key, value }.into());
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "commit failed");
                    return Err(err.into());
                }
            }
        }

        self.result.execution_log = self.log.lines().to_vec();
        self.result.transactions = std::mem::take(&mut self.transactions);
        self.result.complex_transaction = Some(self.header.clone());
        self.result.committed = true;
        Ok(())
    }
}

fn slot(index: usize) -> u8 {
    u8::try_from(index + 1).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_user_code_or_inline_type() {
        let by_code: BookRequest = serde_json::from_value(json!({
            "transaction_type": "deposit",
            "values": {"amount": 10}
        }))
        .unwrap();
        assert!(matches!(by_code.transaction_type, TransactionTypeRef::UserCode(ref c) if c == "deposit"));
        assert_eq!(by_code.mode, ProcessMode::Book);

        let inline: BookRequest = serde_json::from_value(json!({
            "transaction_type": {"user_code": "adhoc", "actions": []},
            "mode": "recalculate",
            "recalculate_inputs": ["fee"]
        }))
        .unwrap();
        assert!(matches!(inline.transaction_type, TransactionTypeRef::Inline(ref tt) if tt.user_code == "adhoc"));
        assert_eq!(inline.mode, ProcessMode::Recalculate);
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(handle.check().is_ok());
        clone.cancel();
        assert_eq!(handle.check(), Err(PersistenceError::Cancelled));
    }
}
