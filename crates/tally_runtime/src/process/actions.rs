use serde_json::{Map, Value as Json};
use std::sync::Arc;
use tally_ir::{
    ActionKind, ComplexTransactionStatus, EntityClass, EntityRef, FieldKind, FieldMode, RebookReaction,
    RelationSource, Transaction, TransactionTypeAction,
};
use tracing::{debug, warn};

use super::{ActionError, GeneralError, Run};
use crate::datastore::RecordSource;
use crate::errors::{EvalError, PersistenceError, RuntimeError, expression_failure};
use crate::inputs::parse_iso_date;
use crate::record::RecordView;
use crate::value::Value;

/// Transaction relations that fall back to the configured defaults when the
/// action does not set them.
const DEFAULTED: [EntityClass; 8] = [
    EntityClass::Currency,
    EntityClass::Portfolio,
    EntityClass::Account,
    EntityClass::Strategy1,
    EntityClass::Strategy2,
    EntityClass::Strategy3,
    EntityClass::Counterparty,
    EntityClass::Responsible,
];

type Produced = Option<(EntityRef, Json)>;

impl Run<'_> {
    pub(super) async fn run_action(&mut self, action: &TransactionTypeAction) -> Result<(), RuntimeError> {
        let order = action.order;
        match self.perform(action).await {
            Ok(Some((entity, record))) => {
                self.accept(action, entity, record);
                Ok(())
            }
            Ok(None) => {
                self.graph.fill(order, None);
                Ok(())
            }
            Err(ActionError::Fatal(err)) => Err(err),
            Err(ActionError::Failed(messages)) => {
                warn!(order, kind = action.kind.name(), errors = messages.len(), "action failed");
                for message in &messages {
                    self.log.record(format!("action {} failed: {}", order, message));
                }
                self.graph.fill(order, None);
                match &action.kind {
                    ActionKind::Transaction(_) => {
                        self.result.transactions_errors.entry(order).or_default().extend(messages);
                    }
                    ActionKind::ExecuteCommand(_) => {
                        for message in messages {
                            self.result
                                .general_errors
                                .push(GeneralError::new(format!("action {}: {}", order, message)));
                        }
                    }
                    _ => {
                        self.result.instruments_errors.entry(order).or_default().extend(messages);
                    }
                }
                Ok(())
            }
        }
    }

    fn accept(&mut self, action: &TransactionTypeAction, entity: EntityRef, record: Json) {
        let order = action.order;
        self.log.record(format!("action {} ({}) produced {}", order, action.kind.name(), entity));
        self.graph.fill(order, Some(entity.clone()));
        if let Some(view) = RecordView::from_json(entity.class, &record) {
            self.names
                .insert(format!("__action_{}__", order), Value::Record(Arc::new(view)));
        }
        self.header.action_outputs.insert(order, entity.clone());
        if entity.class == EntityClass::Transaction {
            match serde_json::from_value::<Transaction>(record) {
                Ok(tx) => self.transactions.push(tx),
                Err(err) => warn!(%entity, error = %err, "produced transaction does not parse"),
            }
        } else {
            self.result.instruments.push(record);
        }
    }

    async fn perform(&mut self, action: &TransactionTypeAction) -> Result<Produced, ActionError> {
        let order = action.order;
        let mut target_id = None;
        if let Some(prior) = self.prior_output(order) {
            match action.rebook_reaction {
                RebookReaction::Skip => {
                    if let Some(record) = self.session.get(prior.class, &prior.id).await? {
                        self.log.record(format!("action {} kept {} from the previous run", order, prior));
                        return Ok(Some((prior, (*record).clone())));
                    }
                }
                RebookReaction::CancelPrevious => self.cancel_previous(order, &prior).await?,
                RebookReaction::Execute => {
                    if action.kind.output_class() == Some(prior.class) {
                        target_id = Some(prior.id);
                    }
                }
            }
        }

        let condition = action.condition_expr.as_str();
        if !condition.trim().is_empty() {
            match self.eval(condition).await {
                Ok(value) if value.truthy() => {}
                Ok(_) => {
                    self.log.record(format!("action {} skipped by its condition", order));
                    return Ok(None);
                }
                Err(err) => return Err(failure("condition_expr", condition, err)),
            }
        }
        let pending = self.request.status == ComplexTransactionStatus::Pending;
        if pending && matches!(action.kind, ActionKind::Transaction(_)) {
            self.log.record(format!("action {} not booked while pending", order));
            return Ok(None);
        }

        if let ActionKind::ExecuteCommand(command) = &action.kind {
            self.execute_command(order, &command.expr).await?;
            return Ok(None);
        }

        let mut errors = Vec::new();
        let fields = self.eval_fields(action, &mut errors).await?;
        let relations = self.resolve_relations(action, &mut errors).await?;
        if !errors.is_empty() {
            return Err(ActionError::Failed(errors));
        }
        let produced = match &action.kind {
            ActionKind::Instrument(_) => self.write_instrument(&action.kind, target_id, fields, relations).await?,
            ActionKind::Transaction(_) => self.write_transaction(order, target_id, fields, relations)?,
            kind => self.write_schedule(kind, target_id, fields, relations)?,
        };
        Ok(Some(produced))
    }

    fn prior_output(&self, order: i32) -> Option<EntityRef> {
        self.previous.as_ref()?.action_outputs.get(&order).cloned()
    }

    /// Cancels a transaction from the previous run, drops a prior schedule.
    /// Instruments stay as they are.
    async fn cancel_previous(&mut self, order: i32, prior: &EntityRef) -> Result<(), ActionError> {
        let Some(record) = self.session.get(prior.class, &prior.id).await? else {
            return Ok(());
        };
        match prior.class {
            EntityClass::Transaction => {
                if record.get("is_locked").and_then(Json::as_bool).unwrap_or(false) {
                    return Err(ActionError::Failed(vec![
                        PersistenceError::Locked(self.header.code).to_string(),
                    ]));
                }
                let mut record = (*record).clone();
                if let Some(obj) = record.as_object_mut() {
                    obj.insert("is_canceled".to_string(), Json::Bool(true));
                }
                self.session.stage(prior.clone(), record);
                self.canceled.insert(prior.clone());
            }
            EntityClass::Instrument => return Ok(()),
            _ => self.session.delete(prior.clone()),
        }
        self.log.record(format!("action {} cancelled {} from the previous run", order, prior));
        Ok(())
    }

    async fn execute_command(&mut self, order: i32, expr: &str) -> Result<(), ActionError> {
        if expr.trim().is_empty() {
            return Ok(());
        }
        match self.eval(expr).await {
            Ok(value) => {
                self.log.record(format!("action {} command returned {}", order, value.repr()));
                Ok(())
            }
            Err(err) => Err(failure("expr", expr, err)),
        }
    }

    /// Evaluates the scalar fields of an action. Field failures are collected
    /// so every broken field of the action is reported at once.
    async fn eval_fields(
        &mut self,
        action: &TransactionTypeAction,
        errors: &mut Vec<String>,
    ) -> Result<Map<String, Json>, ActionError> {
        let mut out = Map::new();
        for spec in action.kind.fields() {
            let mode = match &action.kind {
                ActionKind::Instrument(instrument) => instrument.mode(spec.name),
                _ if spec.kind == FieldKind::Literal => FieldMode::Literal,
                _ => FieldMode::Expression,
            };
            let value = match mode {
                FieldMode::Skip => continue,
                FieldMode::Default => default_value(spec.kind),
                FieldMode::Literal => match literal(spec.kind, spec.expr) {
                    Ok(value) => value,
                    Err(message) => {
                        errors.push(format!("{}: {}", spec.name, message));
                        continue;
                    }
                },
                FieldMode::Expression if spec.expr.trim().is_empty() => continue,
                FieldMode::Expression => match self.eval(spec.expr).await {
                    Ok(value) => match coerce(spec.kind, value) {
                        Ok(value) => value,
                        Err(message) => {
                            errors.push(format!("{}: {}", spec.name, message));
                            continue;
                        }
                    },
                    Err(err) => match failure(spec.name, spec.expr, err) {
                        ActionError::Failed(mut messages) => {
                            errors.append(&mut messages);
                            continue;
                        }
                        fatal => return Err(fatal),
                    },
                },
            };
            out.insert(spec.name.to_string(), value);
        }
        Ok(out)
    }

    async fn resolve_relations(
        &mut self,
        action: &TransactionTypeAction,
        errors: &mut Vec<String>,
    ) -> Result<Map<String, Json>, ActionError> {
        let mut out = Map::new();
        let (Some(relations), Some(class)) = (action.kind.relations(), action.kind.output_class()) else {
            return Ok(out);
        };
        for (field, source) in relations {
            let Some(target) = class.relation_target(field) else {
                errors.push(format!("{}: not a relation of {}", field, class));
                continue;
            };
            let id = match self.resolve_source(field, target, source).await {
                Ok(Some(id)) => Some(id),
                Ok(None) => self.ecosystem_default(target).await?,
                Err(ActionError::Failed(mut messages)) => {
                    errors.append(&mut messages);
                    continue;
                }
                Err(fatal) => return Err(fatal),
            };
            out.insert(field.clone(), id.map_or(Json::Null, Json::String));
        }
        if class == EntityClass::Transaction {
            for (field, target) in class.relation_fields() {
                if out.contains_key(*field) || !DEFAULTED.contains(target) {
                    continue;
                }
                if let Some(id) = self.ecosystem_default(*target).await? {
                    out.insert(field.to_string(), Json::String(id));
                }
            }
        }
        Ok(out)
    }

    async fn resolve_source(
        &self,
        field: &str,
        target: EntityClass,
        source: &RelationSource,
    ) -> Result<Option<String>, ActionError> {
        match source {
            RelationSource::Input(name) => match self.names.get(name) {
                Some(Value::Record(view)) if view.object_class == target => Ok(Some(view.id.clone())),
                Some(Value::Record(view)) => Err(failed(format!(
                    "{}: input '{}' holds {} but {} is expected",
                    field, name, view.object_class, target
                ))),
                Some(Value::Ref(entity)) if entity.class == target => Ok(Some(entity.id.clone())),
                Some(Value::Str(code)) if !code.trim().is_empty() => {
                    self.lookup_user_code(field, target, code).await.map(Some)
                }
                Some(Value::None) | Some(Value::Str(_)) | None => Ok(None),
                Some(other) => Err(failed(format!(
                    "{}: input '{}' is a {}, not a relation",
                    field,
                    name,
                    other.type_name()
                ))),
            },
            RelationSource::Phantom(order) => Ok(self.graph.resolve(*order).map(|e| e.id.clone())),
            RelationSource::UserCode(code) => self.lookup_user_code(field, target, code).await.map(Some),
        }
    }

    async fn lookup_user_code(&self, field: &str, target: EntityClass, code: &str) -> Result<String, ActionError> {
        let record = self.session.find_by_user_code(target, code).await?;
        record
            .as_deref()
            .and_then(record_id)
            .ok_or_else(|| failed(format!("{}: {} '{}' does not exist.", field, target, code)))
    }

    async fn ecosystem_default(&self, target: EntityClass) -> Result<Option<String>, ActionError> {
        let Some(code) = self.config().ecosystem_defaults.get(&target) else {
            return Ok(None);
        };
        let record = self.session.find_by_user_code(target, code).await?;
        if record.is_none() {
            debug!(%target, code, "ecosystem default is not stored");
        }
        Ok(record.as_deref().and_then(record_id))
    }

    /// Updates the instrument with the evaluated user code, or creates it.
    async fn write_instrument(
        &mut self,
        kind: &ActionKind,
        target_id: Option<String>,
        fields: Map<String, Json>,
        relations: Map<String, Json>,
    ) -> Result<(EntityRef, Json), ActionError> {
        let user_code = fields
            .get("user_code")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut existing = match &target_id {
            Some(id) => self.session.get(EntityClass::Instrument, id).await?,
            None => None,
        };
        if existing.is_none() && !user_code.is_empty() {
            existing = self.session.find_by_user_code(EntityClass::Instrument, &user_code).await?;
        }

        let (id, mut record) = match existing.as_deref() {
            Some(stored) => {
                let id = record_id(stored).ok_or_else(|| failed("stored instrument has no id"))?;
                (id, stored.as_object().cloned().unwrap_or_default())
            }
            None => {
                if user_code.is_empty() {
                    return Err(failed("user_code: a new instrument needs a user code"));
                }
                (target_id.unwrap_or_else(new_id), defaults(kind))
            }
        };
        record.extend(fields);
        record.extend(relations);
        let entity = EntityRef::new(EntityClass::Instrument, id);
        let record = self.session.stage(entity.clone(), Json::Object(record));
        Ok((entity, record))
    }

    fn write_transaction(
        &mut self,
        order: i32,
        target_id: Option<String>,
        fields: Map<String, Json>,
        relations: Map<String, Json>,
    ) -> Result<(EntityRef, Json), ActionError> {
        let mut record = fields;
        record.extend(relations);
        let today = Json::String(self.now.date().format("%Y-%m-%d").to_string());
        for field in ["accounting_date", "cash_date"] {
            if record.get(field).is_none_or(Json::is_null) {
                record.insert(field.to_string(), today.clone());
            }
        }
        let id = target_id.unwrap_or_else(new_id);
        record.insert("id".to_string(), Json::String(id.clone()));
        record.insert("complex_transaction".to_string(), Json::String(self.header.id.clone()));
        record.insert("complex_transaction_order".to_string(), Json::from(order));
        record.insert("transaction_code".to_string(), Json::from(self.header.code));

        let mut tx: Transaction =
            serde_json::from_value(Json::Object(record)).map_err(|e| failed(format!("transaction: {}", e)))?;
        tx.transaction_date = match (tx.accounting_date, tx.cash_date) {
            (Some(accounting), Some(cash)) => Some(accounting.min(cash)),
            (accounting, cash) => accounting.or(cash),
        };
        let entity = EntityRef::new(EntityClass::Transaction, id);
        let record = self.session.stage(entity.clone(), tx.to_json());
        Ok((entity, record))
    }

    /// Schedules and event actions hang off an owner that must resolve.
    fn write_schedule(
        &mut self,
        kind: &ActionKind,
        target_id: Option<String>,
        fields: Map<String, Json>,
        relations: Map<String, Json>,
    ) -> Result<(EntityRef, Json), ActionError> {
        let class = kind
            .output_class()
            .ok_or_else(|| failed(format!("{} produces no record", kind.name())))?;
        let owner = match class {
            EntityClass::EventScheduleAction => "event_schedule",
            _ => "instrument",
        };
        if relations.get(owner).is_none_or(Json::is_null) {
            return Err(failed(format!("{}: {} requires an owning {}", owner, kind.name(), owner)));
        }
        let mut record = defaults(kind);
        record.extend(fields);
        record.extend(relations);
        match kind {
            ActionKind::InstrumentEventSchedule(schedule) => {
                record.insert("is_auto_generated".to_string(), Json::Bool(schedule.is_auto_generated));
            }
            ActionKind::InstrumentEventScheduleAction(trigger) => {
                record.insert("is_book_automatic".to_string(), Json::Bool(trigger.is_book_automatic));
                record.insert("is_sent_to_pending".to_string(), Json::Bool(trigger.is_sent_to_pending));
                record.insert("button_position".to_string(), Json::from(trigger.button_position));
            }
            _ => {}
        }
        let entity = EntityRef::new(class, target_id.unwrap_or_else(new_id));
        let record = self.session.stage(entity.clone(), Json::Object(record));
        Ok((entity, record))
    }
}

fn failed(message: impl Into<String>) -> ActionError {
    ActionError::Failed(vec![message.into()])
}

fn failure(field: &str, expr: &str, err: EvalError) -> ActionError {
    if err.is_fatal() {
        ActionError::Fatal(err.into())
    } else {
        failed(format!("{}: {}", field, expression_failure(expr, &err)))
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn record_id(record: &Json) -> Option<String> {
    match record.get("id")? {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn defaults(kind: &ActionKind) -> Map<String, Json> {
    kind.fields()
        .into_iter()
        .map(|spec| (spec.name.to_string(), default_value(spec.kind)))
        .collect()
}

fn default_value(kind: FieldKind) -> Json {
    match kind {
        FieldKind::Text { .. } | FieldKind::Literal => Json::String(String::new()),
        FieldKind::Number => Json::from(0.0),
        FieldKind::Integer => Json::from(0),
        FieldKind::Date => Json::Null,
        FieldKind::Boolean => Json::Bool(false),
    }
}

fn truncate(s: String, max_len: Option<usize>) -> String {
    match max_len {
        Some(max) if s.chars().count() > max => s.chars().take(max).collect(),
        _ => s,
    }
}

fn number(n: f64) -> Result<Json, String> {
    if n.is_finite() {
        Ok(Json::from(n))
    } else {
        Err("A valid number is required.".to_string())
    }
}

/// Stored form of an evaluated field value.
fn coerce(kind: FieldKind, value: Value) -> Result<Json, String> {
    match kind {
        FieldKind::Text { max_len } => {
            let text = match value {
                Value::None => String::new(),
                other => other.py_str(),
            };
            Ok(Json::String(truncate(text, max_len)))
        }
        FieldKind::Literal => Ok(Json::String(value.py_str())),
        FieldKind::Number => match value {
            Value::None => Ok(Json::from(0.0)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| "A valid number is required.".to_string())
                .and_then(number),
            other => match other.as_f64() {
                Some(n) => number(n),
                None => Err(format!("expected a number, got {}", other.type_name())),
            },
        },
        FieldKind::Integer => match value {
            Value::None => Ok(Json::from(0)),
            Value::Float(f) if f.is_finite() => Ok(Json::from(f.trunc() as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Json::from)
                .map_err(|_| "A valid integer is required.".to_string()),
            other => other
                .as_i64()
                .map(Json::from)
                .ok_or_else(|| format!("expected an integer, got {}", other.type_name())),
        },
        FieldKind::Date => match value {
            Value::None => Ok(Json::Null),
            Value::Date(date) => Ok(Json::String(date.format("%Y-%m-%d").to_string())),
            other => Err(format!("expected a date, got {}", other.type_name())),
        },
        FieldKind::Boolean => Ok(Json::Bool(value.truthy())),
    }
}

/// Field value taken verbatim from the action definition.
fn literal(kind: FieldKind, raw: &str) -> Result<Json, String> {
    let trimmed = raw.trim();
    match kind {
        FieldKind::Text { max_len } => Ok(Json::String(truncate(raw.to_string(), max_len))),
        FieldKind::Literal => Ok(Json::String(raw.to_string())),
        _ if trimmed.is_empty() => Ok(default_value(kind)),
        FieldKind::Number => trimmed
            .parse::<f64>()
            .map_err(|_| "A valid number is required.".to_string())
            .and_then(number),
        FieldKind::Integer => trimmed
            .parse::<i64>()
            .map(Json::from)
            .map_err(|_| "A valid integer is required.".to_string()),
        FieldKind::Date => parse_iso_date(trimmed)
            .map(|d| Json::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| "Date has wrong format. Use YYYY-MM-DD.".to_string()),
        FieldKind::Boolean => Ok(Json::Bool(matches!(
            trimmed.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ))),
    }
}
