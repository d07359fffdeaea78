use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::EntityClass;

pub const USER_TEXT_SLOTS: usize = 30;
pub const USER_NUMBER_SLOTS: usize = 20;
pub const USER_DATE_SLOTS: usize = 5;

/// A declarative template describing how to book one kind of business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionType {
    pub user_code: String,
    pub name: String,
    pub group: Option<String>,
    pub date_expr: String,
    pub display_expr: String,
    pub transaction_unique_code_expr: String,
    pub transaction_unique_code_options: UniqueCodeOption,
    pub inputs: Vec<TransactionTypeInput>,
    pub context_parameters: Vec<ContextParameter>,
    pub actions: Vec<TransactionTypeAction>,
    pub book_transaction_layout: Option<serde_json::Value>,
    pub visibility: Visibility,
    pub user_text_exprs: Vec<String>,
    pub user_number_exprs: Vec<String>,
    pub user_date_exprs: Vec<String>,
    pub recon_fields: Vec<ReconField>,
    /// Only active, non-deleted types can be booked.
    pub is_active: bool,
    pub is_deleted: bool,
}

impl Default for TransactionType {
    fn default() -> Self {
        Self {
            user_code: String::new(),
            name: String::new(),
            group: None,
            date_expr: String::new(),
            display_expr: String::new(),
            transaction_unique_code_expr: String::new(),
            transaction_unique_code_options: UniqueCodeOption::default(),
            inputs: Vec::new(),
            context_parameters: Vec::new(),
            actions: Vec::new(),
            book_transaction_layout: None,
            visibility: Visibility::default(),
            user_text_exprs: Vec::new(),
            user_number_exprs: Vec::new(),
            user_date_exprs: Vec::new(),
            recon_fields: Vec::new(),
            is_active: true,
            is_deleted: false,
        }
    }
}

impl TransactionType {
    pub fn is_bookable(&self) -> bool {
        self.is_active && !self.is_deleted
    }

    pub fn input(&self, name: &str) -> Option<&TransactionTypeInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn action(&self, order: i32) -> Option<&TransactionTypeAction> {
        self.actions.iter().find(|a| a.order == order)
    }

    /// Actions sorted by their declared order.
    pub fn ordered_actions(&self) -> Vec<&TransactionTypeAction> {
        let mut actions: Vec<_> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.order);
        actions
    }

    /// Inputs sorted by their declared order, ties keep declaration order.
    pub fn ordered_inputs(&self) -> Vec<&TransactionTypeInput> {
        let mut inputs: Vec<_> = self.inputs.iter().collect();
        inputs.sort_by_key(|i| i.order);
        inputs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UniqueCodeOption {
    /// A collision fails the run.
    #[default]
    Error,
    /// A collision takes over the existing complex transaction and rebooks it.
    Overwrite,
    /// A collision books under the code with a `-N` suffix.
    AppendNumber,
    /// A collision leaves everything untouched and reports it.
    Skip,
    /// A collision books the header without a unique code.
    BookWithoutUniqueCode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReconField {
    pub reference_name: String,
    pub expr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Date,
    Relation,
    Selector,
    Button,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTypeInput {
    pub name: String,
    #[serde(default)]
    pub verbose_name: Option<String>,
    pub value_type: ValueType,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub value_expr: Option<String>,
    /// Literal default used when no value and no `value_expr` apply.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_fill_from_context: bool,
    #[serde(default)]
    pub context_property: Option<String>,
    #[serde(default = "default_iterations")]
    pub expression_iterations_count: u32,
    #[serde(default)]
    pub settings: InputSettings,
}

fn default_iterations() -> u32 {
    1
}

impl TransactionTypeInput {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            verbose_name: None,
            value_type,
            content_type: None,
            order: 0,
            value_expr: None,
            value: None,
            is_required: false,
            is_fill_from_context: false,
            context_property: None,
            expression_iterations_count: 1,
            settings: InputSettings::default(),
        }
    }

    pub fn relation(name: impl Into<String>, class: EntityClass) -> Self {
        let mut input = Self::new(name, ValueType::Relation);
        input.content_type = Some(class.as_str().to_string());
        input
    }

    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.value_expr = Some(expr.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn target_class(&self) -> Option<EntityClass> {
        self.content_type.as_deref().and_then(EntityClass::from_content_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InputSettings {
    pub linked_inputs_names: Vec<String>,
    /// Inputs whose recalculation also triggers this input's recalculation.
    pub recalc_on_change_linked_inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextParameter {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebookReaction {
    /// Re-evaluate and overwrite the previous output.
    #[default]
    Execute,
    /// Keep the previous output unchanged.
    Skip,
    /// Cancel the previous output and produce a fresh one.
    CancelPrevious,
}

/// Where an action's relation field takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationSource {
    Input(String),
    Phantom(i32),
    UserCode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTypeAction {
    pub order: i32,
    #[serde(default)]
    pub rebook_reaction: RebookReaction,
    #[serde(default)]
    pub condition_expr: String,
    #[serde(default)]
    pub action_notes: String,
    pub kind: ActionKind,
}

impl TransactionTypeAction {
    pub fn new(order: i32, kind: ActionKind) -> Self {
        Self {
            order,
            rebook_reaction: RebookReaction::default(),
            condition_expr: String::new(),
            action_notes: String::new(),
            kind,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition_expr = condition.into();
        self
    }

    pub fn on_rebook(mut self, reaction: RebookReaction) -> Self {
        self.rebook_reaction = reaction;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Instrument(InstrumentAction),
    Transaction(TransactionAction),
    InstrumentFactorSchedule(FactorScheduleAction),
    InstrumentManualPricingFormula(ManualPricingFormulaAction),
    InstrumentAccrualSchedule(AccrualScheduleAction),
    InstrumentEventSchedule(EventScheduleAction),
    InstrumentEventScheduleAction(EventTriggerAction),
    ExecuteCommand(ExecuteCommandAction),
}

/// How a scalar field of an action is turned into a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text { max_len: Option<usize> },
    Number,
    Integer,
    Date,
    Boolean,
    /// Stored verbatim, never evaluated.
    Literal,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec<'a> {
    pub name: &'static str,
    pub expr: &'a str,
    pub kind: FieldKind,
}

const fn text(max: usize) -> FieldKind {
    FieldKind::Text { max_len: Some(max) }
}

const TEXT: FieldKind = FieldKind::Text { max_len: None };

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Instrument(_) => "instrument",
            ActionKind::Transaction(_) => "transaction",
            ActionKind::InstrumentFactorSchedule(_) => "instrument_factor_schedule",
            ActionKind::InstrumentManualPricingFormula(_) => "instrument_manual_pricing_formula",
            ActionKind::InstrumentAccrualSchedule(_) => "instrument_accrual_schedule",
            ActionKind::InstrumentEventSchedule(_) => "instrument_event_schedule",
            ActionKind::InstrumentEventScheduleAction(_) => "instrument_event_schedule_action",
            ActionKind::ExecuteCommand(_) => "execute_command",
        }
    }

    /// Class of the entity this action produces, if any.
    pub fn output_class(&self) -> Option<EntityClass> {
        match self {
            ActionKind::Instrument(_) => Some(EntityClass::Instrument),
            ActionKind::Transaction(_) => Some(EntityClass::Transaction),
            ActionKind::InstrumentFactorSchedule(_) => Some(EntityClass::FactorSchedule),
            ActionKind::InstrumentManualPricingFormula(_) => Some(EntityClass::ManualPricingFormula),
            ActionKind::InstrumentAccrualSchedule(_) => Some(EntityClass::AccrualCalculationSchedule),
            ActionKind::InstrumentEventSchedule(_) => Some(EntityClass::EventSchedule),
            ActionKind::InstrumentEventScheduleAction(_) => Some(EntityClass::EventScheduleAction),
            ActionKind::ExecuteCommand(_) => None,
        }
    }

    pub fn relations(&self) -> Option<&BTreeMap<String, RelationSource>> {
        match self {
            ActionKind::Instrument(a) => Some(&a.relations),
            ActionKind::Transaction(a) => Some(&a.relations),
            ActionKind::InstrumentFactorSchedule(a) => Some(&a.relations),
            ActionKind::InstrumentManualPricingFormula(a) => Some(&a.relations),
            ActionKind::InstrumentAccrualSchedule(a) => Some(&a.relations),
            ActionKind::InstrumentEventSchedule(a) => Some(&a.relations),
            ActionKind::InstrumentEventScheduleAction(a) => Some(&a.relations),
            ActionKind::ExecuteCommand(_) => None,
        }
    }

    /// Target class of a relation field on this action.
    pub fn relation_target(&self, field: &str) -> Option<EntityClass> {
        self.output_class().and_then(|class| class.relation_target(field))
    }

    /// Scalar fields in evaluation order.
    pub fn fields(&self) -> Vec<FieldSpec<'_>> {
        match self {
            ActionKind::Instrument(a) => a.fields(),
            ActionKind::Transaction(a) => a.fields(),
            ActionKind::InstrumentFactorSchedule(a) => vec![
                spec("effective_date", &a.effective_date, FieldKind::Date),
                spec("factor_value", &a.factor_value, FieldKind::Number),
            ],
            ActionKind::InstrumentManualPricingFormula(a) => vec![
                spec("expr", &a.expr, FieldKind::Literal),
                spec("notes", &a.notes, FieldKind::Literal),
            ],
            ActionKind::InstrumentAccrualSchedule(a) => vec![
                spec("accrual_start_date", &a.accrual_start_date, FieldKind::Date),
                spec("first_payment_date", &a.first_payment_date, FieldKind::Date),
                spec("accrual_size", &a.accrual_size, FieldKind::Number),
                spec("periodicity_n", &a.periodicity_n, FieldKind::Integer),
                spec("notes", &a.notes, TEXT),
            ],
            ActionKind::InstrumentEventSchedule(a) => vec![
                spec("name", &a.name, text(255)),
                spec("description", &a.description, TEXT),
                spec("effective_date", &a.effective_date, FieldKind::Date),
                spec("final_date", &a.final_date, FieldKind::Date),
                spec("notify_in_n_days", &a.notify_in_n_days, FieldKind::Integer),
                spec("periodicity_n", &a.periodicity_n, FieldKind::Integer),
            ],
            ActionKind::InstrumentEventScheduleAction(a) => vec![spec("text", &a.text, TEXT)],
            ActionKind::ExecuteCommand(_) => Vec::new(),
        }
    }

    /// Every expression source carried by the action, for static parsing.
    pub fn expressions(&self) -> Vec<(&'static str, &str)> {
        let mut out: Vec<(&'static str, &str)> = self
            .fields()
            .into_iter()
            .filter(|f| f.kind != FieldKind::Literal && !f.expr.trim().is_empty())
            .map(|f| (f.name, f.expr))
            .collect();
        if let ActionKind::ExecuteCommand(a) = self {
            if !a.expr.trim().is_empty() {
                out.push(("expr", a.expr.as_str()));
            }
        }
        out
    }
}

fn spec<'a>(name: &'static str, expr: &'a str, kind: FieldKind) -> FieldSpec<'a> {
    FieldSpec { name, expr, kind }
}

/// Per-field treatment of instrument attributes on create or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldMode {
    #[default]
    Expression,
    Literal,
    Default,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InstrumentAction {
    pub user_code: String,
    pub name: String,
    pub public_name: String,
    pub short_name: String,
    pub notes: String,
    pub price_multiplier: String,
    pub accrued_multiplier: String,
    pub default_price: String,
    pub default_accrued: String,
    pub maturity_date: String,
    pub maturity_price: String,
    pub reference_for_pricing: String,
    pub user_text_1: String,
    pub user_text_2: String,
    pub user_text_3: String,
    pub relations: BTreeMap<String, RelationSource>,
    pub value_types: BTreeMap<String, FieldMode>,
}

impl InstrumentAction {
    pub fn mode(&self, field: &str) -> FieldMode {
        self.value_types.get(field).copied().unwrap_or_default()
    }

    fn fields(&self) -> Vec<FieldSpec<'_>> {
        vec![
            spec("user_code", &self.user_code, text(1024)),
            spec("name", &self.name, text(255)),
            spec("public_name", &self.public_name, text(255)),
            spec("short_name", &self.short_name, text(50)),
            spec("notes", &self.notes, TEXT),
            spec("price_multiplier", &self.price_multiplier, FieldKind::Number),
            spec("accrued_multiplier", &self.accrued_multiplier, FieldKind::Number),
            spec("default_price", &self.default_price, FieldKind::Number),
            spec("default_accrued", &self.default_accrued, FieldKind::Number),
            spec("maturity_date", &self.maturity_date, FieldKind::Date),
            spec("maturity_price", &self.maturity_price, FieldKind::Number),
            spec("reference_for_pricing", &self.reference_for_pricing, text(100)),
            spec("user_text_1", &self.user_text_1, TEXT),
            spec("user_text_2", &self.user_text_2, TEXT),
            spec("user_text_3", &self.user_text_3, TEXT),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransactionAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub position_size_with_sign: String,
    pub cash_consideration: String,
    pub principal_with_sign: String,
    pub carry_with_sign: String,
    pub overheads_with_sign: String,
    pub accounting_date: String,
    pub cash_date: String,
    pub reference_fx_rate: String,
    pub factor: String,
    pub trade_price: String,
    pub position_amount: String,
    pub principal_amount: String,
    pub carry_amount: String,
    pub overheads: String,
    pub notes: String,
    pub user_text_1: String,
    pub user_text_2: String,
    pub user_text_3: String,
    pub user_number_1: String,
    pub user_number_2: String,
    pub user_number_3: String,
    pub user_date_1: String,
    pub user_date_2: String,
    pub user_date_3: String,
    pub is_canceled: String,
}

impl TransactionAction {
    pub fn relation(mut self, field: &str, source: RelationSource) -> Self {
        self.relations.insert(field.to_string(), source);
        self
    }

    fn fields(&self) -> Vec<FieldSpec<'_>> {
        vec![
            spec("position_size_with_sign", &self.position_size_with_sign, FieldKind::Number),
            spec("cash_consideration", &self.cash_consideration, FieldKind::Number),
            spec("principal_with_sign", &self.principal_with_sign, FieldKind::Number),
            spec("carry_with_sign", &self.carry_with_sign, FieldKind::Number),
            spec("overheads_with_sign", &self.overheads_with_sign, FieldKind::Number),
            spec("accounting_date", &self.accounting_date, FieldKind::Date),
            spec("cash_date", &self.cash_date, FieldKind::Date),
            spec("reference_fx_rate", &self.reference_fx_rate, FieldKind::Number),
            spec("factor", &self.factor, FieldKind::Number),
            spec("trade_price", &self.trade_price, FieldKind::Number),
            spec("position_amount", &self.position_amount, FieldKind::Number),
            spec("principal_amount", &self.principal_amount, FieldKind::Number),
            spec("carry_amount", &self.carry_amount, FieldKind::Number),
            spec("overheads", &self.overheads, FieldKind::Number),
            spec("notes", &self.notes, TEXT),
            spec("user_text_1", &self.user_text_1, TEXT),
            spec("user_text_2", &self.user_text_2, TEXT),
            spec("user_text_3", &self.user_text_3, TEXT),
            spec("user_number_1", &self.user_number_1, FieldKind::Number),
            spec("user_number_2", &self.user_number_2, FieldKind::Number),
            spec("user_number_3", &self.user_number_3, FieldKind::Number),
            spec("user_date_1", &self.user_date_1, FieldKind::Date),
            spec("user_date_2", &self.user_date_2, FieldKind::Date),
            spec("user_date_3", &self.user_date_3, FieldKind::Date),
            spec("is_canceled", &self.is_canceled, FieldKind::Boolean),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FactorScheduleAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub effective_date: String,
    pub factor_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManualPricingFormulaAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub expr: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccrualScheduleAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub accrual_start_date: String,
    pub first_payment_date: String,
    pub accrual_size: String,
    pub periodicity_n: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EventScheduleAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub name: String,
    pub description: String,
    pub effective_date: String,
    pub final_date: String,
    pub notify_in_n_days: String,
    pub periodicity_n: String,
    pub is_auto_generated: bool,
}

/// Attaches a bookable action to an event schedule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EventTriggerAction {
    pub relations: BTreeMap<String, RelationSource>,
    pub text: String,
    pub is_book_automatic: bool,
    pub is_sent_to_pending: bool,
    pub button_position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecuteCommandAction {
    pub expr: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_omitted_flags_leave_type_bookable() {
        let tt: TransactionType = serde_json::from_value(json!({"user_code": "deposit"})).unwrap();
        assert!(tt.is_active);
        assert!(!tt.is_deleted);
        assert!(tt.is_bookable());

        let tt: TransactionType = serde_json::from_value(json!({"user_code": "old", "is_active": false})).unwrap();
        assert!(!tt.is_bookable());
    }

    #[test]
    fn test_action_deserializes_from_tagged_json() {
        let action: TransactionTypeAction = serde_json::from_value(json!({
            "order": 1,
            "rebook_reaction": "cancel_previous",
            "kind": {
                "type": "transaction",
                "relations": { "instrument": { "phantom": 0 }, "portfolio": { "input": "portfolio" } },
                "cash_consideration": "amount"
            }
        }))
        .unwrap();

        assert_eq!(action.rebook_reaction, RebookReaction::CancelPrevious);
        match &action.kind {
            ActionKind::Transaction(t) => {
                assert_eq!(t.relations["instrument"], RelationSource::Phantom(0));
                assert_eq!(t.cash_consideration, "amount");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expression_catalog_skips_literals_and_blanks() {
        let kind = ActionKind::InstrumentManualPricingFormula(ManualPricingFormulaAction {
            expr: "price * 2".into(),
            ..Default::default()
        });
        assert!(kind.expressions().is_empty());

        let kind = ActionKind::InstrumentFactorSchedule(FactorScheduleAction {
            effective_date: "date".into(),
            ..Default::default()
        });
        assert_eq!(kind.expressions(), vec![("effective_date", "date")]);
    }

    #[test]
    fn test_input_defaults() {
        let input: TransactionTypeInput = serde_json::from_value(json!({
            "name": "amount",
            "value_type": "number"
        }))
        .unwrap();
        assert_eq!(input.expression_iterations_count, 1);
        assert!(!input.is_required);
    }
}
