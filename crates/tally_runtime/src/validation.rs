use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tally_expr::diagnostics::ErrorFormatter;
use tally_ir::utils::is_identifier;
use tally_ir::{RelationSource, TransactionType, ValueType};

use crate::functions::FunctionRegistry;
use crate::phantom::PhantomGraph;

/// One static problem found in a transaction type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    /// Where the problem sits, e.g. `inputs.amount` or `actions[1].cash_consideration`.
    pub location: String,
    pub message: String,
    /// Syntax errors rendered against the expression source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.location, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn push(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            location: location.into(),
            message: message.into(),
            rendered: None,
        });
    }
}

/// Static checks over a transaction type. Names inside expressions are not
/// resolved here; that only happens when the type runs.
pub struct Validator<'a> {
    tt: &'a TransactionType,
    registry: Arc<FunctionRegistry>,
    formatter: ErrorFormatter,
}

impl<'a> Validator<'a> {
    pub fn new(tt: &'a TransactionType) -> Self {
        Self {
            tt,
            registry: crate::default_registry(),
            formatter: ErrorFormatter::plain(),
        }
    }

    /// Checks input names against `registry` instead of the built-in library.
    pub fn with_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.validate_inputs(&mut report);
        self.validate_actions(&mut report);
        self.validate_header(&mut report);
        report
    }

    fn validate_inputs(&self, report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for input in &self.tt.inputs {
            let location = format!("inputs.{}", input.name);
            if !seen.insert(input.name.as_str()) {
                report.push(&location, format!("Duplicate input name '{}'", input.name));
            }
            if !is_identifier(&input.name) {
                report.push(&location, format!("Input name '{}' is not a valid identifier", input.name));
            }
            if self.registry.is_reserved(&input.name) {
                report.push(&location, format!("Input name '{}' is a reserved name", input.name));
            }
            if input.value_type == ValueType::Relation {
                match &input.content_type {
                    None => report.push(&location, "Relation input requires a content_type"),
                    Some(ct) if input.target_class().is_none() => {
                        report.push(&location, format!("Unknown content_type '{}'", ct))
                    }
                    Some(_) => {}
                }
            }
            if let Some(expr) = &input.value_expr {
                self.check_expr(report, format!("{}.value_expr", location), expr);
            }
            for linked in input
                .settings
                .linked_inputs_names
                .iter()
                .chain(&input.settings.recalc_on_change_linked_inputs)
            {
                if self.tt.input(linked).is_none() {
                    report.push(&location, format!("Linked input '{}' does not exist", linked));
                }
            }
        }
    }

    fn validate_actions(&self, report: &mut ValidationReport) {
        let mut orders = HashSet::new();
        for action in &self.tt.actions {
            let location = format!("actions[{}]", action.order);
            if !orders.insert(action.order) {
                report.push(&location, format!("Duplicate action order {}", action.order));
            }
            self.check_expr(report, format!("{}.condition_expr", location), &action.condition_expr);
            for (field, expr) in action.kind.expressions() {
                self.check_expr(report, format!("{}.{}", location, field), expr);
            }
            let Some(relations) = action.kind.relations() else { continue };
            for (field, source) in relations {
                let field_location = format!("{}.{}", location, field);
                let Some(target) = action.kind.relation_target(field) else {
                    report.push(
                        &field_location,
                        format!("'{}' is not a relation of {}", field, action.kind.name()),
                    );
                    continue;
                };
                if let RelationSource::Input(name) = source {
                    match self.tt.input(name) {
                        None => report.push(&field_location, format!("Input '{}' does not exist", name)),
                        Some(input) => {
                            if let Some(class) = input.target_class()
                                && class != target
                            {
                                report.push(
                                    &field_location,
                                    format!("Input '{}' holds {} but {} is expected", name, class, target),
                                );
                            }
                        }
                    }
                }
            }
        }
        for issue in PhantomGraph::check(self.tt) {
            report.push(format!("actions[{}].{}", issue.order, issue.field), issue.message);
        }
    }

    fn validate_header(&self, report: &mut ValidationReport) {
        let tt = self.tt;
        self.check_expr(report, "date_expr", &tt.date_expr);
        self.check_expr(report, "display_expr", &tt.display_expr);
        self.check_expr(report, "transaction_unique_code_expr", &tt.transaction_unique_code_expr);
        let slots = [
            ("user_text", &tt.user_text_exprs, tally_ir::USER_TEXT_SLOTS),
            ("user_number", &tt.user_number_exprs, tally_ir::USER_NUMBER_SLOTS),
            ("user_date", &tt.user_date_exprs, tally_ir::USER_DATE_SLOTS),
        ];
        for (name, exprs, limit) in slots {
            if exprs.len() > limit {
                report.push(name, format!("At most {} {} expressions are allowed", limit, name));
            }
            for (i, expr) in exprs.iter().enumerate() {
                self.check_expr(report, format!("{}_{}", name, i + 1), expr);
            }
        }
        for field in &tt.recon_fields {
            self.check_expr(report, format!("recon_fields.{}", field.reference_name), &field.expr);
        }
    }

    fn check_expr(&self, report: &mut ValidationReport, location: impl Into<String>, src: &str) {
        if src.trim().is_empty() {
            return;
        }
        if let Err(err) = tally_expr::parse(src) {
            let location = location.into();
            report.issues.push(ValidationIssue {
                rendered: Some(self.formatter.format_error(&err, src, &location)),
                location,
                message: err.to_string(),
            });
        }
    }
}

/// Runs every static check over `tt`.
pub fn validate(tt: &TransactionType) -> ValidationReport {
    Validator::new(tt).validate()
}
