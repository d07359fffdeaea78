use std::collections::BTreeMap;
use tally_ir::{EntityRef, RelationSource, TransactionType};

/// State of one action's output slot during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhantomSlot {
    /// The action has not run yet.
    Pending,
    /// The action was skipped or failed.
    Empty,
    Filled(EntityRef),
}

/// A relation field pointing at an action it may not reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomIssue {
    pub order: i32,
    pub field: String,
    pub message: String,
}

/// Index of action outputs keyed by action order.
///
/// Phantoms only ever point backwards, so slots are filled in one linear
/// pass over the ordered actions.
#[derive(Debug, Clone, Default)]
pub struct PhantomGraph {
    slots: BTreeMap<i32, PhantomSlot>,
}

impl PhantomGraph {
    pub fn new(tt: &TransactionType) -> Self {
        let mut graph = Self::default();
        for action in &tt.actions {
            graph.slots.insert(action.order, PhantomSlot::Pending);
        }
        graph
    }

    /// Every phantom reference that is forward, self-referencing, dangling or
    /// of the wrong class.
    pub fn check(tt: &TransactionType) -> Vec<PhantomIssue> {
        let mut issues = Vec::new();
        for action in tt.ordered_actions() {
            let Some(relations) = action.kind.relations() else { continue };
            for (field, source) in relations {
                let RelationSource::Phantom(target) = source else { continue };
                let issue = |message: String| PhantomIssue {
                    order: action.order,
                    field: field.clone(),
                    message,
                };
                if *target >= action.order {
                    issues.push(issue(format!(
                        "action {} field '{}' references action {} which does not run before it",
                        action.order, field, target
                    )));
                    continue;
                }
                let Some(referenced) = tt.action(*target) else {
                    issues.push(issue(format!(
                        "action {} field '{}' references missing action {}",
                        action.order, field, target
                    )));
                    continue;
                };
                let wanted = action.kind.relation_target(field);
                let produced = referenced.kind.output_class();
                if wanted.is_none() || wanted != produced {
                    issues.push(issue(format!(
                        "action {} field '{}' expects {} but action {} produces {}",
                        action.order,
                        field,
                        wanted.map_or("nothing".to_string(), |c| c.to_string()),
                        target,
                        produced.map_or("nothing".to_string(), |c| c.to_string()),
                    )));
                }
            }
        }
        issues
    }

    pub fn fill(&mut self, order: i32, output: Option<EntityRef>) {
        let slot = match output {
            Some(entity) => PhantomSlot::Filled(entity),
            None => PhantomSlot::Empty,
        };
        self.slots.insert(order, slot);
    }

    pub fn slot(&self, order: i32) -> &PhantomSlot {
        self.slots.get(&order).unwrap_or(&PhantomSlot::Empty)
    }

    /// Output of an earlier action, or `None` when it produced nothing.
    pub fn resolve(&self, order: i32) -> Option<&EntityRef> {
        match self.slot(order) {
            PhantomSlot::Filled(entity) => Some(entity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_ir::{ActionKind, EntityClass, InstrumentAction, TransactionAction, TransactionTypeAction};

    fn tt(actions: Vec<TransactionTypeAction>) -> TransactionType {
        TransactionType {
            user_code: "buy".into(),
            actions,
            ..Default::default()
        }
    }

    fn buy(instrument: RelationSource) -> ActionKind {
        ActionKind::Transaction(TransactionAction::default().relation("instrument", instrument))
    }

    #[test]
    fn test_backward_reference_is_accepted() {
        let tt = tt(vec![
            TransactionTypeAction::new(0, ActionKind::Instrument(InstrumentAction::default())),
            TransactionTypeAction::new(1, buy(RelationSource::Phantom(0))),
        ]);
        assert!(PhantomGraph::check(&tt).is_empty());
    }

    #[test]
    fn test_forward_and_self_references_are_rejected() {
        let tt = tt(vec![
            TransactionTypeAction::new(0, buy(RelationSource::Phantom(1))),
            TransactionTypeAction::new(1, ActionKind::Instrument(InstrumentAction::default())),
            TransactionTypeAction::new(2, buy(RelationSource::Phantom(2))),
        ]);
        let issues = PhantomGraph::check(&tt);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].order, 0);
        assert_eq!(issues[1].order, 2);
    }

    #[test]
    fn test_class_mismatch_is_rejected() {
        let tt = tt(vec![
            TransactionTypeAction::new(0, buy(RelationSource::Input("instrument".into()))),
            TransactionTypeAction::new(1, buy(RelationSource::Phantom(0))),
        ]);
        let issues = PhantomGraph::check(&tt);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("expects Instrument"));
    }

    #[test]
    fn test_slots_fill_in_order() {
        let tt = tt(vec![
            TransactionTypeAction::new(0, ActionKind::Instrument(InstrumentAction::default())),
            TransactionTypeAction::new(1, buy(RelationSource::Phantom(0))),
        ]);
        let mut graph = PhantomGraph::new(&tt);
        assert_eq!(graph.slot(0), &PhantomSlot::Pending);
        graph.fill(0, Some(EntityRef::new(EntityClass::Instrument, "i1")));
        graph.fill(1, None);
        assert_eq!(graph.resolve(0).map(|e| e.id.as_str()), Some("i1"));
        assert_eq!(graph.resolve(1), None);
        assert_eq!(graph.slot(1), &PhantomSlot::Empty);
    }
}
