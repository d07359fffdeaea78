use tally_ir::EntityClass;

use super::{FunctionRegistry, NativeKind};

/// Lookups need the record source, so the evaluator dispatches them itself.
pub(super) fn register(registry: &mut FunctionRegistry) {
    for class in EntityClass::ALL.iter().filter(|c| c.has_user_code()) {
        registry.insert(&class.lookup_function_name(), NativeKind::Lookup(*class));
    }
    registry.insert("get_relation_by_user_code", NativeKind::RelationLookup);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_kinds_carry_their_class() {
        let registry = FunctionRegistry::with_defaults();
        let f = registry.get("get_currency_by_user_code").unwrap();
        assert!(matches!(f.kind, NativeKind::Lookup(EntityClass::Currency)));
        let f = registry.get("get_account_type_by_user_code").unwrap();
        assert!(matches!(f.kind, NativeKind::Lookup(EntityClass::AccountType)));
        let f = registry.get("get_transaction_type_by_user_code").unwrap();
        assert!(matches!(f.kind, NativeKind::Lookup(EntityClass::TransactionType)));
    }
}
