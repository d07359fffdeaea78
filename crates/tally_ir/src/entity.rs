use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::to_snake_case;

/// Domain entity classes the booking engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityClass {
    Account,
    AccountType,
    Counterparty,
    Responsible,
    Portfolio,
    Instrument,
    InstrumentType,
    Currency,
    Strategy1,
    Strategy2,
    Strategy3,
    PricingPolicy,
    PricingCondition,
    Periodicity,
    AccrualCalculationModel,
    PaymentSizeDetail,
    EventClass,
    NotificationClass,
    TransactionClass,
    TransactionType,
    Transaction,
    ComplexTransaction,
    FactorSchedule,
    ManualPricingFormula,
    AccrualCalculationSchedule,
    EventSchedule,
    EventScheduleAction,
}

impl EntityClass {
    pub const ALL: [EntityClass; 27] = [
        EntityClass::Account,
        EntityClass::AccountType,
        EntityClass::Counterparty,
        EntityClass::Responsible,
        EntityClass::Portfolio,
        EntityClass::Instrument,
        EntityClass::InstrumentType,
        EntityClass::Currency,
        EntityClass::Strategy1,
        EntityClass::Strategy2,
        EntityClass::Strategy3,
        EntityClass::PricingPolicy,
        EntityClass::PricingCondition,
        EntityClass::Periodicity,
        EntityClass::AccrualCalculationModel,
        EntityClass::PaymentSizeDetail,
        EntityClass::EventClass,
        EntityClass::NotificationClass,
        EntityClass::TransactionClass,
        EntityClass::TransactionType,
        EntityClass::Transaction,
        EntityClass::ComplexTransaction,
        EntityClass::FactorSchedule,
        EntityClass::ManualPricingFormula,
        EntityClass::AccrualCalculationSchedule,
        EntityClass::EventSchedule,
        EntityClass::EventScheduleAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Account => "Account",
            EntityClass::AccountType => "AccountType",
            EntityClass::Counterparty => "Counterparty",
            EntityClass::Responsible => "Responsible",
            EntityClass::Portfolio => "Portfolio",
            EntityClass::Instrument => "Instrument",
            EntityClass::InstrumentType => "InstrumentType",
            EntityClass::Currency => "Currency",
            EntityClass::Strategy1 => "Strategy1",
            EntityClass::Strategy2 => "Strategy2",
            EntityClass::Strategy3 => "Strategy3",
            EntityClass::PricingPolicy => "PricingPolicy",
            EntityClass::PricingCondition => "PricingCondition",
            EntityClass::Periodicity => "Periodicity",
            EntityClass::AccrualCalculationModel => "AccrualCalculationModel",
            EntityClass::PaymentSizeDetail => "PaymentSizeDetail",
            EntityClass::EventClass => "EventClass",
            EntityClass::NotificationClass => "NotificationClass",
            EntityClass::TransactionClass => "TransactionClass",
            EntityClass::TransactionType => "TransactionType",
            EntityClass::Transaction => "Transaction",
            EntityClass::ComplexTransaction => "ComplexTransaction",
            EntityClass::FactorSchedule => "FactorSchedule",
            EntityClass::ManualPricingFormula => "ManualPricingFormula",
            EntityClass::AccrualCalculationSchedule => "AccrualCalculationSchedule",
            EntityClass::EventSchedule => "EventSchedule",
            EntityClass::EventScheduleAction => "EventScheduleAction",
        }
    }

    /// Accepts `Instrument`, `instrument` or the dotted `instruments.instrument` form.
    pub fn from_content_type(content_type: &str) -> Option<EntityClass> {
        let model = content_type.rsplit('.').next().unwrap_or(content_type);
        let wanted: String = model.chars().filter(|c| *c != '_').flat_map(char::to_lowercase).collect();
        EntityClass::ALL
            .iter()
            .copied()
            .find(|class| class.as_str().to_lowercase() == wanted)
    }

    /// Classes addressable by a tenant-scoped user code.
    pub fn has_user_code(&self) -> bool {
        !matches!(
            self,
            EntityClass::Transaction
                | EntityClass::ComplexTransaction
                | EntityClass::FactorSchedule
                | EntityClass::ManualPricingFormula
                | EntityClass::AccrualCalculationSchedule
                | EntityClass::EventSchedule
                | EntityClass::EventScheduleAction
        )
    }

    /// Name of the expression function returning a record view by user code.
    pub fn lookup_function_name(&self) -> String {
        format!("get_{}_by_user_code", to_snake_case(self.as_str()))
    }

    /// Single-valued relation fields stored as ids on records of this class.
    pub fn relation_fields(&self) -> &'static [(&'static str, EntityClass)] {
        match self {
            EntityClass::Account => &[("type", EntityClass::AccountType)],
            EntityClass::Instrument => &[
                ("instrument_type", EntityClass::InstrumentType),
                ("pricing_currency", EntityClass::Currency),
                ("accrued_currency", EntityClass::Currency),
                ("payment_size_detail", EntityClass::PaymentSizeDetail),
                ("pricing_condition", EntityClass::PricingCondition),
            ],
            EntityClass::Transaction => &[
                ("complex_transaction", EntityClass::ComplexTransaction),
                ("transaction_class", EntityClass::TransactionClass),
                ("instrument", EntityClass::Instrument),
                ("transaction_currency", EntityClass::Currency),
                ("settlement_currency", EntityClass::Currency),
                ("portfolio", EntityClass::Portfolio),
                ("account_position", EntityClass::Account),
                ("account_cash", EntityClass::Account),
                ("account_interim", EntityClass::Account),
                ("strategy1_position", EntityClass::Strategy1),
                ("strategy1_cash", EntityClass::Strategy1),
                ("strategy2_position", EntityClass::Strategy2),
                ("strategy2_cash", EntityClass::Strategy2),
                ("strategy3_position", EntityClass::Strategy3),
                ("strategy3_cash", EntityClass::Strategy3),
                ("linked_instrument", EntityClass::Instrument),
                ("allocation_balance", EntityClass::Instrument),
                ("allocation_pl", EntityClass::Instrument),
                ("responsible", EntityClass::Responsible),
                ("counterparty", EntityClass::Counterparty),
            ],
            EntityClass::ComplexTransaction => &[("transaction_type", EntityClass::TransactionType)],
            EntityClass::FactorSchedule => &[("instrument", EntityClass::Instrument)],
            EntityClass::ManualPricingFormula => &[
                ("instrument", EntityClass::Instrument),
                ("pricing_policy", EntityClass::PricingPolicy),
            ],
            EntityClass::AccrualCalculationSchedule => &[
                ("instrument", EntityClass::Instrument),
                ("accrual_calculation_model", EntityClass::AccrualCalculationModel),
                ("periodicity", EntityClass::Periodicity),
            ],
            EntityClass::EventSchedule => &[
                ("instrument", EntityClass::Instrument),
                ("periodicity", EntityClass::Periodicity),
                ("notification_class", EntityClass::NotificationClass),
                ("event_class", EntityClass::EventClass),
            ],
            EntityClass::EventScheduleAction => &[
                ("event_schedule", EntityClass::EventSchedule),
                ("transaction_type_from_instrument_type", EntityClass::TransactionType),
            ],
            _ => &[],
        }
    }

    /// Multi-valued relations: a list of ids of the target class.
    pub fn relation_list_fields(&self) -> &'static [(&'static str, EntityClass)] {
        match self {
            EntityClass::ComplexTransaction => &[("transactions", EntityClass::Transaction)],
            _ => &[],
        }
    }

    pub fn relation_target(&self, field: &str) -> Option<EntityClass> {
        self.relation_fields()
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, class)| *class)
    }

    pub fn relation_list_target(&self, field: &str) -> Option<EntityClass> {
        self.relation_list_fields()
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, class)| *class)
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed pointer to a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub class: EntityClass,
    pub id: String,
}

impl EntityRef {
    pub fn new(class: EntityClass, id: impl Into<String>) -> Self {
        Self { class, id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_forms() {
        assert_eq!(EntityClass::from_content_type("Currency"), Some(EntityClass::Currency));
        assert_eq!(
            EntityClass::from_content_type("instruments.instrument_type"),
            Some(EntityClass::InstrumentType)
        );
        assert_eq!(
            EntityClass::from_content_type("strategies.strategy1"),
            Some(EntityClass::Strategy1)
        );
        assert_eq!(EntityClass::from_content_type("users.member"), None);
    }

    #[test]
    fn test_lookup_function_name() {
        assert_eq!(
            EntityClass::InstrumentType.lookup_function_name(),
            "get_instrument_type_by_user_code"
        );
        assert_eq!(EntityClass::Strategy2.lookup_function_name(), "get_strategy2_by_user_code");
    }
}
