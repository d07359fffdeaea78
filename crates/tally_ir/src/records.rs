use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::EntityRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplexTransactionStatus {
    #[default]
    Production,
    Pending,
    Ignore,
}

/// Header recorded by one run of a transaction type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComplexTransaction {
    pub id: String,
    pub code: i64,
    pub transaction_type: String,
    pub date: Option<NaiveDate>,
    pub status: ComplexTransactionStatus,
    pub is_locked: bool,
    pub is_canceled: bool,
    pub is_deleted: bool,
    pub transaction_unique_code: Option<String>,
    pub text: String,
    pub transactions: Vec<String>,
    /// Resolved input values by input name, relations projected to user codes.
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub recon_fields: BTreeMap<String, serde_json::Value>,
    pub user_text: BTreeMap<u8, String>,
    pub user_number: BTreeMap<u8, f64>,
    pub user_date: BTreeMap<u8, NaiveDate>,
    pub execution_log: String,
    /// Entity produced by each action order on the last run.
    pub action_outputs: BTreeMap<i32, EntityRef>,
}

/// A single ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Transaction {
    pub id: String,
    pub complex_transaction: String,
    pub complex_transaction_order: i32,
    pub transaction_code: i64,
    pub transaction_class: Option<String>,
    pub instrument: Option<String>,
    pub transaction_currency: Option<String>,
    pub settlement_currency: Option<String>,
    pub portfolio: Option<String>,
    pub account_position: Option<String>,
    pub account_cash: Option<String>,
    pub account_interim: Option<String>,
    pub strategy1_position: Option<String>,
    pub strategy1_cash: Option<String>,
    pub strategy2_position: Option<String>,
    pub strategy2_cash: Option<String>,
    pub strategy3_position: Option<String>,
    pub strategy3_cash: Option<String>,
    pub linked_instrument: Option<String>,
    pub allocation_balance: Option<String>,
    pub allocation_pl: Option<String>,
    pub responsible: Option<String>,
    pub counterparty: Option<String>,
    pub position_size_with_sign: f64,
    pub cash_consideration: f64,
    pub principal_with_sign: f64,
    pub carry_with_sign: f64,
    pub overheads_with_sign: f64,
    pub reference_fx_rate: f64,
    pub factor: f64,
    pub trade_price: f64,
    pub position_amount: f64,
    pub principal_amount: f64,
    pub carry_amount: f64,
    pub overheads: f64,
    pub accounting_date: Option<NaiveDate>,
    pub cash_date: Option<NaiveDate>,
    pub transaction_date: Option<NaiveDate>,
    pub notes: String,
    pub user_text_1: String,
    pub user_text_2: String,
    pub user_text_3: String,
    pub user_number_1: f64,
    pub user_number_2: f64,
    pub user_number_3: f64,
    pub user_date_1: Option<NaiveDate>,
    pub user_date_2: Option<NaiveDate>,
    pub user_date_3: Option<NaiveDate>,
    pub is_canceled: bool,
    pub is_locked: bool,
}

impl ComplexTransaction {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Transaction {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_form() {
        let json = serde_json::to_value(ComplexTransactionStatus::Pending).unwrap();
        assert_eq!(json, serde_json::json!("pending"));
    }

    #[test]
    fn test_transaction_defaults_from_partial_record() {
        let tx: Transaction = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "cash_consideration": 1000.0,
            "accounting_date": "2024-01-15"
        }))
        .unwrap();
        assert_eq!(tx.cash_consideration, 1000.0);
        assert_eq!(tx.accounting_date, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert!(tx.instrument.is_none());
    }
}
