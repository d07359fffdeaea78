use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tally_common::FixedClock;
use tally_ir::{
    ActionKind, ComplexTransactionStatus, EntityClass, ExecuteCommandAction, InstrumentAction, RebookReaction,
    RelationSource, TransactionAction, TransactionType, TransactionTypeAction, TransactionTypeInput,
    UniqueCodeOption, ValueType,
};
use tally_runtime::{
    BookRequest, EngineConfig, Engine, EvalError, EvalLimits, MemoryDataStore, Persistence, PersistenceError,
    RecordSource, RuntimeContext, RuntimeError, SqliteDataStore,
};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(day(2024, 1, 15).and_hms_opt(10, 0, 0).unwrap()))
}

async fn seed(store: &dyn Persistence) {
    let fixtures = [
        (EntityClass::Currency, json!({"id": "c-usd", "user_code": "USD"})),
        (EntityClass::Currency, json!({"id": "c-eur", "user_code": "EUR"})),
        (EntityClass::Portfolio, json!({"id": "p-1", "user_code": "P1"})),
        (EntityClass::TransactionClass, json!({"id": "tc-in", "user_code": "cash_inflow"})),
        (EntityClass::TransactionClass, json!({"id": "tc-buy", "user_code": "buy"})),
    ];
    for (class, record) in fixtures {
        store.insert(class, record).await.unwrap();
    }
}

async fn memory_engine() -> (MemoryDataStore, Engine) {
    let store = MemoryDataStore::new();
    seed(&store).await;
    let engine = Engine::new(Arc::new(store.clone())).with_clock(clock());
    (store, engine)
}

fn deposit() -> TransactionType {
    let mut currency = TransactionTypeInput::relation("currency", EntityClass::Currency);
    currency.order = 1;
    let mut portfolio = TransactionTypeInput::relation("portfolio", EntityClass::Portfolio);
    portfolio.order = 2;
    let mut deposit_date = TransactionTypeInput::new("deposit_date", ValueType::Date);
    deposit_date.order = 3;
    TransactionType {
        user_code: "deposit".into(),
        display_expr: "'Deposit of ' + currency.user_code".into(),
        inputs: vec![
            TransactionTypeInput::new("amount", ValueType::Number).required(),
            currency,
            portfolio,
            deposit_date,
        ],
        actions: vec![TransactionTypeAction::new(
            0,
            ActionKind::Transaction(
                TransactionAction {
                    cash_consideration: "amount".into(),
                    accounting_date: "deposit_date".into(),
                    cash_date: "deposit_date".into(),
                    ..Default::default()
                }
                .relation("transaction_class", RelationSource::UserCode("cash_inflow".into()))
                .relation("settlement_currency", RelationSource::Input("currency".into()))
                .relation("portfolio", RelationSource::Input("portfolio".into())),
            ),
        )],
        ..Default::default()
    }
}

fn deposit_values() -> serde_json::Value {
    json!({"amount": 1000.0, "currency": "USD", "portfolio": "P1", "deposit_date": "2024-01-15"})
}

fn buy() -> TransactionType {
    let mut quantity = TransactionTypeInput::new("quantity", ValueType::Number);
    quantity.order = 1;
    let mut price = TransactionTypeInput::new("price", ValueType::Number);
    price.order = 2;
    TransactionType {
        user_code: "buy".into(),
        inputs: vec![
            TransactionTypeInput::relation("currency", EntityClass::Currency),
            quantity,
            price,
        ],
        actions: vec![
            TransactionTypeAction::new(
                0,
                ActionKind::Instrument(InstrumentAction {
                    user_code: "'NEW-ISIN'".into(),
                    name: "'New bond ' + currency.user_code".into(),
                    default_price: "price".into(),
                    relations: [("pricing_currency".to_string(), RelationSource::Input("currency".into()))].into(),
                    ..Default::default()
                }),
            )
            .on_rebook(RebookReaction::Skip),
            TransactionTypeAction::new(
                1,
                ActionKind::Transaction(
                    TransactionAction {
                        position_size_with_sign: "quantity".into(),
                        cash_consideration: "-quantity * price".into(),
                        trade_price: "price".into(),
                        ..Default::default()
                    }
                    .relation("instrument", RelationSource::Phantom(0))
                    .relation("transaction_class", RelationSource::UserCode("buy".into()))
                    .relation("settlement_currency", RelationSource::Input("currency".into())),
                ),
            ),
        ],
        ..Default::default()
    }
}

fn cash_line(order: i32, amount: &str) -> TransactionTypeAction {
    TransactionTypeAction::new(
        order,
        ActionKind::Transaction(TransactionAction {
            cash_consideration: amount.into(),
            ..Default::default()
        }),
    )
}

fn unique(option: UniqueCodeOption) -> TransactionType {
    TransactionType {
        user_code: "unique".into(),
        transaction_unique_code_expr: "\"UC-1\"".into(),
        transaction_unique_code_options: option,
        actions: vec![cash_line(0, "1")],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cash_deposit() {
    let (store, engine) = memory_engine().await;
    store
        .insert(EntityClass::TransactionType, serde_json::to_value(deposit()).unwrap())
        .await
        .unwrap();

    let result = engine
        .book(BookRequest::new("deposit").with_values(deposit_values()))
        .await
        .unwrap();

    assert!(!result.has_errors, "{:?}", result);
    assert!(result.committed);
    let header = result.complex_transaction.as_ref().unwrap();
    assert_eq!(header.code, 1);
    assert_eq!(header.text, "Deposit of USD");
    assert_eq!(header.date, Some(day(2024, 1, 15)));
    assert_eq!(header.inputs["currency"], json!("c-usd"));
    assert_eq!(header.transactions.len(), 1);

    let tx = &result.transactions[0];
    assert_eq!(tx.cash_consideration, 1000.0);
    assert_eq!(tx.settlement_currency.as_deref(), Some("c-usd"));
    assert_eq!(tx.portfolio.as_deref(), Some("p-1"));
    assert_eq!(tx.transaction_class.as_deref(), Some("tc-in"));
    assert_eq!(tx.accounting_date, Some(day(2024, 1, 15)));
    assert_eq!(tx.transaction_date, Some(day(2024, 1, 15)));
    assert_eq!(tx.complex_transaction, header.id);
    assert_eq!(tx.transaction_code, header.code);

    assert_eq!(store.count(EntityClass::Transaction), 1);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 1);
    assert!(result.execution_log.iter().all(|l| l.starts_with("[2024-01-15 10:00:00] ")));
}

#[tokio::test]
async fn test_cash_deposit_on_sqlite() {
    let store = SqliteDataStore::connect("sqlite::memory:").await.unwrap();
    seed(&store).await;
    let store: Arc<dyn Persistence> = Arc::new(store);
    let engine = Engine::new(store.clone()).with_clock(clock());

    let first = engine
        .book(BookRequest::inline(deposit()).with_values(deposit_values()))
        .await
        .unwrap();
    let second = engine
        .book(BookRequest::inline(deposit()).with_values(deposit_values()))
        .await
        .unwrap();
    assert!(first.committed && second.committed);
    assert_eq!(second.complex_transaction.unwrap().code, 2);

    let tx_id = &first.transactions[0].id;
    let stored = store.get(EntityClass::Transaction, tx_id).await.unwrap().unwrap();
    assert_eq!(stored["cash_consideration"], json!(1000.0));
}

#[tokio::test]
async fn test_missing_inputs_stop_the_run() {
    let (store, engine) = memory_engine().await;
    let result = engine
        .book(BookRequest::inline(deposit()).with_values(json!({"currency": "GBP", "deposit_date": "2024-01-15"})))
        .await
        .unwrap();
    assert!(result.has_errors);
    assert!(!result.committed);
    assert_eq!(result.value_errors["amount"], vec!["This field is required.".to_string()]);
    assert_eq!(result.value_errors["currency"], vec!["Currency 'GBP' does not exist.".to_string()]);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 0);
}

#[tokio::test]
async fn test_buy_creates_instrument_and_rebook_reuses_it() {
    let (store, engine) = memory_engine().await;
    let values = json!({"currency": "USD", "quantity": 10, "price": 101.5});

    let first = engine
        .book(BookRequest::inline(buy()).with_values(values.clone()))
        .await
        .unwrap();
    assert!(!first.has_errors, "{:?}", first);
    assert_eq!(first.instruments.len(), 1);
    let instrument = &first.instruments[0];
    assert_eq!(instrument["user_code"], "NEW-ISIN");
    assert_eq!(instrument["name"], "New bond USD");
    assert_eq!(instrument["pricing_currency"], "c-usd");
    assert_eq!(instrument["default_price"], json!(101.5));
    let instrument_id = instrument["id"].as_str().unwrap().to_string();

    let tx = &first.transactions[0];
    assert_eq!(tx.instrument.as_deref(), Some(instrument_id.as_str()));
    assert_eq!(tx.cash_consideration, -1015.0);
    assert_eq!(tx.cash_date, Some(day(2024, 1, 15)));

    let code = first.complex_transaction.as_ref().unwrap().code;
    let second = engine.book(BookRequest::inline(buy()).rebook(code)).await.unwrap();
    assert!(second.committed, "{:?}", second);
    assert_eq!(second.complex_transaction.as_ref().unwrap().code, code);
    assert_eq!(second.instruments[0]["id"], json!(instrument_id));
    assert_eq!(second.transactions[0].instrument.as_deref(), Some(instrument_id.as_str()));
    assert_eq!(second.transactions[0].id, tx.id);

    assert_eq!(store.count(EntityClass::Instrument), 1);
    assert_eq!(store.count(EntityClass::Transaction), 1);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 1);
}

#[tokio::test]
async fn test_instrument_action_updates_existing_instrument() {
    let (store, engine) = memory_engine().await;
    store
        .insert(
            EntityClass::Instrument,
            json!({"id": "i-old", "user_code": "NEW-ISIN", "name": "Old", "notes": "keep"}),
        )
        .await
        .unwrap();
    let result = engine
        .book(BookRequest::inline(buy()).with_values(json!({"currency": "EUR", "quantity": 1, "price": 2})))
        .await
        .unwrap();
    assert!(result.committed);
    let stored = store.get(EntityClass::Instrument, "i-old").await.unwrap().unwrap();
    assert_eq!(stored["name"], "New bond EUR");
    assert_eq!(stored["notes"], "keep");
    assert_eq!(result.transactions[0].instrument.as_deref(), Some("i-old"));
    assert_eq!(store.count(EntityClass::Instrument), 1);
}

#[tokio::test]
async fn test_default_expression_chain() {
    let (store, engine) = memory_engine().await;
    let mut settlement = TransactionTypeInput::new("settlement_date", ValueType::Date)
        .with_expr("accounting_date + relative_delta(days=2)");
    settlement.order = 1;
    let tt = TransactionType {
        user_code: "settle".into(),
        inputs: vec![TransactionTypeInput::new("accounting_date", ValueType::Date), settlement],
        actions: vec![TransactionTypeAction::new(
            0,
            ActionKind::Transaction(TransactionAction {
                accounting_date: "accounting_date".into(),
                cash_date: "settlement_date".into(),
                ..Default::default()
            }),
        )],
        ..Default::default()
    };

    let derived = engine
        .book(BookRequest::inline(tt.clone()).with_value("accounting_date", json!("2024-01-15")))
        .await
        .unwrap();
    assert_eq!(derived.values["settlement_date"], json!("2024-01-17"));
    assert_eq!(derived.transactions[0].cash_date, Some(day(2024, 1, 17)));
    assert_eq!(derived.transactions[0].transaction_date, Some(day(2024, 1, 15)));

    let explicit = engine
        .book(
            BookRequest::inline(tt.clone())
                .with_value("accounting_date", json!("2024-01-15"))
                .with_value("settlement_date", json!("2024-02-01")),
        )
        .await
        .unwrap();
    assert_eq!(explicit.transactions[0].cash_date, Some(day(2024, 2, 1)));

    let recalculated = engine
        .book(
            BookRequest::inline(tt)
                .with_value("accounting_date", json!("2024-03-01"))
                .with_value("settlement_date", json!("2024-02-01"))
                .recalculate(["settlement_date"]),
        )
        .await
        .unwrap();
    assert!(!recalculated.committed);
    assert!(recalculated.complex_transaction.is_none());
    assert_eq!(recalculated.values["settlement_date"], json!("2024-03-03"));
    assert_eq!(store.count(EntityClass::ComplexTransaction), 2);
}

#[tokio::test]
async fn test_condition_gating() {
    let (store, engine) = memory_engine().await;
    let tt = TransactionType {
        user_code: "gated".into(),
        inputs: vec![TransactionTypeInput::new("amount", ValueType::Number)],
        actions: vec![cash_line(0, "amount").when("amount > 0"), cash_line(1, "5")],
        ..Default::default()
    };

    let skipped = engine
        .book(BookRequest::inline(tt.clone()).with_value("amount", json!(-10)))
        .await
        .unwrap();
    assert!(!skipped.has_errors);
    let header = skipped.complex_transaction.as_ref().unwrap();
    assert_eq!(header.transactions.len(), 1);
    assert!(!header.action_outputs.contains_key(&0));
    assert_eq!(skipped.transactions[0].complex_transaction_order, 1);
    assert_eq!(skipped.transactions[0].cash_consideration, 5.0);

    // A rebook that now passes the condition adds the line; flipping back removes it.
    let code = header.code;
    let both = engine
        .book(BookRequest::inline(tt.clone()).rebook(code).with_value("amount", json!(10)))
        .await
        .unwrap();
    assert_eq!(both.transactions.len(), 2);
    assert_eq!(store.count(EntityClass::Transaction), 2);

    let again = engine
        .book(BookRequest::inline(tt).rebook(code).with_value("amount", json!(-1)))
        .await
        .unwrap();
    assert_eq!(again.transactions.len(), 1);
    assert_eq!(store.count(EntityClass::Transaction), 1);
}

#[tokio::test]
async fn test_unique_code_collision_is_reported() {
    let (store, engine) = memory_engine().await;
    let first = engine.book(BookRequest::inline(unique(UniqueCodeOption::Error))).await.unwrap();
    assert_eq!(
        first.complex_transaction.as_ref().unwrap().transaction_unique_code.as_deref(),
        Some("UC-1")
    );

    let second = engine.book(BookRequest::inline(unique(UniqueCodeOption::Error))).await.unwrap();
    assert!(!second.committed);
    assert!(second.is_conflict());
    assert_eq!(
        second.general_errors[0].message,
        "unique constraint violated: transaction_unique_code = 'UC-1'"
    );
    assert_eq!(store.count(EntityClass::ComplexTransaction), 1);
    assert_eq!(store.count(EntityClass::Transaction), 1);
}

#[tokio::test]
async fn test_unique_code_append_number() {
    let (_store, engine) = memory_engine().await;
    let mut codes = Vec::new();
    for _ in 0..3 {
        let result = engine
            .book(BookRequest::inline(unique(UniqueCodeOption::AppendNumber)))
            .await
            .unwrap();
        codes.push(result.complex_transaction.unwrap().transaction_unique_code.unwrap());
    }
    assert_eq!(codes, ["UC-1", "UC-1-2", "UC-1-3"]);
}

#[tokio::test]
async fn test_unique_code_other_policies() {
    let (store, engine) = memory_engine().await;
    let first = engine.book(BookRequest::inline(unique(UniqueCodeOption::Error))).await.unwrap();
    let first_code = first.complex_transaction.unwrap().code;

    let skipped = engine.book(BookRequest::inline(unique(UniqueCodeOption::Skip))).await.unwrap();
    assert!(!skipped.committed);
    assert_eq!(skipped.general_errors[0].reason, Some(410));

    let anonymous = engine
        .book(BookRequest::inline(unique(UniqueCodeOption::BookWithoutUniqueCode)))
        .await
        .unwrap();
    assert!(anonymous.committed);
    assert_eq!(anonymous.complex_transaction.unwrap().transaction_unique_code, None);

    let overwritten = engine
        .book(BookRequest::inline(unique(UniqueCodeOption::Overwrite)))
        .await
        .unwrap();
    assert!(overwritten.committed, "{:?}", overwritten);
    let header = overwritten.complex_transaction.unwrap();
    assert_eq!(header.code, first_code);
    assert_eq!(header.transaction_unique_code.as_deref(), Some("UC-1"));
    assert_eq!(store.count(EntityClass::ComplexTransaction), 2);
}

#[tokio::test]
async fn test_time_bound_aborts_the_run() {
    let (store, engine) = memory_engine().await;
    let engine = engine.with_config(EngineConfig {
        limits: EvalLimits::default().with_max_time(Duration::from_millis(50)),
        ..Default::default()
    });
    let tt = TransactionType {
        user_code: "spin".into(),
        actions: vec![
            cash_line(0, "1"),
            TransactionTypeAction::new(
                1,
                ActionKind::ExecuteCommand(ExecuteCommandAction {
                    expr: "while True:\n    pass".into(),
                }),
            ),
        ],
        ..Default::default()
    };
    let err = engine.book(BookRequest::inline(tt)).await.unwrap_err();
    assert_eq!(err, RuntimeError::Eval(EvalError::TimeLimitExceeded));
    assert_eq!(store.count(EntityClass::Transaction), 0);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 0);
}

#[tokio::test]
async fn test_pending_status_skips_ledger_lines() {
    let (store, engine) = memory_engine().await;
    let result = engine
        .book(
            BookRequest::inline(buy())
                .with_values(json!({"currency": "USD", "quantity": 1, "price": 1}))
                .with_status(ComplexTransactionStatus::Pending),
        )
        .await
        .unwrap();
    assert!(result.committed);
    assert!(result.transactions.is_empty());
    assert_eq!(result.complex_transaction.unwrap().status, ComplexTransactionStatus::Pending);
    assert_eq!(store.count(EntityClass::Instrument), 1);
    assert_eq!(store.count(EntityClass::Transaction), 0);
}

#[tokio::test]
async fn test_cancel_previous_keeps_the_old_line_cancelled() {
    let (store, engine) = memory_engine().await;
    let tt = TransactionType {
        user_code: "cancelling".into(),
        actions: vec![cash_line(0, "7").on_rebook(RebookReaction::CancelPrevious)],
        ..Default::default()
    };
    let first = engine.book(BookRequest::inline(tt.clone())).await.unwrap();
    let old_id = first.transactions[0].id.clone();
    let code = first.complex_transaction.unwrap().code;

    let second = engine.book(BookRequest::inline(tt).rebook(code)).await.unwrap();
    assert!(second.committed);
    assert_ne!(second.transactions[0].id, old_id);
    assert_eq!(second.complex_transaction.unwrap().transactions, vec![second.transactions[0].id.clone()]);

    let old = store.get(EntityClass::Transaction, &old_id).await.unwrap().unwrap();
    assert_eq!(old["is_canceled"], json!(true));
    assert_eq!(store.count(EntityClass::Transaction), 2);
}

#[tokio::test]
async fn test_rebook_of_locked_header_fails_before_actions() {
    let (store, engine) = memory_engine().await;
    store
        .put(EntityClass::ComplexTransaction, json!({"id": "ct-1", "code": 40, "is_locked": true}))
        .unwrap();
    let err = engine
        .book(BookRequest::inline(unique(UniqueCodeOption::Error)).rebook(40))
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::Persistence(PersistenceError::Locked(40)));
    assert_eq!(store.count(EntityClass::Transaction), 0);

    let missing = engine
        .book(BookRequest::inline(unique(UniqueCodeOption::Error)).rebook(99))
        .await
        .unwrap_err();
    assert!(matches!(missing, RuntimeError::Persistence(PersistenceError::NotFound { .. })));
}

#[tokio::test]
async fn test_permissions_and_invalid_types_are_rejected() {
    let (_store, engine) = memory_engine().await;
    let engine = engine.with_gate(Arc::new(RuntimeContext {
        user_id: "clerk".into(),
        roles: vec![],
        permissions: vec!["book:deposit".into()],
    }));
    let denied = engine.book(BookRequest::inline(buy())).await.unwrap_err();
    assert!(matches!(denied, RuntimeError::PermissionDenied(_)));

    let mut broken = deposit();
    broken.actions[0].condition_expr = "amount >".into();
    let err = engine.book(BookRequest::inline(broken)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Schema(ref m) if m.starts_with("actions[0].condition_expr")));
}

#[tokio::test]
async fn test_ecosystem_defaults_fill_unset_relations() {
    let (_store, engine) = memory_engine().await;
    let engine = engine.with_config(EngineConfig {
        ecosystem_defaults: [
            (EntityClass::Currency, "EUR".to_string()),
            (EntityClass::Portfolio, "P1".to_string()),
        ]
        .into(),
        ..Default::default()
    });
    let tt = TransactionType {
        user_code: "bare".into(),
        actions: vec![cash_line(0, "1")],
        ..Default::default()
    };
    let result = engine.book(BookRequest::inline(tt)).await.unwrap();
    let tx = &result.transactions[0];
    assert_eq!(tx.settlement_currency.as_deref(), Some("c-eur"));
    assert_eq!(tx.transaction_currency.as_deref(), Some("c-eur"));
    assert_eq!(tx.portfolio.as_deref(), Some("p-1"));
    assert_eq!(tx.counterparty, None);
}
