use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_common::FixedClock;
use tally_ir::{
    ActionKind, EntityClass, InstrumentAction, RelationSource, TransactionAction, TransactionType,
    TransactionTypeAction, TransactionTypeInput, UniqueCodeOption, ValueType,
};
use tally_runtime::{
    BookRequest, CancelHandle, Engine, EngineConfig, MemoryDataStore, Persistence, PersistenceError, RuntimeError,
    SqliteDataStore, Value,
};

fn clock() -> Arc<FixedClock> {
    let now = chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    Arc::new(FixedClock(now))
}

async fn setup() -> (MemoryDataStore, Engine) {
    let store = MemoryDataStore::new();
    store
        .insert(EntityClass::Currency, json!({"id": "c-usd", "user_code": "USD"}))
        .await
        .unwrap();
    let engine = Engine::new(Arc::new(store.clone())).with_clock(clock());
    (store, engine)
}

fn line(order: i32, amount: &str) -> TransactionTypeAction {
    TransactionTypeAction::new(
        order,
        ActionKind::Transaction(TransactionAction {
            cash_consideration: amount.into(),
            ..Default::default()
        }),
    )
}

fn two_lines(second: &str) -> TransactionType {
    TransactionType {
        user_code: "two_lines".into(),
        actions: vec![line(0, "100"), line(1, second)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_failed_action_leaves_store_untouched() {
    let (store, engine) = setup().await;
    let result = engine
        .book(BookRequest::inline(two_lines("undefined_name")))
        .await
        .unwrap();

    assert!(result.has_errors);
    assert!(!result.committed);
    assert!(result.complex_transaction.is_none());
    assert_eq!(
        result.transactions_errors[&1],
        vec![
            "cash_consideration: Invalid expression \"undefined_name\". NameNotDefined: name 'undefined_name' is not defined"
                .to_string()
        ]
    );
    assert_eq!(store.count(EntityClass::Transaction), 0);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 0);
}

#[tokio::test]
async fn test_lenient_mode_commits_what_succeeded() {
    let (store, engine) = setup().await;
    let engine = engine.with_config(EngineConfig {
        strict: false,
        ..Default::default()
    });
    let result = engine
        .book(BookRequest::inline(two_lines("undefined_name")))
        .await
        .unwrap();

    assert!(result.has_errors);
    assert!(result.committed);
    assert_eq!(result.transactions.len(), 1);
    assert_eq!(result.transactions[0].complex_transaction_order, 0);
    assert_eq!(store.count(EntityClass::Transaction), 1);
}

#[tokio::test]
async fn test_booking_is_deterministic() {
    let (_store, engine) = setup().await;
    let tt = TransactionType {
        user_code: "fee".into(),
        display_expr: "'fee ' + str(round(amount * 0.015, 2))".into(),
        inputs: vec![TransactionTypeInput::new("amount", ValueType::Number)],
        actions: vec![line(0, "-amount * 0.015")],
        ..Default::default()
    };
    let request = BookRequest::inline(tt).with_value("amount", json!(1234.5));
    let a = engine.book(request.clone()).await.unwrap();
    let b = engine.book(request).await.unwrap();

    let (ha, hb) = (a.complex_transaction.unwrap(), b.complex_transaction.unwrap());
    assert_eq!(ha.text, hb.text);
    assert_eq!(ha.text, "fee 18.52");
    assert_eq!(ha.inputs, hb.inputs);
    assert_eq!(a.transactions[0].cash_consideration, b.transactions[0].cash_consideration);
    assert_ne!(ha.code, hb.code);
}

/// Books the same unique code from several tasks at once and returns how many
/// of them committed.
async fn race_for_unique_code(engine: Arc<Engine>) -> usize {
    let tt = TransactionType {
        user_code: "once".into(),
        transaction_unique_code_expr: "'ONCE'".into(),
        transaction_unique_code_options: UniqueCodeOption::Error,
        actions: vec![line(0, "1")],
        ..Default::default()
    };
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let request = BookRequest::inline(tt.clone());
            tokio::spawn(async move { engine.book(request).await })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) if result.committed => committed += 1,
            Ok(result) => assert!(result.is_conflict(), "{:?}", result.general_errors),
            Err(err) => assert!(
                matches!(err, RuntimeError::Persistence(PersistenceError::Conflict { .. })),
                "{}",
                err
            ),
        }
    }
    committed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unique_codes_commit_once() {
    let (store, engine) = setup().await;
    assert_eq!(race_for_unique_code(Arc::new(engine)).await, 1);
    assert_eq!(store.count(EntityClass::ComplexTransaction), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unique_codes_commit_once_on_sqlite() {
    let path = std::env::temp_dir().join(format!("tally_race_{}.db", uuid::Uuid::new_v4()));
    let store = Arc::new(
        SqliteDataStore::connect(&format!("sqlite://{}", path.display()))
            .await
            .unwrap(),
    );
    let engine = Engine::new(store.clone()).with_clock(clock());

    assert_eq!(race_for_unique_code(Arc::new(engine)).await, 1);
    let holder = store.find_by_unique_code("ONCE").await.unwrap().unwrap();
    assert_eq!(holder["transaction_unique_code"], "ONCE");

    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn test_cancelled_run_commits_nothing() {
    let (store, engine) = setup().await;
    let cancel = CancelHandle::new();
    cancel.cancel();
    let err = engine
        .book_with_cancel(BookRequest::inline(two_lines("1")), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, RuntimeError::Persistence(PersistenceError::Cancelled));
    assert_eq!(store.count(EntityClass::Transaction), 0);
}

#[tokio::test]
async fn test_failing_default_is_reported_per_input() {
    let (_store, engine) = setup().await;
    let tt = TransactionType {
        user_code: "broken_default".into(),
        inputs: vec![TransactionTypeInput::new("price", ValueType::Number).with_expr("1 / 0")],
        actions: vec![line(0, "price")],
        ..Default::default()
    };
    let result = engine.book(BookRequest::inline(tt)).await.unwrap();
    assert!(!result.committed);
    let errors = &result.value_errors["price"];
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Invalid expression \"1 / 0\". "), "{}", errors[0]);
}

#[tokio::test]
async fn test_unknown_transaction_type() {
    let (_store, engine) = setup().await;
    let err = engine.book(BookRequest::new("nope")).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Persistence(PersistenceError::NotFound {
            class: EntityClass::TransactionType,
            ..
        })
    ));
    let err = engine.book(BookRequest::new("")).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Request(_)));
}

#[tokio::test]
async fn test_engine_eval_reads_the_store() {
    let (_store, engine) = setup().await;
    let names = BTreeMap::from([("code".to_string(), Value::Str("USD".into()))]);
    let value = engine
        .eval("get_currency_by_user_code(code).id", names)
        .await
        .unwrap();
    assert_eq!(value, Value::Str("c-usd".into()));
}

#[test]
fn test_validation_reports_phantom_misuse() {
    let tt = TransactionType {
        user_code: "phantoms".into(),
        actions: vec![
            TransactionTypeAction::new(
                0,
                ActionKind::Transaction(
                    TransactionAction::default().relation("instrument", RelationSource::Phantom(1)),
                ),
            ),
            TransactionTypeAction::new(
                1,
                ActionKind::Instrument(InstrumentAction {
                    user_code: "'X'".into(),
                    ..Default::default()
                }),
            ),
            TransactionTypeAction::new(
                2,
                ActionKind::Transaction(
                    TransactionAction::default().relation("portfolio", RelationSource::Phantom(1)),
                ),
            ),
        ],
        ..Default::default()
    };
    let report = tally_runtime::validate(&tt);
    assert!(!report.is_valid());
    insta::assert_snapshot!(
        report.summary(),
        @"actions[0].instrument: action 0 field 'instrument' references action 1 which does not run before it; actions[2].portfolio: action 2 field 'portfolio' expects Portfolio but action 1 produces Instrument"
    );
}

#[tokio::test]
async fn test_rebook_with_same_inputs_reproduces_transactions() {
    let (store, engine) = setup().await;
    let tt = TransactionType {
        user_code: "round_trip".into(),
        inputs: vec![
            TransactionTypeInput::new("amount", ValueType::Number),
            TransactionTypeInput::relation("currency", EntityClass::Currency),
        ],
        actions: vec![
            TransactionTypeAction::new(
                0,
                ActionKind::Transaction(
                    TransactionAction {
                        cash_consideration: "amount".into(),
                        notes: "'leg ' + currency.user_code".into(),
                        ..Default::default()
                    }
                    .relation("settlement_currency", RelationSource::Input("currency".into())),
                ),
            ),
            line(1, "-amount / 2"),
        ],
        ..Default::default()
    };
    let booked = engine
        .book(BookRequest::inline(tt.clone()).with_values(json!({"amount": 80, "currency": "USD"})))
        .await
        .unwrap();
    let code = booked.complex_transaction.as_ref().unwrap().code;

    let rebooked = engine
        .book(BookRequest::inline(tt).rebook(code).with_values(json!({"amount": 80, "currency": "USD"})))
        .await
        .unwrap();
    assert!(rebooked.committed);
    assert_eq!(rebooked.transactions, booked.transactions);
    assert_eq!(store.count(EntityClass::Transaction), 2);
}

#[tokio::test]
async fn test_inactive_or_deleted_type_is_not_booked() {
    let (store, engine) = setup().await;
    let mut inactive = two_lines("1");
    inactive.is_active = false;
    let mut deleted = two_lines("1");
    deleted.is_deleted = true;

    for tt in [inactive, deleted] {
        let err = engine.book(BookRequest::inline(tt)).await.unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Request("transaction type 'two_lines' is inactive or deleted".to_string())
        );
    }
    assert_eq!(store.count(EntityClass::Transaction), 0);
}
