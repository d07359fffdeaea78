pub mod config;
pub mod context;
pub mod datastore;
pub mod errors;
pub mod evaluator;
pub mod functions;
pub mod inputs;
pub mod phantom;
pub mod process;
pub mod record;
pub mod store;
pub mod validation;
pub mod value;

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

pub use config::{EngineConfig, EvalLimits};
pub use context::{PermissionGate, RuntimeContext};
pub use datastore::{ChangeSet, Persistence, RecordSource, init_datastore};
pub use errors::{EvalError, PersistenceError, RuntimeError};
pub use evaluator::Evaluator;
pub use functions::FunctionRegistry;
pub use process::{BookRequest, BookResult, CancelHandle, Engine, GeneralError, ProcessMode, TransactionTypeRef};
pub use record::RecordView;
pub use store::{MemoryDataStore, SqliteDataStore};
pub use validation::{ValidationIssue, ValidationReport};
pub use value::Value;

use tally_ir::TransactionType;

/// The built-in function library, built once per process.
pub fn default_registry() -> Arc<FunctionRegistry> {
    static REGISTRY: OnceLock<Arc<FunctionRegistry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| FunctionRegistry::with_defaults().freeze())
        .clone()
}

/// Books `request` against `store` with the default configuration.
pub async fn book(store: Arc<dyn Persistence>, request: BookRequest) -> Result<BookResult, RuntimeError> {
    Engine::new(store).book(request).await
}

/// Static checks over a transaction type.
pub fn validate(tt: &TransactionType) -> ValidationReport {
    validation::validate(tt)
}

/// Evaluates one expression against `names` with no record store behind it.
/// Names that would shadow a builtin are rejected.
pub async fn eval(expr: &str, names: BTreeMap<String, Value>, now: NaiveDateTime) -> Result<Value, EvalError> {
    let mut ev = Evaluator::new(default_registry(), EvalLimits::default(), now);
    for (name, value) in names {
        ev.bind(name, value)?;
    }
    ev.eval(expr).await
}
