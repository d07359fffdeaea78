use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tally_ir::{EntityClass, EntityRef, TransactionType};
use tracing::info;

use crate::errors::PersistenceError;
use crate::store::memory::MemoryDataStore;
use crate::store::sqlite::SqliteDataStore;

/// Read side used by expressions to materialize records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn get(&self, class: EntityClass, id: &str) -> Result<Option<Arc<Value>>, PersistenceError>;

    async fn find_by_user_code(
        &self,
        class: EntityClass,
        user_code: &str,
    ) -> Result<Option<Arc<Value>>, PersistenceError>;
}

/// Writes staged by one run, applied together or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Full records keyed by identity; a write replaces any stored record.
    pub writes: Vec<(EntityRef, Value)>,
    pub deletes: Vec<EntityRef>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn write(&mut self, entity: EntityRef, record: Value) {
        self.deletes.retain(|d| *d != entity);
        match self.writes.iter_mut().find(|(r, _)| *r == entity) {
            Some(slot) => slot.1 = record,
            None => self.writes.push((entity, record)),
        }
    }

    pub fn delete(&mut self, entity: EntityRef) {
        self.writes.retain(|(r, _)| *r != entity);
        if !self.deletes.contains(&entity) {
            self.deletes.push(entity);
        }
    }

    pub fn staged(&self, entity: &EntityRef) -> Option<&Value> {
        self.writes.iter().find(|(r, _)| r == entity).map(|(_, v)| v)
    }

    pub fn is_deleted(&self, entity: &EntityRef) -> bool {
        self.deletes.contains(entity)
    }
}

/// The narrow storage contract the engine books through.
///
/// `commit` applies a change set atomically. Implementations enforce the
/// uniqueness of `user_code` per class and of `transaction_unique_code`
/// across complex transactions that are not deleted, reporting violations as
/// [`PersistenceError::Conflict`].
#[async_trait]
pub trait Persistence: RecordSource {
    async fn find_complex_transaction(&self, code: i64) -> Result<Option<Arc<Value>>, PersistenceError>;

    async fn find_by_unique_code(&self, unique_code: &str) -> Result<Option<Arc<Value>>, PersistenceError>;

    /// Next complex transaction code; never hands out the same value twice.
    async fn next_code(&self) -> Result<i64, PersistenceError>;

    async fn commit(&self, changes: ChangeSet) -> Result<(), PersistenceError>;

    /// Stores a single record, assigning an id when it has none.
    async fn insert(&self, class: EntityClass, mut record: Value) -> Result<String, PersistenceError> {
        let obj = record
            .as_object_mut()
            .ok_or_else(|| PersistenceError::Validation("record must be an object".to_string()))?;
        let id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                obj.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let mut changes = ChangeSet::default();
        changes.write(EntityRef::new(class, id.clone()), record);
        self.commit(changes).await?;
        Ok(id)
    }

    async fn load_transaction_type(&self, user_code: &str) -> Result<TransactionType, PersistenceError> {
        let raw = self
            .find_by_user_code(EntityClass::TransactionType, user_code)
            .await?
            .ok_or_else(|| PersistenceError::not_found(EntityClass::TransactionType, user_code))?;
        serde_json::from_value((*raw).clone()).map_err(|e| PersistenceError::Validation(e.to_string()))
    }
}

/// Field holding a record's user code, if its class has one.
pub(crate) fn user_code_of(class: EntityClass, record: &Value) -> Option<&str> {
    if !class.has_user_code() {
        return None;
    }
    record.get("user_code").and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub(crate) fn unique_code_of(class: EntityClass, record: &Value) -> Option<&str> {
    if class != EntityClass::ComplexTransaction {
        return None;
    }
    if record.get("is_deleted").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    record
        .get("transaction_unique_code")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Opens the store named by `url`: `memory:` or a SQLite URL.
pub async fn init_datastore(url: &str) -> Result<Arc<dyn Persistence>, PersistenceError> {
    if url.is_empty() || url == "memory:" {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryDataStore::new()));
    }
    if url.starts_with("sqlite:") {
        info!(url, "connecting to sqlite store");
        let store = SqliteDataStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    Err(PersistenceError::Backend(format!("unsupported store url '{}'", url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_set_last_write_wins() {
        let mut changes = ChangeSet::default();
        let entity = EntityRef::new(EntityClass::Instrument, "i1");
        changes.write(entity.clone(), json!({"id": "i1", "name": "a"}));
        changes.write(entity.clone(), json!({"id": "i1", "name": "b"}));
        assert_eq!(changes.writes.len(), 1);
        assert_eq!(changes.staged(&entity).unwrap()["name"], "b");

        changes.delete(entity.clone());
        assert!(changes.staged(&entity).is_none());
        assert!(changes.is_deleted(&entity));
    }

    #[test]
    fn test_unique_code_ignores_deleted_headers() {
        let live = json!({"transaction_unique_code": "UC-1"});
        let gone = json!({"transaction_unique_code": "UC-1", "is_deleted": true});
        assert_eq!(unique_code_of(EntityClass::ComplexTransaction, &live), Some("UC-1"));
        assert_eq!(unique_code_of(EntityClass::ComplexTransaction, &gone), None);
        assert_eq!(unique_code_of(EntityClass::Transaction, &live), None);
    }
}
