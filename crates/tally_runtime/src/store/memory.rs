use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tally_ir::{EntityClass, EntityRef};
use tracing::debug;

use crate::datastore::{ChangeSet, Persistence, RecordSource, unique_code_of, user_code_of};
use crate::errors::PersistenceError;

type DataStoreData = HashMap<EntityClass, HashMap<String, Arc<Value>>>;

#[derive(Default)]
struct Inner {
    data: DataStoreData,
    last_code: i64,
}

/// Process-local store; every commit holds one lock for its whole duration.
#[derive(Clone, Default)]
pub struct MemoryDataStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PersistenceError> {
        self.inner.lock().map_err(|_| PersistenceError::backend("memory store lock poisoned"))
    }

    /// Seeds a record directly, bypassing uniqueness checks. Intended for fixtures.
    pub fn put(&self, class: EntityClass, record: Value) -> Result<String, PersistenceError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut record = record;
        if let Some(obj) = record.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        let mut inner = self.lock()?;
        if class == EntityClass::ComplexTransaction {
            if let Some(code) = record.get("code").and_then(Value::as_i64) {
                inner.last_code = inner.last_code.max(code);
            }
        }
        inner.data.entry(class).or_default().insert(id.clone(), Arc::new(record));
        Ok(id)
    }

    pub fn count(&self, class: EntityClass) -> usize {
        self.lock()
            .map(|inner| inner.data.get(&class).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// Every stored record of a class, in no particular order.
    pub fn all(&self, class: EntityClass) -> Vec<Arc<Value>> {
        self.lock()
            .map(|inner| {
                inner
                    .data
                    .get(&class)
                    .map(|table| table.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn find_where<F>(&self, class: EntityClass, pred: F) -> Result<Option<Arc<Value>>, PersistenceError>
    where
        F: Fn(&Value) -> bool,
    {
        let inner = self.lock()?;
        Ok(inner
            .data
            .get(&class)
            .and_then(|table| table.values().find(|r| pred(r)).cloned()))
    }
}

fn conflict(key: &str, value: &str) -> PersistenceError {
    PersistenceError::Conflict {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Checks user codes and unique codes of staged writes against stored data and each other.
fn check_unique(data: &DataStoreData, changes: &ChangeSet) -> Result<(), PersistenceError> {
    let survives = |entity: &EntityRef| {
        !changes.is_deleted(entity) && changes.staged(entity).is_none()
    };
    let mut seen: Vec<(EntityClass, &str, &str)> = Vec::new();
    for (entity, record) in &changes.writes {
        let keys = [
            ("user_code", user_code_of(entity.class, record)),
            ("transaction_unique_code", unique_code_of(entity.class, record)),
        ];
        for (key, value) in keys {
            let Some(value) = value else { continue };
            if seen.iter().any(|(c, k, v)| *c == entity.class && *k == key && *v == value) {
                return Err(conflict(key, value));
            }
            seen.push((entity.class, key, value));

            let clash = data.get(&entity.class).is_some_and(|table| {
                table.iter().any(|(id, stored)| {
                    let stored_ref = EntityRef::new(entity.class, id.clone());
                    if *id == entity.id || !survives(&stored_ref) {
                        return false;
                    }
                    let stored_value = match key {
                        "user_code" => user_code_of(entity.class, stored),
                        _ => unique_code_of(entity.class, stored),
                    };
                    stored_value == Some(value)
                })
            });
            if clash {
                return Err(conflict(key, value));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RecordSource for MemoryDataStore {
    async fn get(&self, class: EntityClass, id: &str) -> Result<Option<Arc<Value>>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner.data.get(&class).and_then(|table| table.get(id).cloned()))
    }

    async fn find_by_user_code(
        &self,
        class: EntityClass,
        user_code: &str,
    ) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.find_where(class, |r| user_code_of(class, r) == Some(user_code))
    }
}

#[async_trait]
impl Persistence for MemoryDataStore {
    async fn find_complex_transaction(&self, code: i64) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.find_where(EntityClass::ComplexTransaction, |r| {
            r.get("code").and_then(Value::as_i64) == Some(code)
        })
    }

    async fn find_by_unique_code(&self, unique_code: &str) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.find_where(EntityClass::ComplexTransaction, |r| {
            unique_code_of(EntityClass::ComplexTransaction, r) == Some(unique_code)
        })
    }

    async fn next_code(&self) -> Result<i64, PersistenceError> {
        let mut inner = self.lock()?;
        inner.last_code += 1;
        Ok(inner.last_code)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        check_unique(&inner.data, &changes)?;
        debug!(
            writes = changes.writes.len(),
            deletes = changes.deletes.len(),
            "memory store commit"
        );
        for entity in &changes.deletes {
            if let Some(table) = inner.data.get_mut(&entity.class) {
                table.remove(&entity.id);
            }
        }
        for (entity, record) in changes.writes {
            let mut record = record;
            if let Some(obj) = record.as_object_mut() {
                obj.insert("id".to_string(), Value::String(entity.id.clone()));
            }
            inner
                .data
                .entry(entity.class)
                .or_default()
                .insert(entity.id, Arc::new(record));
        }
        Ok(())
    }
}
