use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use tally_ir::{EntityClass, EntityRef};

use crate::datastore::{ChangeSet, Persistence, RecordSource, user_code_of};
use crate::errors::PersistenceError;

/// Writes staged by a run, layered over the store.
///
/// Reads see staged records first, so an action can look up what an earlier
/// action of the same run produced. Nothing reaches the store until the change
/// set is committed.
pub struct Session<'a> {
    store: &'a dyn Persistence,
    changes: ChangeSet,
}

impl<'a> Session<'a> {
    pub fn new(store: &'a dyn Persistence) -> Self {
        Self {
            store,
            changes: ChangeSet::default(),
        }
    }

    pub fn store(&self) -> &'a dyn Persistence {
        self.store
    }

    /// Stages a full record; the entity id is written into it.
    pub fn stage(&mut self, entity: EntityRef, mut record: Json) -> Json {
        if let Some(obj) = record.as_object_mut() {
            obj.insert("id".to_string(), Json::String(entity.id.clone()));
        }
        self.changes.write(entity, record.clone());
        record
    }

    pub fn delete(&mut self, entity: EntityRef) {
        self.changes.delete(entity);
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }
}

#[async_trait]
impl RecordSource for Session<'_> {
    async fn get(&self, class: EntityClass, id: &str) -> Result<Option<Arc<Json>>, PersistenceError> {
        let entity = EntityRef::new(class, id);
        if self.changes.is_deleted(&entity) {
            return Ok(None);
        }
        if let Some(record) = self.changes.staged(&entity) {
            return Ok(Some(Arc::new(record.clone())));
        }
        self.store.get(class, id).await
    }

    async fn find_by_user_code(
        &self,
        class: EntityClass,
        user_code: &str,
    ) -> Result<Option<Arc<Json>>, PersistenceError> {
        let staged = self
            .changes
            .writes
            .iter()
            .find(|(entity, record)| entity.class == class && user_code_of(class, record) == Some(user_code));
        if let Some((_, record)) = staged {
            return Ok(Some(Arc::new(record.clone())));
        }
        let Some(stored) = self.store.find_by_user_code(class, user_code).await? else {
            return Ok(None);
        };
        let hidden = stored.get("id").and_then(Json::as_str).is_some_and(|id| {
            let entity = EntityRef::new(class, id);
            self.changes.is_deleted(&entity) || self.changes.staged(&entity).is_some()
        });
        Ok(if hidden { None } else { Some(stored) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDataStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_staged_records_shadow_the_store() {
        let store = MemoryDataStore::new();
        store
            .put(EntityClass::Instrument, json!({"id": "i1", "user_code": "OLD"}))
            .unwrap();
        let mut session = Session::new(&store);

        session.stage(
            EntityRef::new(EntityClass::Instrument, "i1"),
            json!({"user_code": "RENAMED"}),
        );
        assert!(session.find_by_user_code(EntityClass::Instrument, "OLD").await.unwrap().is_none());
        let renamed = session
            .find_by_user_code(EntityClass::Instrument, "RENAMED")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed["id"], "i1");

        session.delete(EntityRef::new(EntityClass::Instrument, "i1"));
        assert!(session.get(EntityClass::Instrument, "i1").await.unwrap().is_none());
        assert!(store.get(EntityClass::Instrument, "i1").await.unwrap().is_some());
    }
}
