use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tally_ir::{EntityClass, EntityRef};
use tracing::{debug, warn};

use crate::datastore::{ChangeSet, Persistence, RecordSource, unique_code_of, user_code_of};
use crate::errors::PersistenceError;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS records (
        class TEXT NOT NULL,
        id TEXT NOT NULL,
        user_code TEXT,
        unique_code TEXT,
        body TEXT NOT NULL,
        PRIMARY KEY (class, id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS records_user_code ON records (class, user_code) WHERE user_code IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS records_unique_code ON records (unique_code) WHERE unique_code IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)",
    "CREATE INDEX IF NOT EXISTS records_code ON records (class, json_extract(body, '$.code'))",
];

const CODE_COUNTER: &str = "complex_transaction_code";

/// Durable store keeping every entity as one JSON row.
pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and prepares the schema.
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to `:memory:` is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_one_body(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Option<Arc<Value>>, PersistenceError> {
        let mut query = sqlx::query_as::<_, (String,)>(sql);
        for b in binds {
            query = query.bind(*b);
        }
        match query.fetch_optional(&self.pool).await? {
            Some((body,)) => Ok(Some(Arc::new(serde_json::from_str(&body)?))),
            None => Ok(None),
        }
    }

    async fn apply(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        changes: &ChangeSet,
    ) -> Result<(), PersistenceError> {
        for entity in &changes.deletes {
            sqlx::query("DELETE FROM records WHERE class = ? AND id = ?")
                .bind(entity.class.as_str())
                .bind(&entity.id)
                .execute(&mut **tx)
                .await?;
        }
        for (entity, record) in &changes.writes {
            let mut record = record.clone();
            if let Some(obj) = record.as_object_mut() {
                obj.insert("id".to_string(), Value::String(entity.id.clone()));
            }
            let user_code = user_code_of(entity.class, &record).map(str::to_string);
            let unique_code = unique_code_of(entity.class, &record).map(str::to_string);
            let result = sqlx::query(
                "INSERT INTO records (class, id, user_code, unique_code, body) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (class, id) DO UPDATE SET
                    user_code = excluded.user_code,
                    unique_code = excluded.unique_code,
                    body = excluded.body",
            )
            .bind(entity.class.as_str())
            .bind(&entity.id)
            .bind(&user_code)
            .bind(&unique_code)
            .bind(serde_json::to_string(&record)?)
            .execute(&mut **tx)
            .await;
            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(Self::conflict(tx, entity, user_code, unique_code).await?);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Names the unique key an upsert of `entity` ran into. SQLite reports
    /// neither the index nor the constraint, so the holder is looked up.
    async fn conflict(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        entity: &EntityRef,
        user_code: Option<String>,
        unique_code: Option<String>,
    ) -> Result<PersistenceError, PersistenceError> {
        if let Some(code) = unique_code {
            let (held,) = sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(*) FROM records WHERE unique_code = ? AND NOT (class = ? AND id = ?)",
            )
            .bind(&code)
            .bind(entity.class.as_str())
            .bind(&entity.id)
            .fetch_one(&mut **tx)
            .await?;
            if held > 0 {
                debug!(%entity, "transaction_unique_code taken on write");
                return Ok(PersistenceError::Conflict {
                    key: "transaction_unique_code".to_string(),
                    value: code,
                });
            }
        }
        debug!(%entity, "user_code taken on write");
        Ok(PersistenceError::Conflict {
            key: "user_code".to_string(),
            value: user_code.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RecordSource for SqliteDataStore {
    async fn get(&self, class: EntityClass, id: &str) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.fetch_one_body("SELECT body FROM records WHERE class = ? AND id = ?", &[class.as_str(), id])
            .await
    }

    async fn find_by_user_code(
        &self,
        class: EntityClass,
        user_code: &str,
    ) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.fetch_one_body(
            "SELECT body FROM records WHERE class = ? AND user_code = ?",
            &[class.as_str(), user_code],
        )
        .await
    }
}

#[async_trait]
impl Persistence for SqliteDataStore {
    async fn find_complex_transaction(&self, code: i64) -> Result<Option<Arc<Value>>, PersistenceError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT body FROM records WHERE class = ? AND json_extract(body, '$.code') = ?",
        )
        .bind(EntityClass::ComplexTransaction.as_str())
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((body,)) => Ok(Some(Arc::new(serde_json::from_str(&body)?))),
            None => Ok(None),
        }
    }

    async fn find_by_unique_code(&self, unique_code: &str) -> Result<Option<Arc<Value>>, PersistenceError> {
        self.fetch_one_body("SELECT body FROM records WHERE unique_code = ?", &[unique_code])
            .await
    }

    async fn next_code(&self) -> Result<i64, PersistenceError> {
        let (code,) = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO counters (name, value) VALUES (?, 1)
             ON CONFLICT (name) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(CODE_COUNTER)
        .fetch_one(&self.pool)
        .await?;
        Ok(code)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), PersistenceError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        match Self::apply(&mut tx, &changes).await {
            Ok(()) => {
                tx.commit().await?;
                debug!(
                    writes = changes.writes.len(),
                    deletes = changes.deletes.len(),
                    "sqlite store commit"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sqlite commit rolled back");
                tx.rollback().await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteDataStore {
        SqliteDataStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_write_then_lookup() {
        let store = store().await;
        let mut changes = ChangeSet::default();
        changes.write(
            EntityRef::new(EntityClass::Currency, "usd"),
            json!({"user_code": "USD", "name": "US Dollar"}),
        );
        store.commit(changes).await.unwrap();

        let usd = store.find_by_user_code(EntityClass::Currency, "USD").await.unwrap().unwrap();
        assert_eq!(usd["id"], "usd");
        assert!(store.get(EntityClass::Currency, "eur").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_behind() {
        let store = store().await;
        let mut first = ChangeSet::default();
        first.write(
            EntityRef::new(EntityClass::ComplexTransaction, "c1"),
            json!({"code": 1, "transaction_unique_code": "UC-1"}),
        );
        store.commit(first).await.unwrap();

        let mut second = ChangeSet::default();
        second.write(EntityRef::new(EntityClass::Transaction, "t9"), json!({"cash_consideration": 1.0}));
        second.write(
            EntityRef::new(EntityClass::ComplexTransaction, "c2"),
            json!({"code": 2, "transaction_unique_code": "UC-1"}),
        );
        let err = store.commit(second).await.unwrap_err();
        assert_eq!(
            err,
            PersistenceError::Conflict {
                key: "transaction_unique_code".into(),
                value: "UC-1".into()
            }
        );
        assert!(store.get(EntityClass::Transaction, "t9").await.unwrap().is_none());
        assert_eq!(
            store.find_complex_transaction(1).await.unwrap().unwrap()["transaction_unique_code"],
            "UC-1"
        );
    }

    #[tokio::test]
    async fn test_user_code_collision_names_the_key() {
        let store = store().await;
        let mut first = ChangeSet::default();
        first.write(
            EntityRef::new(EntityClass::ComplexTransaction, "c1"),
            json!({"code": 1, "transaction_unique_code": "UC-1"}),
        );
        first.write(EntityRef::new(EntityClass::Currency, "usd"), json!({"user_code": "USD"}));
        store.commit(first).await.unwrap();

        let mut second = ChangeSet::default();
        second.write(
            EntityRef::new(EntityClass::ComplexTransaction, "c2"),
            json!({"code": 2, "transaction_unique_code": "UC-2"}),
        );
        second.write(EntityRef::new(EntityClass::Currency, "usd-2"), json!({"user_code": "USD"}));
        let err = store.commit(second).await.unwrap_err();
        assert_eq!(
            err,
            PersistenceError::Conflict {
                key: "user_code".into(),
                value: "USD".into()
            }
        );
        assert!(store.find_complex_transaction(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_codes_are_monotonic() {
        let store = store().await;
        assert_eq!(store.next_code().await.unwrap(), 1);
        assert_eq!(store.next_code().await.unwrap(), 2);
    }
}
