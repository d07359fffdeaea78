use serde_json::Value as Json;
use tally_ir::EntityClass;
use tally_runtime::Persistence;

use crate::CliError;

/// Inserts `{ "<Class>": [record, ...], ... }` into `store`; returns how many
/// records went in.
pub async fn seed(store: &dyn Persistence, records: &Json) -> Result<usize, CliError> {
    let Some(classes) = records.as_object() else {
        return Err(CliError::Seed("seed file must be an object keyed by entity class".to_string()));
    };
    let mut inserted = 0;
    for (name, list) in classes {
        let class = EntityClass::from_content_type(name)
            .ok_or_else(|| CliError::Seed(format!("unknown entity class '{}'", name)))?;
        let Some(list) = list.as_array() else {
            return Err(CliError::Seed(format!("{}: expected a list of records", name)));
        };
        for record in list {
            store
                .insert(class, record.clone())
                .await
                .map_err(|e| CliError::Seed(format!("{}: {}", name, e)))?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_runtime::MemoryDataStore;

    #[tokio::test]
    async fn test_seed_inserts_by_class() {
        let store = MemoryDataStore::new();
        let records = json!({
            "Currency": [{"user_code": "USD"}, {"user_code": "EUR"}],
            "Portfolio": [{"id": "p-1", "user_code": "P1"}]
        });
        assert_eq!(seed(&store, &records).await.unwrap(), 3);
        assert_eq!(store.count(EntityClass::Currency), 2);
        assert_eq!(store.count(EntityClass::Portfolio), 1);
    }

    #[tokio::test]
    async fn test_seed_rejects_unknown_class() {
        let store = MemoryDataStore::new();
        let err = seed(&store, &json!({"Widget": []})).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown entity class 'Widget'");
    }
}
