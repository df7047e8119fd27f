/*!
In-memory row store used by tests and dry runs.
*/

use super::RowStore;
use crate::record::{Row, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::{BackupError, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Row store backed by a map of collection name to rows
///
/// Individual collections can be configured to fail so that error paths of
/// the exporter can be exercised.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    collections: Mutex<BTreeMap<String, Vec<Row>>>,
    failures: Mutex<HashMap<String, String>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of [`MemoryRowStore::insert_collection`]
    pub fn with_collection(self, collection_id: impl Into<String>, rows: Vec<Row>) -> Self {
        self.insert_collection(collection_id, rows);
        self
    }

    /// Create or replace a collection
    pub fn insert_collection(&self, collection_id: impl Into<String>, rows: Vec<Row>) {
        lock(&self.collections).insert(collection_id.into(), rows);
    }

    /// Make every operation on `collection_id` fail with `message`
    pub fn fail_collection(&self, collection_id: impl Into<String>, message: impl Into<String>) {
        lock(&self.failures).insert(collection_id.into(), message.into());
    }

    /// Snapshot of a collection's rows (empty if absent)
    pub fn rows(&self, collection_id: &str) -> Vec<Row> {
        lock(&self.collections)
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_failure(&self, collection_id: &str) -> Result<()> {
        match lock(&self.failures).get(collection_id) {
            Some(message) => Err(BackupError::store(message.clone())),
            None => Ok(()),
        }
    }

    fn not_found(collection_id: &str) -> BackupError {
        BackupError::store(format!("Collection with the requested ID could not be found: {collection_id}"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn row_id(row: &Row) -> Option<&str> {
    row.get(ID_FIELD).and_then(Value::as_str)
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn list_rows(&self, collection_id: &str) -> Result<Vec<Row>> {
        self.check_failure(collection_id)?;
        lock(&self.collections)
            .get(collection_id)
            .cloned()
            .ok_or_else(|| Self::not_found(collection_id))
    }

    async fn check_collection(&self, collection_id: &str) -> Result<()> {
        self.check_failure(collection_id)?;
        if lock(&self.collections).contains_key(collection_id) {
            Ok(())
        } else {
            Err(Self::not_found(collection_id))
        }
    }

    async fn get_row(&self, collection_id: &str, id: &str) -> Result<Row> {
        self.check_failure(collection_id)?;
        let collections = lock(&self.collections);
        let rows = collections
            .get(collection_id)
            .ok_or_else(|| Self::not_found(collection_id))?;
        rows.iter()
            .find(|row| row_id(row) == Some(id))
            .cloned()
            .ok_or_else(|| BackupError::store(format!("Row {id} not found in {collection_id}")))
    }

    async fn create_row(&self, collection_id: &str, data: Row) -> Result<Row> {
        self.check_failure(collection_id)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut row = Row::new();
        row.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().simple().to_string()));
        row.insert(CREATED_AT_FIELD.to_string(), Value::String(now.clone()));
        row.insert(UPDATED_AT_FIELD.to_string(), Value::String(now));
        row.extend(data);

        lock(&self.collections)
            .entry(collection_id.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update_row(&self, collection_id: &str, id: &str, data: Row) -> Result<Row> {
        self.check_failure(collection_id)?;
        let mut collections = lock(&self.collections);
        let rows = collections
            .get_mut(collection_id)
            .ok_or_else(|| Self::not_found(collection_id))?;
        let row = rows
            .iter_mut()
            .find(|row| row_id(row) == Some(id))
            .ok_or_else(|| BackupError::store(format!("Row {id} not found in {collection_id}")))?;

        row.extend(data);
        row.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Ok(row.clone())
    }

    async fn delete_row(&self, collection_id: &str, id: &str) -> Result<()> {
        self.check_failure(collection_id)?;
        let mut collections = lock(&self.collections);
        let rows = collections
            .get_mut(collection_id)
            .ok_or_else(|| Self::not_found(collection_id))?;
        let before = rows.len();
        rows.retain(|row| row_id(row) != Some(id));
        if rows.len() == before {
            return Err(BackupError::store(format!("Row {id} not found in {collection_id}")));
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(lock(&self.collections).keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let store = MemoryRowStore::new().with_collection("posts", Vec::new());

        let created = store
            .create_row("posts", row(json!({"title": "Hello"})))
            .await
            .unwrap();
        let id = created[ID_FIELD].as_str().unwrap().to_string();
        assert!(created.contains_key(CREATED_AT_FIELD));

        let fetched = store.get_row("posts", &id).await.unwrap();
        assert_eq!(fetched["title"], "Hello");

        let updated = store
            .update_row("posts", &id, row(json!({"title": "Hello again"})))
            .await
            .unwrap();
        assert_eq!(updated["title"], "Hello again");

        store.delete_row("posts", &id).await.unwrap();
        assert!(store.list_rows("posts").await.unwrap().is_empty());
        assert!(store.delete_row("posts", &id).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_collection_is_an_error() {
        let store = MemoryRowStore::new();
        let err = store.list_rows("ghost").await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(store.check_collection("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryRowStore::new().with_collection("comments", Vec::new());
        store.fail_collection("comments", "permission denied");

        let err = store.list_rows("comments").await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        let err = store.check_collection("comments").await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        // Listing collections is unaffected
        assert_eq!(store.list_collections().await.unwrap(), vec!["comments"]);
    }
}
