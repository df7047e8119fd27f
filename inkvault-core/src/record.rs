/*!
Row records and per-collection export results.
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One document from the row store: field name to JSON value, in store order
pub type Row = Map<String, Value>;

/// Store-assigned identifier field
pub const ID_FIELD: &str = "$id";
/// Store-assigned creation timestamp field
pub const CREATED_AT_FIELD: &str = "$createdAt";
/// Store-assigned last-update timestamp field
pub const UPDATED_AT_FIELD: &str = "$updatedAt";

/// True for fields the store manages itself (`$`-prefixed)
pub fn is_store_field(name: &str) -> bool {
    name.starts_with('$')
}

/// Rows fetched for one collection in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionExportResult {
    pub collection_id: String,
    #[serde(skip)]
    pub rows: Vec<Row>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionExportResult {
    pub fn success(collection_id: impl Into<String>, rows: Vec<Row>) -> Self {
        let total = rows.len();
        Self {
            collection_id: collection_id.into(),
            rows,
            total,
            error: None,
        }
    }

    pub fn failure(collection_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            rows: Vec::new(),
            total: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_counts_rows() {
        let rows = vec![
            json!({"$id": "a", "title": "First"}).as_object().unwrap().clone(),
            json!({"$id": "b", "title": "Second"}).as_object().unwrap().clone(),
        ];
        let result = CollectionExportResult::success("posts", rows);
        assert_eq!(result.total, 2);
        assert!(result.is_success());
    }

    #[test]
    fn test_failure_has_no_rows() {
        let result = CollectionExportResult::failure("secrets", "permission denied");
        assert_eq!(result.total, 0);
        assert!(result.rows.is_empty());
        assert_eq!(result.error.as_deref(), Some("permission denied"));
    }

    #[test]
    fn test_store_field_prefix() {
        assert!(is_store_field(ID_FIELD));
        assert!(is_store_field("$permissions"));
        assert!(!is_store_field("title"));
    }
}
