/*!
Row store port and adapters.

The pipeline only needs to read collections, but the port mirrors the full
row API of the managed database so that collaborators (such as the audit
reporter) can reuse the same client.
*/

pub mod appwrite;
pub mod memory;

use crate::record::Row;
use crate::Result;
use async_trait::async_trait;

/// Access to the document database holding blog content
///
/// Implementations must return the complete row set from `list_rows`,
/// paginating internally if the backend requires it.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Fetch every row of a collection
    ///
    /// # Arguments
    /// * `collection_id` - Identifier of the collection (table) to read
    ///
    /// # Returns
    /// All rows in store order, or an error if the collection is missing or
    /// inaccessible
    async fn list_rows(&self, collection_id: &str) -> Result<Vec<Row>>;

    /// Confirm a collection exists and is readable without fetching its rows
    ///
    /// Implementations should issue the cheapest read the backend offers;
    /// at most one row may be transferred.
    async fn check_collection(&self, collection_id: &str) -> Result<()>;

    /// Fetch a single row by identifier
    async fn get_row(&self, collection_id: &str, row_id: &str) -> Result<Row>;

    /// Create a row; the store assigns the identifier and timestamps
    async fn create_row(&self, collection_id: &str, data: Row) -> Result<Row>;

    /// Replace the given fields of an existing row
    async fn update_row(&self, collection_id: &str, row_id: &str, data: Row) -> Result<Row>;

    /// Delete a row
    async fn delete_row(&self, collection_id: &str, row_id: &str) -> Result<()>;

    /// List the identifiers of all collections in the configured database
    async fn list_collections(&self) -> Result<Vec<String>>;
}

pub use appwrite::AppwriteRowStore;
pub use memory::MemoryRowStore;
