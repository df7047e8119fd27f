/*!
Collection export and discovery.

[`export_collection`] never fails: a collection that cannot be read yields
an empty result carrying the error message so the run can continue with the
remaining collections.
*/

use crate::config::{DiscoveryConfig, DiscoveryMode};
use crate::record::CollectionExportResult;
use crate::store::RowStore;
use crate::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Fetch every row of a collection, capturing failures in the result
pub async fn export_collection(store: &dyn RowStore, collection_id: &str) -> CollectionExportResult {
    match store.list_rows(collection_id).await {
        Ok(rows) => {
            debug!(collection = collection_id, records = rows.len(), "Exported collection");
            CollectionExportResult::success(collection_id, rows)
        }
        Err(e) => {
            warn!(collection = collection_id, error = %e, "Failed to export collection");
            CollectionExportResult::failure(collection_id, e.to_string())
        }
    }
}

/// Decides which collections a run backs up
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    /// Return the identifiers of the collections to export, in export order
    async fn discover(&self, store: &dyn RowStore) -> Result<Vec<String>>;

    /// Short label used in logs and status output
    fn describe(&self) -> String;
}

/// Fixed allow-list; candidates the store cannot read are skipped
#[derive(Debug, Clone)]
pub struct StaticCollections {
    candidates: Vec<String>,
}

impl StaticCollections {
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CollectionProvider for StaticCollections {
    async fn discover(&self, store: &dyn RowStore) -> Result<Vec<String>> {
        let mut available = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            match store.check_collection(candidate).await {
                Ok(_) => available.push(candidate.clone()),
                Err(e) => {
                    warn!(collection = %candidate, error = %e, "Skipping unavailable collection");
                }
            }
        }
        info!(
            candidates = self.candidates.len(),
            available = available.len(),
            "Checked static collection list"
        );
        Ok(available)
    }

    fn describe(&self) -> String {
        format!("static ({} candidates)", self.candidates.len())
    }
}

/// Every collection the store reports, minus an exclude list
#[derive(Debug, Clone, Default)]
pub struct DynamicCollections {
    exclude: Vec<String>,
}

impl DynamicCollections {
    pub fn new<I, S>(exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CollectionProvider for DynamicCollections {
    async fn discover(&self, store: &dyn RowStore) -> Result<Vec<String>> {
        let collections: Vec<String> = store
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| !self.exclude.contains(c))
            .collect();
        info!(collections = collections.len(), "Discovered collections");
        Ok(collections)
    }

    fn describe(&self) -> String {
        "dynamic".to_string()
    }
}

/// Build the provider selected by the discovery configuration
pub fn provider_from_config(config: &DiscoveryConfig) -> Box<dyn CollectionProvider> {
    match config.mode {
        DiscoveryMode::Static => Box::new(StaticCollections::new(config.collections.clone())),
        DiscoveryMode::Dynamic => Box::new(DynamicCollections::new(config.exclude.clone())),
    }
}
