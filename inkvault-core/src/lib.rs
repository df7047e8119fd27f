/*!
# Inkvault Core Engine

Scheduled, multi-format backups of blog content collections.

This crate exports every collection of a managed document database and
writes each one as:

- a relational dump (`.sql.gz`)
- a document dump (`.bson.gz`, concatenated BSON documents)
- a spreadsheet (`.xlsx`)

Artifacts are kept in `daily/`, `weekly/` and `monthly/` tiers, each trimmed
to a configurable number of newest files, and a JSON summary of every run is
written to `logs/`.

## Architecture

- [`store::RowStore`] is the port to the database, with an Appwrite adapter
  and an in-memory adapter
- [`exporter`] fetches collections and decides which ones to back up
- [`encoders`] turn rows into artifact files
- [`retention`] rotates, promotes and purges artifacts under per-tier locks
- [`orchestrator::BackupOrchestrator`] runs the pipeline end to end
- [`schedule::Scheduler`] fires backups from cron expressions

## Usage

```rust,no_run
use inkvault_core::{BackupKind, BackupOrchestrator, InkvaultConfig, AppwriteRowStore};
use std::sync::Arc;

# async fn run() -> inkvault_core::Result<()> {
let config = InkvaultConfig::from_env()?;
let store = Arc::new(AppwriteRowStore::new(&config.store)?);
let orchestrator = BackupOrchestrator::from_config(&config, store);

let summary = orchestrator.perform_backup(BackupKind::Manual).await?;
println!("{} records in {} collections", summary.total_records, summary.collections_exported);
# Ok(())
# }
```
*/

pub mod artifact;
pub mod compression;
pub mod config;
pub mod encoders;
pub mod error;
pub mod exporter;
pub mod lock;
pub mod observability;
pub mod orchestrator;
pub mod record;
pub mod reporter;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod summary;
pub mod tier;


pub use artifact::{ArtifactFormat, BackupKind, ParsedArtifact};
pub use compression::GzipCompressor;
pub use config::{InkvaultConfig, RetentionPolicy};
pub use error::{BackupError, Result};
pub use exporter::{export_collection, CollectionProvider, DynamicCollections, StaticCollections};
pub use orchestrator::BackupOrchestrator;
pub use record::{CollectionExportResult, Row};
pub use reporter::{MemoryReporter, NoopReporter, Reporter, StoreAuditReporter, TracingReporter};
pub use retention::{cleanup_directory, promote_tier, purge_same_day_auto, CleanupReport};
pub use schedule::Scheduler;
pub use store::{AppwriteRowStore, MemoryRowStore, RowStore};
pub use summary::{CollectionDetail, RunSummary};
pub use tier::{BackupLayout, Tier};
