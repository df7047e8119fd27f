/*!
Backup orchestration.

A run exports every discovered collection, encodes the non-empty ones in all
enabled formats, writes a run summary and applies retention to every tier.
Runs are serialized across processes by a lock file at the backup root.
Manual runs fail fast when the lock is held; scheduled runs wait for it, so a
weekly job firing while the daily run is still exporting runs right after it.
*/

use crate::artifact::{artifact_stem, format_timestamp, BackupKind};
use crate::compression::GzipCompressor;
use crate::config::{FormatConfig, InkvaultConfig, RetentionPolicy};
use crate::encoders::{encoders_from_config, EncodeContext, Encoder};
use crate::exporter::{export_collection, provider_from_config, CollectionProvider, DynamicCollections};
use crate::lock::DirLock;
use crate::reporter::{
    CompositeReporter, Reporter, RunContext, StoreAuditReporter, TracingReporter,
};
use crate::retention::{CleanupReport, RetentionManager, DEFAULT_LOCK_STALE_AFTER};
use crate::store::RowStore;
use crate::summary::{ArtifactRecord, CollectionDetail, RunSummary};
use crate::tier::{BackupLayout, Tier};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// How long a scheduled run waits for another run to release the run lock
pub const DEFAULT_RUN_LOCK_WAIT: Duration = Duration::from_secs(2 * 60 * 60);

/// Drives backup runs against one row store and one backup root
pub struct BackupOrchestrator {
    store: Arc<dyn RowStore>,
    provider: Box<dyn CollectionProvider>,
    reporter: Arc<dyn Reporter>,
    layout: BackupLayout,
    retention: RetentionManager,
    encoders: Vec<Box<dyn Encoder>>,
    lock_stale_after: Duration,
    run_lock_wait: Duration,
}

impl BackupOrchestrator {
    /// Create an orchestrator with default settings
    ///
    /// Defaults: dynamic discovery, log-only reporting, default retention
    /// caps and all formats enabled.
    pub fn new(store: Arc<dyn RowStore>, root: impl Into<PathBuf>) -> Self {
        let layout = BackupLayout::new(root.into());
        Self {
            store,
            provider: Box::new(DynamicCollections::default()),
            reporter: Arc::new(TracingReporter),
            retention: RetentionManager::new(layout.clone(), RetentionPolicy::default()),
            layout,
            encoders: encoders_from_config(&FormatConfig::default(), GzipCompressor::new()),
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            run_lock_wait: DEFAULT_RUN_LOCK_WAIT,
        }
    }

    /// Build an orchestrator from the full configuration
    ///
    /// Events are logged, and also written to the audit collection when one
    /// is configured.
    pub fn from_config(config: &InkvaultConfig, store: Arc<dyn RowStore>) -> Self {
        let reporter: Arc<dyn Reporter> = match &config.audit_collection {
            Some(collection) => Arc::new(CompositeReporter::new(vec![
                Arc::new(TracingReporter),
                Arc::new(StoreAuditReporter::new(store.clone(), collection.clone())),
            ])),
            None => Arc::new(TracingReporter),
        };

        Self::new(store, config.backup_root.clone())
            .with_provider(provider_from_config(&config.discovery))
            .with_reporter(reporter)
            .with_retention(config.retention)
            .with_formats(
                &config.formats,
                GzipCompressor::with_level(config.compression_level),
            )
            .with_lock_stale_after(Duration::from_secs(config.lock_stale_after_secs))
            .with_run_lock_wait(Duration::from_secs(config.run_lock_wait_secs))
    }

    pub fn with_provider(mut self, provider: Box<dyn CollectionProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = RetentionManager::new(self.layout.clone(), policy)
            .with_lock_stale_after(self.lock_stale_after);
        self
    }

    pub fn with_formats(mut self, formats: &FormatConfig, compressor: GzipCompressor) -> Self {
        self.encoders = encoders_from_config(formats, compressor);
        self
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self.retention = self.retention.with_lock_stale_after(stale_after);
        self
    }

    pub fn with_run_lock_wait(mut self, wait: Duration) -> Self {
        self.run_lock_wait = wait;
        self
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Run a backup into the daily tier
    pub async fn perform_backup(&self, kind: BackupKind) -> Result<RunSummary> {
        self.perform_tier_backup(kind, Tier::Daily).await
    }

    /// Run a backup into `tier`
    ///
    /// Automatic daily runs first remove automatic daily artifacts already
    /// written today, so at most one automatic set per day survives.
    ///
    /// # Errors
    /// [`crate::BackupError::RunInProgress`] if another run holds the run
    /// lock; discovery, encoding, summary and retention errors abort the run
    /// after being reported. Artifacts written before the failure are kept.
    pub async fn perform_tier_backup(&self, kind: BackupKind, tier: Tier) -> Result<RunSummary> {
        fs::create_dir_all(self.layout.root())?;
        let _run_lock = DirLock::acquire(
            &self.layout.run_lock_path(),
            &format!("{kind} {tier} backup"),
            self.lock_stale_after,
        )?;
        self.run_locked(kind, tier).await
    }

    /// Scheduled automatic run into `tier`
    ///
    /// Waits up to the configured run-lock wait for a run already in
    /// progress. Under the lock, weekly and monthly runs first copy the
    /// newest artifact of the tier below; a failed promotion is logged and
    /// the backup still runs.
    ///
    /// # Errors
    /// [`BackupError::RunInProgress`] if the lock is still held after the
    /// wait, otherwise the same errors as [`Self::perform_tier_backup`].
    pub async fn perform_scheduled_backup(&self, tier: Tier) -> Result<RunSummary> {
        fs::create_dir_all(self.layout.root())?;
        let _run_lock = DirLock::acquire_waiting(
            &self.layout.run_lock_path(),
            &format!("{} {tier} backup", BackupKind::Auto),
            self.lock_stale_after,
            self.run_lock_wait,
        )
        .await?;

        if let Some(source) = tier.promotion_source() {
            self.layout.ensure_dirs()?;
            let promoted = self
                .with_retention_blocking(move |retention| retention.promote(source, tier))
                .await;
            if let Err(e) = promoted {
                warn!(%source, dest = %tier, error = %e, "Promotion failed, continuing with backup");
            }
        }

        self.run_locked(BackupKind::Auto, tier).await
    }

    /// Body of a run; the caller holds the run lock
    async fn run_locked(&self, kind: BackupKind, tier: Tier) -> Result<RunSummary> {
        self.layout.ensure_dirs()?;

        let started = Instant::now();
        let now = Utc::now();
        let ctx = RunContext {
            run_id: Uuid::new_v4(),
            kind,
            tier,
            timestamp: format_timestamp(now),
        };

        if kind == BackupKind::Auto && tier == Tier::Daily {
            let date = now.date_naive();
            self.with_retention_blocking(move |retention| {
                retention.purge_same_day_auto(Tier::Daily, date)
            })
            .await?;
        }

        info!(run_id = %ctx.run_id, %kind, %tier, "Starting backup run");
        self.reporter.record_start(&ctx).await;

        match self.run(&ctx, now, started).await {
            Ok(summary) => {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = crate::observability::BackupMetrics::global() {
                    metrics.record_run(summary.total_records, started.elapsed());
                }
                self.reporter.record_completion(&ctx, &summary).await;
                Ok(summary)
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = crate::observability::BackupMetrics::global() {
                    metrics.record_failure(started.elapsed());
                }
                self.reporter.record_failure(&ctx, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Run a retention operation on the blocking pool
    ///
    /// Tier locks are waited for with a thread sleep, which must not happen on
    /// a runtime worker.
    async fn with_retention_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&RetentionManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let retention = self.retention.clone();
        tokio::task::spawn_blocking(move || op(&retention))
            .await
            .map_err(|e| BackupError::lock(format!("retention task failed: {e}")))?
    }

    /// Copy the newest artifact of `source` into `dest`
    pub fn promote(&self, source: Tier, dest: Tier) -> Result<Option<PathBuf>> {
        self.retention.promote(source, dest)
    }

    /// Apply the retention caps to every tier
    pub fn cleanup(&self) -> Result<Vec<CleanupReport>> {
        self.retention.cleanup_all()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<RunSummary> {
        let collections = self.provider.discover(self.store.as_ref()).await?;
        info!(
            collections = collections.len(),
            discovery = %self.provider.describe(),
            "Collections selected for backup"
        );

        let output_dir = self.layout.tier_dir(ctx.tier);
        let mut summary = RunSummary::new(ctx.run_id, ctx.timestamp.clone(), ctx.kind, ctx.tier);

        for collection_id in &collections {
            let export = export_collection(self.store.as_ref(), collection_id).await;
            let mut detail = CollectionDetail {
                collection_id: collection_id.clone(),
                records: export.total,
                error: export.error.clone(),
                artifacts: Vec::new(),
            };

            if export.is_success() && export.total > 0 {
                let stem = artifact_stem(collection_id, ctx.kind, &ctx.timestamp);
                let encode_ctx = EncodeContext {
                    collection_id,
                    exported_at: now,
                    file_stem: &stem,
                    output_dir: &output_dir,
                };
                for encoder in &self.encoders {
                    let path = encoder.encode(&export.rows, &encode_ctx)?;
                    let record = ArtifactRecord::from_path(path, encoder.format())?;
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = crate::observability::BackupMetrics::global() {
                        metrics.record_artifact(record.size_bytes);
                    }
                    detail.artifacts.push(record);
                }
                info!(
                    collection = %collection_id,
                    records = export.total,
                    artifacts = detail.artifacts.len(),
                    "Backed up collection"
                );
            } else if export.is_success() {
                info!(collection = %collection_id, "Collection is empty, nothing to encode");
            } else {
                warn!(
                    collection = %collection_id,
                    error = export.error.as_deref().unwrap_or_default(),
                    "Collection skipped"
                );
            }

            summary.push(detail);
        }

        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary_path = summary.write_to(&self.layout.logs_dir())?;

        let reports = self
            .with_retention_blocking(|retention| retention.cleanup_all())
            .await?;
        for report in reports {
            if report.failed > 0 {
                warn!(
                    directory = %report.directory.display(),
                    failed = report.failed,
                    "Some expired artifacts could not be deleted"
                );
            }
        }

        info!(
            run_id = %ctx.run_id,
            collections = summary.collections_exported,
            failed = summary.failed_collections().count(),
            records = summary.total_records,
            duration_ms = summary.duration_ms,
            summary = %summary_path.display(),
            "Backup run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::StaticCollections;
    use crate::record::Row;
    use crate::reporter::{MemoryReporter, EVENT_COMPLETED, EVENT_FAILED, EVENT_STARTED};
    use crate::store::MemoryRowStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                json!({"$id": format!("r{i}"), "title": format!("Row {i}")})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn artifact_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_run_reports_lifecycle_and_writes_summary() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("posts", rows(2)));
        let reporter = MemoryReporter::new();
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path())
            .with_reporter(Arc::new(reporter.clone()));

        let summary = orchestrator.perform_backup(BackupKind::Auto).await.unwrap();

        assert_eq!(reporter.event_names(), vec![EVENT_STARTED, EVENT_COMPLETED]);
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.artifacts().count(), 3);
        assert!(temp_dir
            .path()
            .join("logs")
            .join(summary.file_name())
            .exists());
        assert!(!temp_dir.path().join(BackupLayout::RUN_LOCK).exists());
    }

    #[tokio::test]
    async fn test_discovery_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new());
        let reporter = MemoryReporter::new();
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path())
            .with_provider(Box::new(FailingProvider))
            .with_reporter(Arc::new(reporter.clone()));

        let err = orchestrator.perform_backup(BackupKind::Manual).await.unwrap_err();
        assert!(matches!(err, BackupError::Store(_)));
        assert_eq!(reporter.event_names(), vec![EVENT_STARTED, EVENT_FAILED]);
        assert!(!temp_dir.path().join(BackupLayout::RUN_LOCK).exists());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("posts", rows(1)));
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path());
        orchestrator.layout().ensure_dirs().unwrap();

        let _held = DirLock::acquire(
            &orchestrator.layout().run_lock_path(),
            "other process",
            Duration::from_secs(3600),
        )
        .unwrap();
        let err = orchestrator.perform_backup(BackupKind::Manual).await.unwrap_err();
        assert!(matches!(err, BackupError::RunInProgress(_)));
        assert!(artifact_names(&temp_dir.path().join("daily")).is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_run_waits_for_held_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("posts", rows(1)));
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path());
        orchestrator.layout().ensure_dirs().unwrap();

        let held = DirLock::acquire(
            &orchestrator.layout().run_lock_path(),
            "manual daily backup",
            Duration::from_secs(3600),
        )
        .unwrap();
        let release = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        };
        let ((), summary) = tokio::join!(release, orchestrator.perform_scheduled_backup(Tier::Daily));

        let summary = summary.unwrap();
        assert_eq!(summary.backup_type, BackupKind::Auto);
        assert_eq!(artifact_names(&temp_dir.path().join("daily")).len(), 3);
        assert!(!temp_dir.path().join(BackupLayout::RUN_LOCK).exists());
    }

    #[tokio::test]
    async fn test_scheduled_run_gives_up_after_wait() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("posts", rows(1)));
        let reporter = MemoryReporter::new();
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path())
            .with_reporter(Arc::new(reporter.clone()))
            .with_run_lock_wait(Duration::from_millis(200));
        orchestrator.layout().ensure_dirs().unwrap();

        let _held = DirLock::acquire(
            &orchestrator.layout().run_lock_path(),
            "other process",
            Duration::from_secs(3600),
        )
        .unwrap();
        let err = orchestrator
            .perform_scheduled_backup(Tier::Weekly)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RunInProgress(_)));
        assert!(reporter.event_names().is_empty());
        assert!(artifact_names(&temp_dir.path().join("weekly")).is_empty());
    }

    #[tokio::test]
    async fn test_tier_backup_writes_into_target_tier_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("tags", rows(4)));
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path())
            .with_provider(Box::new(StaticCollections::new(["tags"])))
            .with_formats(
                &FormatConfig {
                    sql: true,
                    bson: false,
                    xlsx: false,
                },
                GzipCompressor::new(),
            );

        let summary = orchestrator
            .perform_tier_backup(BackupKind::Auto, Tier::Monthly)
            .await
            .unwrap();

        assert_eq!(summary.tier, Tier::Monthly);
        assert!(artifact_names(&temp_dir.path().join("daily")).is_empty());
        let monthly = artifact_names(&temp_dir.path().join("monthly"));
        assert_eq!(monthly.len(), 1);
        assert!(monthly[0].starts_with("tags_") && monthly[0].ends_with(".sql.gz"));
    }

    #[tokio::test]
    async fn test_retention_applies_after_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRowStore::new().with_collection("posts", rows(1)));
        let orchestrator = BackupOrchestrator::new(store, temp_dir.path()).with_retention(
            RetentionPolicy {
                daily: 2,
                weekly: 4,
                monthly: 12,
            },
        );

        orchestrator.perform_backup(BackupKind::Manual).await.unwrap();
        assert_eq!(artifact_names(&temp_dir.path().join("daily")).len(), 2);
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl CollectionProvider for FailingProvider {
        async fn discover(&self, _store: &dyn RowStore) -> Result<Vec<String>> {
            Err(BackupError::store("listing tables is not permitted"))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }
}
