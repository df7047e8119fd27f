/*!
Run lifecycle reporting.

The orchestrator announces the start, completion and failure of every run
through a [`Reporter`]. Reporting is best effort: implementations swallow
their own errors so that an unavailable audit sink never fails a backup.
*/

use crate::artifact::BackupKind;
use crate::record::Row;
use crate::store::RowStore;
use crate::summary::RunSummary;
use crate::tier::Tier;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const EVENT_STARTED: &str = "backup_started";
pub const EVENT_COMPLETED: &str = "backup_completed";
pub const EVENT_FAILED: &str = "backup_failed";

/// Identifies the run an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub kind: BackupKind,
    pub tier: Tier,
    pub timestamp: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn record_start(&self, ctx: &RunContext);

    async fn record_completion(&self, ctx: &RunContext, summary: &RunSummary);

    async fn record_failure(&self, ctx: &RunContext, error: &str);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    async fn record_start(&self, _ctx: &RunContext) {}

    async fn record_completion(&self, _ctx: &RunContext, _summary: &RunSummary) {}

    async fn record_failure(&self, _ctx: &RunContext, _error: &str) {}
}

/// Emits events as structured log lines
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

#[async_trait]
impl Reporter for TracingReporter {
    async fn record_start(&self, ctx: &RunContext) {
        info!(
            event = EVENT_STARTED,
            run_id = %ctx.run_id,
            kind = %ctx.kind,
            tier = %ctx.tier,
            "Backup started"
        );
    }

    async fn record_completion(&self, ctx: &RunContext, summary: &RunSummary) {
        info!(
            event = EVENT_COMPLETED,
            run_id = %ctx.run_id,
            kind = %ctx.kind,
            tier = %ctx.tier,
            collections = summary.collections_exported,
            records = summary.total_records,
            duration_ms = summary.duration_ms,
            "Backup completed"
        );
    }

    async fn record_failure(&self, ctx: &RunContext, error: &str) {
        error!(
            event = EVENT_FAILED,
            run_id = %ctx.run_id,
            kind = %ctx.kind,
            tier = %ctx.tier,
            error,
            "Backup failed"
        );
    }
}

/// Event captured by [`MemoryReporter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedEvent {
    pub event: &'static str,
    pub run_id: Uuid,
    pub detail: Option<String>,
}

/// Keeps events in memory for inspection
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    events: Arc<Mutex<Vec<ReportedEvent>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event).collect()
    }

    fn push(&self, event: &'static str, run_id: Uuid, detail: Option<String>) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(ReportedEvent {
            event,
            run_id,
            detail,
        });
    }
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn record_start(&self, ctx: &RunContext) {
        self.push(EVENT_STARTED, ctx.run_id, None);
    }

    async fn record_completion(&self, ctx: &RunContext, summary: &RunSummary) {
        self.push(
            EVENT_COMPLETED,
            ctx.run_id,
            Some(format!(
                "{} collections, {} records",
                summary.collections_exported, summary.total_records
            )),
        );
    }

    async fn record_failure(&self, ctx: &RunContext, error: &str) {
        self.push(EVENT_FAILED, ctx.run_id, Some(error.to_string()));
    }
}

/// Writes audit rows into a collection of the row store
///
/// Each event becomes a row
/// `{ event, resource: "backup", metadata: <JSON string>, timestamp }`.
pub struct StoreAuditReporter {
    store: Arc<dyn RowStore>,
    collection_id: String,
}

impl StoreAuditReporter {
    pub fn new(store: Arc<dyn RowStore>, collection_id: impl Into<String>) -> Self {
        Self {
            store,
            collection_id: collection_id.into(),
        }
    }

    async fn write(&self, event: &str, metadata: Value) {
        let mut row = Row::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert("resource".to_string(), Value::String("backup".to_string()));
        row.insert("metadata".to_string(), Value::String(metadata.to_string()));
        row.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        if let Err(e) = self.store.create_row(&self.collection_id, row).await {
            warn!(
                collection = %self.collection_id,
                event,
                error = %e,
                "Failed to write audit event"
            );
        }
    }
}

fn context_metadata(ctx: &RunContext) -> Value {
    json!({
        "run_id": ctx.run_id,
        "type": ctx.kind,
        "tier": ctx.tier,
        "timestamp": ctx.timestamp,
    })
}

#[async_trait]
impl Reporter for StoreAuditReporter {
    async fn record_start(&self, ctx: &RunContext) {
        self.write(EVENT_STARTED, context_metadata(ctx)).await;
    }

    async fn record_completion(&self, ctx: &RunContext, summary: &RunSummary) {
        let mut metadata = context_metadata(ctx);
        metadata["collections_exported"] = json!(summary.collections_exported);
        metadata["total_records"] = json!(summary.total_records);
        metadata["duration_ms"] = json!(summary.duration_ms);
        self.write(EVENT_COMPLETED, metadata).await;
    }

    async fn record_failure(&self, ctx: &RunContext, error: &str) {
        let mut metadata = context_metadata(ctx);
        metadata["error"] = json!(error);
        self.write(EVENT_FAILED, metadata).await;
    }
}

/// Fans events out to several reporters in order
#[derive(Default)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl CompositeReporter {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

#[async_trait]
impl Reporter for CompositeReporter {
    async fn record_start(&self, ctx: &RunContext) {
        for reporter in &self.reporters {
            reporter.record_start(ctx).await;
        }
    }

    async fn record_completion(&self, ctx: &RunContext, summary: &RunSummary) {
        for reporter in &self.reporters {
            reporter.record_completion(ctx, summary).await;
        }
    }

    async fn record_failure(&self, ctx: &RunContext, error: &str) {
        for reporter in &self.reporters {
            reporter.record_failure(ctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRowStore;

    fn ctx() -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            kind: BackupKind::Manual,
            tier: Tier::Daily,
            timestamp: "2024-03-10T02-00-00-000Z".to_string(),
        }
    }

    fn summary(ctx: &RunContext) -> RunSummary {
        let mut summary =
            RunSummary::new(ctx.run_id, ctx.timestamp.clone(), ctx.kind, ctx.tier);
        summary.collections_exported = 2;
        summary.total_records = 9;
        summary
    }

    #[tokio::test]
    async fn test_memory_reporter_records_in_order() {
        let reporter = MemoryReporter::new();
        let ctx = ctx();
        reporter.record_start(&ctx).await;
        reporter.record_completion(&ctx, &summary(&ctx)).await;
        reporter.record_failure(&ctx, "disk full").await;

        assert_eq!(
            reporter.event_names(),
            vec![EVENT_STARTED, EVENT_COMPLETED, EVENT_FAILED]
        );
        assert_eq!(reporter.events()[2].detail.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_store_audit_rows() {
        let store = Arc::new(MemoryRowStore::new());
        let reporter = StoreAuditReporter::new(store.clone(), "audit_logs");
        let ctx = ctx();

        reporter.record_start(&ctx).await;
        reporter.record_completion(&ctx, &summary(&ctx)).await;

        let rows = store.rows("audit_logs");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["event"], EVENT_STARTED);
        assert_eq!(rows[1]["resource"], "backup");

        let metadata: Value =
            serde_json::from_str(rows[1]["metadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["type"], "manual");
        assert_eq!(metadata["total_records"], 9);
    }

    #[tokio::test]
    async fn test_store_audit_errors_are_swallowed() {
        let store = Arc::new(MemoryRowStore::new());
        store.fail_collection("audit_logs", "unauthorized");
        let reporter = StoreAuditReporter::new(store.clone(), "audit_logs");

        reporter.record_failure(&ctx(), "boom").await;
        assert!(store.rows("audit_logs").is_empty());
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let first = MemoryReporter::new();
        let second = MemoryReporter::new();
        let composite = CompositeReporter::new(vec![
            Arc::new(first.clone()),
            Arc::new(TracingReporter),
            Arc::new(second.clone()),
        ]);

        composite.record_start(&ctx()).await;
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
    }
}
