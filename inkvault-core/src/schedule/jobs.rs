/*!
Backup jobs wired into the scheduler.

| job       | default cron  | action                                          |
|-----------|---------------|-------------------------------------------------|
| `daily`   | `0 2 * * *`   | automatic backup into `daily/`                  |
| `weekly`  | `0 3 * * 0`   | promote newest daily artifact, backup `weekly/` |
| `monthly` | `0 4 1 * *`   | promote newest weekly artifact, backup `monthly/` |
*/

use super::{parse_timezone, Scheduler};
use crate::artifact::BackupKind;
use crate::config::ScheduleConfig;
use crate::orchestrator::BackupOrchestrator;
use crate::summary::RunSummary;
use crate::tier::Tier;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Register one job per enabled tier
///
/// # Returns
/// The names of the registered jobs
pub fn register_backup_jobs(
    scheduler: &mut Scheduler,
    orchestrator: Arc<BackupOrchestrator>,
    config: &ScheduleConfig,
) -> Result<Vec<String>> {
    let timezone = parse_timezone(&config.timezone)?;
    let mut registered = Vec::new();

    for tier in Tier::ALL {
        let job = config.for_tier(tier);
        if !job.enabled {
            info!(%tier, "Backup job disabled");
            continue;
        }
        let orchestrator = Arc::clone(&orchestrator);
        scheduler.register(tier.as_str(), &job.cron, timezone, move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { run_scheduled_tier(&orchestrator, tier).await.map(|_| ()) }
        })?;
        info!(%tier, cron = %job.cron, timezone = %config.timezone, "Backup job registered");
        registered.push(tier.as_str().to_string());
    }

    Ok(registered)
}

/// What a scheduled job does for `tier`
///
/// Weekly and monthly runs first promote the newest artifact of the tier
/// below. A run still in progress is waited for rather than skipped.
pub async fn run_scheduled_tier(orchestrator: &BackupOrchestrator, tier: Tier) -> Result<RunSummary> {
    orchestrator.perform_scheduled_backup(tier).await
}

/// Run a manual backup into `tier` right away, without promotion
pub async fn trigger_backup(orchestrator: &BackupOrchestrator, tier: Tier) -> Result<RunSummary> {
    info!(%tier, "Manual backup triggered");
    orchestrator.perform_tier_backup(BackupKind::Manual, tier).await
}
