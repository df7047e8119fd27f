/*!
Inkvault CLI - cron daemon and one-shot commands for blog content backups.

Without arguments the binary runs the backup scheduler in the foreground until
it receives SIGINT/SIGTERM or a stop request from `inkvault --stop`.
*/

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{ArgGroup, Parser};
use inkvault_core::{
    artifact::is_artifact_path,
    observability::init_observability,
    schedule::{
        daemon, next_fire_after, parse_cron, parse_timezone, register_backup_jobs,
        run_scheduled_tier, trigger_backup, Scheduler,
    },
    AppwriteRowStore, BackupLayout, BackupOrchestrator, InkvaultConfig, RunSummary, Tier,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{info, warn};

/// How often the daemon refreshes its state file and polls for stop requests
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A daemon whose heartbeat is older than this is considered gone
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "inkvault")]
#[command(about = "Scheduled SQL, BSON and XLSX backups of blog content")]
#[command(version)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
struct Cli {
    /// Run the backup scheduler in the foreground (default)
    #[arg(long, group = "mode")]
    start: bool,

    /// Ask a running scheduler to shut down
    #[arg(long, group = "mode")]
    stop: bool,

    /// Run a manual backup into the daily tier now
    #[arg(long, group = "mode")]
    trigger_daily: bool,

    /// Run a manual backup into the weekly tier now
    #[arg(long, group = "mode")]
    trigger_weekly: bool,

    /// Run a manual backup into the monthly tier now
    #[arg(long, group = "mode")]
    trigger_monthly: bool,

    /// Run the scheduled job of one tier once (promotion included), for system cron
    #[arg(long, group = "mode", value_name = "TIER")]
    run_tier: Option<Tier>,

    /// Show configured jobs, next run times and tier contents
    #[arg(long, group = "mode")]
    status: bool,

    /// Print instructions for driving backups from the system crontab
    #[arg(long, group = "mode")]
    system_cron: bool,

    /// Print instructions for running the scheduler in a container
    #[arg(long, group = "mode")]
    docker_cron: bool,

    /// One-shot manual backup into the daily tier
    #[arg(long, group = "mode")]
    backup: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory containing the `.env` file
    #[arg(long, env = "INKVAULT_CONFIG_ROOT", value_name = "DIR")]
    config_root: Option<PathBuf>,

    /// Write Prometheus metrics here after each run (node_exporter textfile format)
    #[arg(long, env = "INKVAULT_METRICS_FILE", value_name = "PATH")]
    metrics_file: Option<PathBuf>,
}

enum Mode {
    Start,
    Stop,
    Trigger(Tier),
    RunTier(Tier),
    Status,
    SystemCron,
    DockerCron,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.stop {
            Mode::Stop
        } else if self.trigger_daily || self.backup {
            Mode::Trigger(Tier::Daily)
        } else if self.trigger_weekly {
            Mode::Trigger(Tier::Weekly)
        } else if self.trigger_monthly {
            Mode::Trigger(Tier::Monthly)
        } else if let Some(tier) = self.run_tier {
            Mode::RunTier(tier)
        } else if self.status {
            Mode::Status
        } else if self.system_cron {
            Mode::SystemCron
        } else if self.docker_cron {
            Mode::DockerCron
        } else {
            Mode::Start
        }
    }
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    name: String,
    #[tabled(rename = "Schedule")]
    cron: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Next run")]
    next_run: String,
    #[tabled(rename = "Last run")]
    last_run: String,
}

#[derive(Tabled)]
struct TierRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Artifacts")]
    artifacts: usize,
    #[tabled(rename = "Keep")]
    keep: usize,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    load_env(cli.config_root.as_deref())?;

    let mut config = InkvaultConfig::from_env().context("Invalid configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    let metrics_file = cli.metrics_file.as_deref();
    match cli.mode() {
        Mode::SystemCron => print_system_cron(&config),
        Mode::DockerCron => print_docker_cron(&config),
        Mode::Status => print_status(&config)?,
        Mode::Stop => stop_daemon(&config)?,
        Mode::Trigger(tier) => {
            init_observability(&config.logging)?;
            let orchestrator = build_orchestrator(&config)?;
            let result = trigger_backup(&orchestrator, tier).await;
            export_metrics(metrics_file);
            print_summary(&result?);
        }
        Mode::RunTier(tier) => {
            init_observability(&config.logging)?;
            let orchestrator = build_orchestrator(&config)?;
            let result = run_scheduled_tier(&orchestrator, tier).await;
            export_metrics(metrics_file);
            print_summary(&result?);
        }
        Mode::Start => {
            init_observability(&config.logging)?;
            run_daemon(&config, metrics_file).await?;
        }
    }

    Ok(())
}

fn load_env(config_root: Option<&Path>) -> Result<(), anyhow::Error> {
    match config_root {
        Some(root) => {
            let path = root.join(".env");
            if path.exists() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
            }
        }
        None => {
            // A missing .env file is fine; the environment may be set directly.
            if let Err(e) = dotenvy::dotenv() {
                if !e.not_found() {
                    return Err(e).context("Failed to load .env");
                }
            }
        }
    }
    Ok(())
}

fn build_orchestrator(config: &InkvaultConfig) -> Result<BackupOrchestrator, anyhow::Error> {
    let store = Arc::new(AppwriteRowStore::new(&config.store)?);
    Ok(BackupOrchestrator::from_config(config, store))
}

async fn run_daemon(
    config: &InkvaultConfig,
    metrics_file: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let layout = BackupLayout::new(&config.backup_root);
    layout.ensure_dirs()?;

    if let Some(state) = daemon::read_state(&layout) {
        if state.is_alive(Utc::now(), HEARTBEAT_TIMEOUT) {
            bail!("A scheduler is already running (pid {})", state.pid);
        }
    }
    // A request left over from an earlier daemon must not stop this one.
    daemon::take_stop_request(&layout)?;

    let orchestrator = Arc::new(build_orchestrator(config)?);
    let mut scheduler = Scheduler::new();
    let jobs = register_backup_jobs(&mut scheduler, orchestrator, &config.schedules)?;
    if jobs.is_empty() {
        bail!("All backup jobs are disabled; nothing to schedule");
    }

    scheduler.start()?;
    let started_at = Utc::now();
    info!(jobs = ?jobs, root = %config.backup_root.display(), "Backup scheduler running");

    let ctrl_c = tokio::signal::ctrl_c();
    let terminate = wait_for_terminate();
    tokio::pin!(ctrl_c, terminate);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = &mut terminate => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let state = daemon::SchedulerState::new(started_at, scheduler.status());
                if let Err(e) = daemon::write_state(&layout, &state) {
                    warn!(error = %e, "Failed to write scheduler state");
                }
                export_metrics(metrics_file);
                match daemon::take_stop_request(&layout) {
                    Ok(true) => {
                        info!("Stop requested, shutting down");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to check for stop request"),
                }
            }
        }
    }

    scheduler.stop_all().await;
    daemon::clear_state(&layout)?;
    info!("Backup scheduler stopped");
    Ok(())
}

/// Refresh the metrics file, if one was requested
fn export_metrics(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    #[cfg(feature = "metrics")]
    if let Err(e) = inkvault_core::observability::write_metrics_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to write metrics file");
    }
    #[cfg(not(feature = "metrics"))]
    warn!(path = %path.display(), "Built without the metrics feature; no metrics written");
}

#[cfg(unix)]
async fn wait_for_terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
    std::future::pending::<()>().await;
}

fn stop_daemon(config: &InkvaultConfig) -> Result<(), anyhow::Error> {
    let layout = BackupLayout::new(&config.backup_root);
    match daemon::read_state(&layout) {
        Some(state) if state.is_alive(Utc::now(), HEARTBEAT_TIMEOUT) => {
            daemon::request_stop(&layout)?;
            println!(
                "Stop requested for scheduler pid {}; it will exit within {}s",
                state.pid,
                POLL_INTERVAL.as_secs()
            );
        }
        _ => println!("No running scheduler found"),
    }
    Ok(())
}

fn print_status(config: &InkvaultConfig) -> Result<(), anyhow::Error> {
    let layout = BackupLayout::new(&config.backup_root);
    let timezone = parse_timezone(&config.schedules.timezone)?;
    let now = Utc::now();
    let daemon_state = daemon::read_state(&layout).filter(|s| s.is_alive(now, HEARTBEAT_TIMEOUT));

    let mut jobs = Vec::new();
    for tier in Tier::ALL {
        let job = config.schedules.for_tier(tier);
        let next_run = if job.enabled {
            next_fire_after(&parse_cron(&job.cron)?, timezone, now)
                .map(format_local)
                .unwrap_or_else(|| "never".to_string())
        } else {
            "-".to_string()
        };
        let last_run = daemon_state
            .as_ref()
            .and_then(|state| state.jobs.iter().find(|j| j.name == tier.as_str()))
            .and_then(|j| j.last_run)
            .map(format_local)
            .unwrap_or_else(|| "-".to_string());
        jobs.push(JobRow {
            name: tier.to_string(),
            cron: job.cron.clone(),
            enabled: if job.enabled { "yes" } else { "no" }.to_string(),
            next_run,
            last_run,
        });
    }

    let mut tiers = Vec::new();
    for tier in Tier::ALL {
        let (count, bytes) = tier_usage(&layout.tier_dir(tier));
        tiers.push(TierRow {
            tier: tier.to_string(),
            artifacts: count,
            keep: config.retention.cap(tier),
            size: format_size(bytes),
        });
    }

    match &daemon_state {
        Some(state) => println!(
            "Scheduler: running (pid {}, since {})",
            state.pid,
            format_local(state.started_at)
        ),
        None => println!("Scheduler: not running"),
    }
    println!("Timezone: {}", config.schedules.timezone);
    println!("Backup root: {}", config.backup_root.display());
    println!();
    println!("{}", Table::new(jobs));
    println!();
    println!("{}", Table::new(tiers));
    Ok(())
}

fn tier_usage(dir: &Path) -> (usize, u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (0, 0);
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| is_artifact_path(&entry.path()))
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .fold((0, 0), |(count, bytes), meta| (count + 1, bytes + meta.len()))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "✓ {} backup into {} finished in {} ms",
        summary.backup_type, summary.tier, summary.duration_ms
    );
    println!(
        "  {} collections, {} records, {} artifacts",
        summary.collections_exported,
        summary.total_records,
        summary.artifacts().count()
    );
    for failed in summary.failed_collections() {
        println!(
            "  ✗ {}: {}",
            failed.collection_id,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_system_cron(config: &InkvaultConfig) {
    let binary = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "inkvault".to_string());
    let workdir = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());

    println!("System cron setup");
    println!("=================");
    println!();
    println!("Add these lines with `crontab -e` (times are in the system timezone):");
    println!();
    for tier in Tier::ALL {
        let job = config.schedules.for_tier(tier);
        let prefix = if job.enabled { "" } else { "# disabled: " };
        println!(
            "{prefix}{} cd {workdir} && {binary} --run-tier {tier} >> {}/cron.log 2>&1",
            job.cron,
            config.backup_root.join("logs").display()
        );
    }
    println!();
    println!("Do not run `inkvault --start` at the same time, or every backup runs twice.");
}

fn print_docker_cron(config: &InkvaultConfig) {
    println!("Docker setup");
    println!("============");
    println!();
    println!("Run the scheduler as the container's main process:");
    println!();
    println!("  services:");
    println!("    inkvault:");
    println!("      image: inkvault:latest");
    println!("      command: [\"inkvault\", \"--start\"]");
    println!("      env_file: .env");
    println!("      environment:");
    println!("        BACKUP_ROOT: /backup");
    println!("        BACKUP_TIMEZONE: {}", config.schedules.timezone);
    println!("      volumes:");
    println!("        - ./backup:/backup");
    println!("      restart: unless-stopped");
    println!();
    println!("`docker stop` sends SIGTERM; the scheduler finishes a running backup and exits.");
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
