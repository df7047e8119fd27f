//! Configuration for the backup pipeline
//!
//! Every setting has a default and can be overridden through environment
//! variables (see [`InkvaultConfig::from_env`]). Parsing is separated from the
//! process environment so that tests can feed their own variable maps.

use crate::artifact::ArtifactFormat;
use crate::schedule::{parse_cron, parse_timezone};
use crate::tier::Tier;
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Collections checked in static discovery mode when no list is configured
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "posts",
    "categories",
    "tags",
    "comments",
    "post_views",
    "post_likes",
];

/// Connection settings for the Appwrite row store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub endpoint: String,
    pub project_id: Option<String>,
    pub api_key: Option<String>,
    pub database_id: Option<String>,
    /// Rows requested per page when listing
    pub page_size: usize,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://cloud.appwrite.io/v1".to_string(),
            project_id: None,
            api_key: None,
            database_id: None,
            page_size: 100,
            timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    /// Ensure the credentials needed to talk to Appwrite are present
    pub fn require_credentials(&self) -> Result<(&str, &str, &str)> {
        fn required<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BackupError::config(format!("{var} is required")))
        }
        Ok((
            required(&self.project_id, "APPWRITE_PROJECT_ID")?,
            required(&self.api_key, "APPWRITE_API_KEY")?,
            required(&self.database_id, "APPWRITE_DATABASE_ID")?,
        ))
    }
}

/// Number of most-recent artifacts kept per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl RetentionPolicy {
    pub fn cap(&self, tier: Tier) -> usize {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

/// Cron trigger for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub cron: String,
    pub enabled: bool,
}

impl JobSchedule {
    fn new(cron: &str) -> Self {
        Self {
            cron: cron.to_string(),
            enabled: true,
        }
    }
}

/// Cron triggers for all tiers plus the timezone they are evaluated in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub timezone: String,
    pub daily: JobSchedule,
    pub weekly: JobSchedule,
    pub monthly: JobSchedule,
}

impl ScheduleConfig {
    pub fn for_tier(&self, tier: Tier) -> &JobSchedule {
        match tier {
            Tier::Daily => &self.daily,
            Tier::Weekly => &self.weekly,
            Tier::Monthly => &self.monthly,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            daily: JobSchedule::new("0 2 * * *"),
            weekly: JobSchedule::new("0 3 * * 0"),
            monthly: JobSchedule::new("0 4 1 * *"),
        }
    }
}

/// Which output formats are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatConfig {
    pub sql: bool,
    pub bson: bool,
    pub xlsx: bool,
}

impl FormatConfig {
    pub fn is_enabled(&self, format: ArtifactFormat) -> bool {
        match format {
            ArtifactFormat::Sql => self.sql,
            ArtifactFormat::Bson => self.bson,
            ArtifactFormat::Xlsx => self.xlsx,
        }
    }

    pub fn enabled(&self) -> Vec<ArtifactFormat> {
        ArtifactFormat::ALL
            .into_iter()
            .filter(|format| self.is_enabled(*format))
            .collect()
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            sql: true,
            bson: true,
            xlsx: true,
        }
    }
}

/// How the set of collections to back up is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Ask the store for every collection in the database
    Dynamic,
    /// Check a fixed allow-list, skipping unreadable entries
    Static,
}

impl FromStr for DiscoveryMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamic" => Ok(DiscoveryMode::Dynamic),
            "static" => Ok(DiscoveryMode::Static),
            other => Err(BackupError::config(format!(
                "BACKUP_DISCOVERY must be 'dynamic' or 'static', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Allow-list for static mode
    pub collections: Vec<String>,
    /// Collections never backed up in dynamic mode
    pub exclude: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Dynamic,
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            exclude: vec!["audit_logs".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(BackupError::config(format!(
                "LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Optional log file, written in addition to stderr
    pub file: Option<PathBuf>,
    /// Rotate the log file once it grows past this size
    pub max_size_mb: u64,
    /// Number of rotated generations kept next to the active file
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            max_size_mb: 10,
            max_files: 5,
        }
    }
}

/// Complete configuration of the backup system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InkvaultConfig {
    pub store: StoreConfig,
    pub backup_root: PathBuf,
    pub retention: RetentionPolicy,
    pub schedules: ScheduleConfig,
    pub formats: FormatConfig,
    pub discovery: DiscoveryConfig,
    /// Collection receiving audit events; `None` disables store auditing
    pub audit_collection: Option<String>,
    pub compression_level: u32,
    /// Locks older than this are considered abandoned and broken
    pub lock_stale_after_secs: u64,
    /// How long a scheduled run waits for a run already in progress
    pub run_lock_wait_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for InkvaultConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            backup_root: PathBuf::from("./backup"),
            retention: RetentionPolicy::default(),
            schedules: ScheduleConfig::default(),
            formats: FormatConfig::default(),
            discovery: DiscoveryConfig::default(),
            audit_collection: Some("audit_logs".to_string()),
            compression_level: 6,
            lock_stale_after_secs: 6 * 60 * 60,
            run_lock_wait_secs: 2 * 60 * 60,
            logging: LoggingConfig::default(),
        }
    }
}

impl InkvaultConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    ///
    /// Empty values are treated as unset. The result is validated before it
    /// is returned.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("APPWRITE_ENDPOINT") {
            config.store.endpoint = v.trim_end_matches('/').to_string();
        }
        config.store.project_id = get("APPWRITE_PROJECT_ID");
        config.store.api_key = get("APPWRITE_API_KEY");
        config.store.database_id = get("APPWRITE_DATABASE_ID");
        set_parsed(&get, "APPWRITE_PAGE_SIZE", &mut config.store.page_size)?;
        set_parsed(&get, "APPWRITE_TIMEOUT_SECS", &mut config.store.timeout_secs)?;

        if let Some(v) = get("BACKUP_ROOT") {
            config.backup_root = PathBuf::from(v);
        }
        set_parsed(&get, "BACKUP_RETENTION_DAILY", &mut config.retention.daily)?;
        set_parsed(&get, "BACKUP_RETENTION_WEEKLY", &mut config.retention.weekly)?;
        set_parsed(&get, "BACKUP_RETENTION_MONTHLY", &mut config.retention.monthly)?;

        if let Some(v) = get("BACKUP_TIMEZONE") {
            config.schedules.timezone = v;
        }
        for (prefix, job) in [
            ("BACKUP_DAILY", &mut config.schedules.daily),
            ("BACKUP_WEEKLY", &mut config.schedules.weekly),
            ("BACKUP_MONTHLY", &mut config.schedules.monthly),
        ] {
            if let Some(v) = get(&format!("{prefix}_CRON")) {
                job.cron = v;
            }
            set_bool(&get, &format!("{prefix}_ENABLED"), &mut job.enabled)?;
        }

        set_bool(&get, "BACKUP_FORMAT_SQL", &mut config.formats.sql)?;
        set_bool(&get, "BACKUP_FORMAT_BSON", &mut config.formats.bson)?;
        set_bool(&get, "BACKUP_FORMAT_XLSX", &mut config.formats.xlsx)?;

        if let Some(v) = get("BACKUP_DISCOVERY") {
            config.discovery.mode = v.parse()?;
        }
        if let Some(v) = get("BACKUP_COLLECTIONS") {
            config.discovery.collections = split_list(&v);
        }
        if let Some(v) = lookup("BACKUP_EXCLUDE_COLLECTIONS") {
            config.discovery.exclude = split_list(&v);
        }
        if let Some(v) = lookup("BACKUP_AUDIT_COLLECTION") {
            let v = v.trim();
            config.audit_collection = (!v.is_empty()).then(|| v.to_string());
        }

        set_parsed(&get, "BACKUP_COMPRESSION_LEVEL", &mut config.compression_level)?;
        set_parsed(&get, "BACKUP_LOCK_STALE_SECS", &mut config.lock_stale_after_secs)?;
        set_parsed(&get, "BACKUP_RUN_LOCK_WAIT_SECS", &mut config.run_lock_wait_secs)?;

        if let Some(v) = get("LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            config.logging.format = v.parse()?;
        }
        config.logging.file = get("LOG_FILE").map(PathBuf::from);
        set_parsed(&get, "LOG_MAX_SIZE_MB", &mut config.logging.max_size_mb)?;
        set_parsed(&get, "LOG_MAX_FILES", &mut config.logging.max_files)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            if self.retention.cap(tier) == 0 {
                return Err(BackupError::validation(format!(
                    "Retention for the {tier} tier must keep at least one artifact"
                )));
            }
            let job = self.schedules.for_tier(tier);
            parse_cron(&job.cron).map_err(|e| {
                BackupError::validation(format!("Invalid {tier} cron expression: {e}"))
            })?;
        }
        parse_timezone(&self.schedules.timezone)?;

        if self.compression_level > 9 {
            return Err(BackupError::validation(
                "Compression level must be between 0 and 9",
            ));
        }
        if self.formats.enabled().is_empty() {
            return Err(BackupError::validation(
                "At least one backup format must be enabled",
            ));
        }
        if self.discovery.mode == DiscoveryMode::Static && self.discovery.collections.is_empty() {
            return Err(BackupError::validation(
                "Static discovery requires at least one collection",
            ));
        }
        if self.store.page_size == 0 {
            return Err(BackupError::validation("APPWRITE_PAGE_SIZE must be positive"));
        }
        Ok(())
    }
}

fn set_parsed<G, T>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| BackupError::config(format!("{key}: invalid value '{raw}': {e}")))?;
    }
    Ok(())
}

fn set_bool<G>(get: &G, key: &str, target: &mut bool) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(BackupError::config(format!(
                    "{key}: expected a boolean, got '{raw}'"
                )))
            }
        };
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
