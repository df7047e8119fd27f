/*!
Observability infrastructure for Inkvault.

This module provides:
- Structured logging setup (text or JSON) with `RUST_LOG`-style filtering
- An optional log file with size-based rotation
- Prometheus metrics for backup runs (behind the `metrics` feature)
*/

use crate::config::{LogFormat, LoggingConfig};
use crate::{BackupError, Result};
#[cfg(feature = "metrics")]
use prometheus::{core::Collector, Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry as TracingRegistry};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackupMetrics>> = OnceLock::new();

/// Metrics collected across backup runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub runs_total: Counter,
    pub run_failures_total: Counter,
    pub records_exported_total: Counter,
    pub artifacts_written_total: Counter,
    pub artifact_size_bytes: Histogram,
    pub run_duration_seconds: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register<M>(registry: &Registry, metric: M, name: &str) -> Result<M>
where
    M: Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| BackupError::config(format!("Failed to register {name}: {e}")))?;
    Ok(metric)
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            Counter::new(name, help)
                .map_err(|e| BackupError::config(format!("Failed to create {name} metric: {e}")))
        };
        let histogram = |name: &str, help: &str, buckets: Vec<f64>| {
            Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
                .map_err(|e| BackupError::config(format!("Failed to create {name} metric: {e}")))
        };

        let runs_total = register(
            &registry,
            counter("inkvault_runs_total", "Backup runs started")?,
            "runs_total",
        )?;
        let run_failures_total = register(
            &registry,
            counter("inkvault_run_failures_total", "Backup runs that failed")?,
            "run_failures_total",
        )?;
        let records_exported_total = register(
            &registry,
            counter("inkvault_records_exported_total", "Rows exported across all collections")?,
            "records_exported_total",
        )?;
        let artifacts_written_total = register(
            &registry,
            counter("inkvault_artifacts_written_total", "Artifact files written")?,
            "artifacts_written_total",
        )?;
        let artifact_size_bytes = register(
            &registry,
            histogram(
                "inkvault_artifact_size_bytes",
                "Size of written artifacts in bytes",
                prometheus::exponential_buckets(1024.0, 4.0, 10)
                    .map_err(|e| BackupError::config(format!("Invalid buckets: {e}")))?,
            )?,
            "artifact_size_bytes",
        )?;
        let run_duration_seconds = register(
            &registry,
            histogram(
                "inkvault_run_duration_seconds",
                "Duration of backup runs in seconds",
                prometheus::DEFAULT_BUCKETS.to_vec(),
            )?,
            "run_duration_seconds",
        )?;

        Ok(Self {
            runs_total,
            run_failures_total,
            records_exported_total,
            artifacts_written_total,
            artifact_size_bytes,
            run_duration_seconds,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    ///
    /// Returns `None` if the registry could not be set up; metrics are then
    /// silently disabled for the lifetime of the process.
    pub fn global() -> Option<&'static BackupMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Record a finished run
    pub fn record_run(&self, records: usize, duration: Duration) {
        self.runs_total.inc();
        self.records_exported_total.inc_by(records as f64);
        self.run_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Record a failed run
    pub fn record_failure(&self, duration: Duration) {
        self.runs_total.inc();
        self.run_failures_total.inc();
        self.run_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_artifact(&self, size_bytes: u64) {
        self.artifacts_written_total.inc();
        self.artifact_size_bytes.observe(size_bytes as f64);
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackupError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Prometheus text exposition of the global metrics
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    BackupMetrics::global()
        .ok_or_else(|| BackupError::config("Metrics are not available"))?
        .gather_metrics()
}

/// Write the global metrics to `path` for a node_exporter textfile collector
///
/// The text is written to a sibling temporary file and renamed into place so
/// the collector never reads a partial exposition.
#[cfg(feature = "metrics")]
pub fn write_metrics_file(path: &Path) -> Result<()> {
    let text = gather_metrics()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Log file writer that rotates once the file exceeds a size limit
///
/// Rotated generations are kept as `{file}.1` (newest) up to
/// `{file}.{max_files}`.
#[derive(Debug)]
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            max_files,
            file,
            written,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_files == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = self.generation(self.max_files);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.max_files).rev() {
                let from = self.generation(n);
                if from.exists() {
                    fs::rename(&from, self.generation(n + 1))?;
                }
            }
            fs::rename(&self.path, self.generation(1))?;
        }
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the global observability system
///
/// This function sets up:
/// - An `EnvFilter` from `RUST_LOG`, falling back to the configured level
/// - Text or JSON log output on stderr
/// - An optional rotating log file in the same format as the console
/// - The global metrics registry when the `metrics` feature is enabled
///
/// # Arguments
/// * `config` - Logging settings
///
/// # Returns
/// Result indicating success or failure of initialization
pub fn init_observability(config: &LoggingConfig) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BackupError::config(format!("Invalid log level '{}': {e}", config.level)))?;

    let mut layers: Vec<Box<dyn Layer<TracingRegistry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(false)
            .with_current_span(false)
            .boxed(),
    });

    if let Some(path) = &config.file {
        let writer = RotatingFileWriter::new(
            path,
            config.max_size_mb.saturating_mul(1024 * 1024),
            config.max_files,
        )
        .map_err(|e| {
            BackupError::config(format!("Cannot open log file {}: {e}", path.display()))
        })?;
        let writer = Mutex::new(writer);
        layers.push(match config.format {
            LogFormat::Text => tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(false)
                .boxed(),
        });
    }

    let subscriber = TracingRegistry::default().with(layers).with(filter);
    set_global_default(subscriber).map_err(|e| {
        BackupError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!(format = ?config.format, file = ?config.file, "Inkvault observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotating_writer_rotates_and_caps_generations() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs").join("inkvault.log");
        let mut writer = RotatingFileWriter::new(&path, 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            writer.write_all(line.as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "dddddddd\n");
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("logs/inkvault.log.1")).unwrap(),
            "cccccccc\n"
        );
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("logs/inkvault.log.2")).unwrap(),
            "bbbbbbbb\n"
        );
        assert!(!temp_dir.path().join("logs/inkvault.log.3").exists());
    }

    #[test]
    fn test_rotating_writer_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inkvault.log");
        fs::write(&path, "previous\n").unwrap();

        let mut writer = RotatingFileWriter::new(&path, 1024, 3).unwrap();
        writer.write_all(b"next\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "previous\nnext\n");
    }

    #[test]
    fn test_rotating_writer_without_generations() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inkvault.log");
        let mut writer = RotatingFileWriter::new(&path, 4, 0).unwrap();

        writer.write_all(b"first").unwrap();
        writer.write_all(b"second").unwrap();
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_dir.path().join("inkvault.log.1").exists());
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let metrics = BackupMetrics::global().unwrap();
        metrics.record_run(3, std::time::Duration::from_millis(120));
        metrics.record_failure(std::time::Duration::from_millis(5));
        metrics.record_artifact(2048);

        let text = gather_metrics().unwrap();
        assert!(text.contains("inkvault_runs_total"));
        assert!(text.contains("inkvault_artifact_size_bytes"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_write_metrics_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("textfile").join("inkvault.prom");
        BackupMetrics::global().unwrap().record_artifact(512);

        write_metrics_file(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("inkvault_artifacts_written_total"));
        assert!(!temp_dir.path().join("textfile").join("inkvault.prom.tmp").exists());
    }
}
