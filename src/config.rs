//! Capture settings, loadable from a RON file.
//!
//! Every knob has a default that matches the hardware this was built
//! around, so a missing or partial config file is fine. Durations are
//! plain millisecond integers in the file and get typed here.

use crate::link::LinkConfig;
use crate::storage::WriterConfig;
use crate::watchdog::WatchdogConfig;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning for the whole capture pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Serial read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Quiet time tolerated on a streaming link, in milliseconds.
    pub watchdog_timeout_ms: u64,
    /// How often the watchdog checks, in milliseconds.
    pub watchdog_poll_ms: u64,
    /// Quiet time tolerated before the first sample, in milliseconds.
    pub startup_grace_ms: u64,
    /// Wait between reconnect attempts, in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// How often to rescan devices while disconnected, in milliseconds.
    pub port_scan_interval_ms: u64,
    /// Records per storage write batch.
    pub flush_batch: usize,
    /// Longest a record waits before a time-based flush, in milliseconds.
    pub flush_interval_ms: u64,
    /// Consecutive failed batches tolerated before the writer gives up.
    pub flush_max_retries: usize,
    /// Bound on each event subscriber's queue.
    pub event_queue_depth: usize,
    /// How long ending a session waits for the final flush, in milliseconds.
    pub end_flush_timeout_ms: u64,
    /// Where session data and the registries live.
    pub data_dir: PathBuf,
    /// Where timestamped backups land.
    pub backup_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            baud_rate: 115_200,
            read_timeout_ms: 100,
            watchdog_timeout_ms: 1_000,
            watchdog_poll_ms: 250,
            startup_grace_ms: 2_000,
            reconnect_backoff_ms: 3_000,
            port_scan_interval_ms: 2_000,
            flush_batch: 10,
            flush_interval_ms: 200,
            flush_max_retries: 5,
            event_queue_depth: 256,
            end_flush_timeout_ms: 2_000,
            data_dir: PathBuf::from("experiment_data"),
            backup_dir: PathBuf::from("experiment_backup"),
        }
    }
}

impl CaptureConfig {
    /// Load settings from a RON file. Fields left out of the file keep
    /// their defaults.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(ConfigError::Io)?;
        ron::de::from_reader(file).map_err(ConfigError::Ron)
    }

    /// The link tuning this config asks for.
    pub fn link(&self) -> LinkConfig {
        LinkConfig {
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    /// The watchdog tuning this config asks for.
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_millis(self.watchdog_poll_ms),
            stall_timeout: Duration::from_millis(self.watchdog_timeout_ms),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            port_scan_interval: Duration::from_millis(self.port_scan_interval_ms),
        }
    }

    /// The storage writer tuning this config asks for.
    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            flush_batch: self.flush_batch,
            max_retries: self.flush_max_retries,
        }
    }

    /// How long ending a session waits for its final flush.
    pub fn end_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.end_flush_timeout_ms)
    }
}

/// Why a config file could not be used.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(io::Error),
    /// The file's contents were not valid RON for [`CaptureConfig`].
    Ron(ron::de::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config file: {}", e),
            ConfigError::Ron(e) => write!(f, "could not parse config file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_the_hardware() {
        let config = CaptureConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.watchdog_timeout_ms, 1_000);
        assert_eq!(config.flush_batch, 10);
        assert_eq!(config.data_dir, PathBuf::from("experiment_data"));
    }

    #[test]
    fn a_partial_file_overrides_only_what_it_names() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "(baud_rate: 9600, data_dir: \"bench_data\", flush_batch: 25)"
        )
        .unwrap();

        let config = CaptureConfig::from_path(file.path()).unwrap();
        assert_eq!(config.baud_rate, 9_600);
        assert_eq!(config.data_dir, PathBuf::from("bench_data"));
        assert_eq!(config.flush_batch, 25);
        // Untouched fields keep their defaults.
        assert_eq!(config.watchdog_poll_ms, 250);
        assert_eq!(config.backup_dir, PathBuf::from("experiment_backup"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "(baud_rate: \"fast\")").unwrap();

        let err = CaptureConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn a_missing_file_is_an_io_error() {
        let err = CaptureConfig::from_path(Path::new("/nonexistent/capture.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn durations_come_out_typed() {
        let config = CaptureConfig::default();
        assert_eq!(config.link().read_timeout, Duration::from_millis(100));
        assert_eq!(config.watchdog().stall_timeout, Duration::from_millis(1_000));
        assert_eq!(config.writer().flush_interval, Duration::from_millis(200));
        assert_eq!(config.end_flush_timeout(), Duration::from_secs(2));
    }
}
