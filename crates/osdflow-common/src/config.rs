//! Configuration types for osdflow
//!
//! Every section and field has a default, so a configuration file only
//! needs to name the values it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration of an OSD
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OSD identity and data location
    pub osd: OsdConfig,
    /// Stage pipeline tuning
    pub stages: StageConfig,
    /// Replication tuning
    pub replication: ReplicationConfig,
    /// Peer OSDs served by the filesystem peer backend (id -> data dir)
    pub peers: BTreeMap<String, PathBuf>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// OSD identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdConfig {
    /// Service ID of this OSD; generated at startup if unset
    pub uuid: Option<String>,
    /// Directory holding the objects of this OSD
    pub data_dir: PathBuf,
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            data_dir: PathBuf::from("./osd-data"),
        }
    }
}

/// Stage pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Maximum queued requests at the replication stage (0 = unbounded)
    pub replication_queue_capacity: usize,
    /// Refuse requests whose deadline cannot be met
    pub overload_protection: bool,
    /// Period of the replication stage maintenance job in milliseconds
    pub maintenance_period_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            replication_queue_capacity: 1000,
            overload_protection: false,
            maintenance_period_ms: 1000,
        }
    }
}

impl StageConfig {
    /// Maintenance period as a [`Duration`]
    #[must_use]
    pub fn maintenance_period(&self) -> Duration {
        Duration::from_millis(self.maintenance_period_ms)
    }
}

/// Replication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Concurrent object fetches per file (capped at 5)
    pub max_objects_in_progress: usize,
    /// Base number of objects prefetched by the sequential-prefetching strategy
    pub prefetch_count: usize,
    /// Every n-th selection of a masquerading strategy requests a full object set
    pub object_set_refresh_interval: u32,
    /// Delay before retrying a file whose holders were all unreachable, in milliseconds
    pub unreachable_retry_delay_ms: u64,
    /// Time after which an unanswered object fetch is retried elsewhere, in milliseconds
    pub fetch_timeout_ms: u64,
    /// Initial time an unreachable OSD is skipped, in seconds
    pub availability_initial_backoff_secs: u64,
    /// Upper bound for the skip time of an unreachable OSD, in seconds
    pub availability_max_backoff_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_objects_in_progress: 5,
            prefetch_count: 10,
            object_set_refresh_interval: 20,
            unreachable_retry_delay_ms: 5000,
            fetch_timeout_ms: 30_000,
            availability_initial_backoff_secs: 60,
            availability_max_backoff_secs: 15 * 60,
        }
    }
}

impl ReplicationConfig {
    /// Delay before retrying a parked file
    #[must_use]
    pub fn unreachable_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unreachable_retry_delay_ms)
    }

    /// Time an object fetch may stay unanswered
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Initial backoff for unreachable OSDs
    #[must_use]
    pub fn availability_initial_backoff(&self) -> Duration {
        Duration::from_secs(self.availability_initial_backoff_secs)
    }

    /// Maximum backoff for unreachable OSDs
    #[must_use]
    pub fn availability_max_backoff(&self) -> Duration {
        Duration::from_secs(self.availability_max_backoff_secs)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
