//! Cached liveness of remote OSDs
//!
//! An OSD that failed to answer is skipped for a while. Every further
//! failure doubles the time it is skipped, up to a maximum; a successful
//! answer clears the record.

use osdflow_common::ServiceId;
use osdflow_common::config::ReplicationConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of OSD liveness information consulted during OSD selection
///
/// Implementations must answer from memory; no I/O is allowed.
pub trait AvailabilityOracle: Send + Sync {
    fn is_available(&self, osd: &ServiceId) -> bool;
}

#[derive(Debug)]
struct Unavailable {
    until: Instant,
    backoff: Duration,
}

/// In-memory [`AvailabilityOracle`] with exponential backoff
#[derive(Debug)]
pub struct ServiceAvailability {
    initial_backoff: Duration,
    max_backoff: Duration,
    unavailable: Mutex<HashMap<ServiceId, Unavailable>>,
}

impl Default for ServiceAvailability {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(15 * 60))
    }
}

impl ServiceAvailability {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            unavailable: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(config.availability_initial_backoff(), config.availability_max_backoff())
    }

    /// Record that `osd` did not answer
    pub fn set_service_was_not_available(&self, osd: &ServiceId) {
        let now = Instant::now();
        let mut unavailable = self.unavailable.lock();
        let backoff = match unavailable.get(osd) {
            Some(entry) => (entry.backoff * 2).min(self.max_backoff),
            None => self.initial_backoff,
        };
        debug!(osd = %osd, ?backoff, "marking OSD unavailable");
        unavailable.insert(
            osd.clone(),
            Unavailable {
                until: now + backoff,
                backoff,
            },
        );
    }

    /// Record that `osd` answered
    pub fn set_service_was_available(&self, osd: &ServiceId) {
        self.unavailable.lock().remove(osd);
    }

    /// Time `osd` is currently skipped for, if it is marked unavailable
    pub fn backoff(&self, osd: &ServiceId) -> Option<Duration> {
        self.unavailable.lock().get(osd).map(|entry| entry.backoff)
    }
}

impl AvailabilityOracle for ServiceAvailability {
    fn is_available(&self, osd: &ServiceId) -> bool {
        self.unavailable
            .lock()
            .get(osd)
            .is_none_or(|entry| Instant::now() >= entry.until)
    }
}
