//! Overload protection
//!
//! The [`Controller`] tracks, per request kind, how many requests (and how
//! many payload bytes) are inside a stage and how long requests of that
//! kind take to process. From that it estimates how long a newly arriving
//! request would wait. [`OverloadProtection`] uses the estimate to refuse
//! requests that could not be answered before their deadline anyway.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Weight of a new sample in the moving averages
const EWMA_ALPHA: f64 = 0.2;

#[derive(Clone, Debug, Default)]
struct KindStats {
    in_flight: u64,
    in_flight_bytes: u64,
    /// Average processing time independent of the payload size
    fixed_secs: f64,
    /// Average processing time per payload byte
    per_byte_secs: f64,
    fixed_samples: u64,
    per_byte_samples: u64,
}

fn ewma(current: f64, sample: f64, samples: u64) -> f64 {
    if samples == 0 {
        sample
    } else {
        EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * current
    }
}

/// Load bookkeeping for one stage
#[derive(Debug)]
pub struct Controller {
    kinds: Mutex<Vec<KindStats>>,
}

impl Controller {
    /// Create a controller for `kinds` request kinds
    pub fn new(kinds: usize) -> Self {
        Self {
            kinds: Mutex::new(vec![KindStats::default(); kinds]),
        }
    }

    /// A request of `kind` with `size` payload bytes entered the stage
    pub fn enter(&self, kind: usize, size: u64) {
        if let Some(stats) = self.kinds.lock().get_mut(kind) {
            stats.in_flight += 1;
            stats.in_flight_bytes += size;
        }
    }

    /// A request left the stage without being measured
    pub fn quit(&self, kind: usize, size: u64) {
        if let Some(stats) = self.kinds.lock().get_mut(kind) {
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.in_flight_bytes = stats.in_flight_bytes.saturating_sub(size);
        }
    }

    /// A request left the stage after `elapsed` in it
    ///
    /// Requests without payload update the fixed processing time, others the
    /// per-byte time after subtracting the fixed part.
    pub fn record(&self, kind: usize, size: u64, elapsed: Duration) {
        let mut kinds = self.kinds.lock();
        let Some(stats) = kinds.get_mut(kind) else {
            return;
        };
        stats.in_flight = stats.in_flight.saturating_sub(1);
        stats.in_flight_bytes = stats.in_flight_bytes.saturating_sub(size);

        let secs = elapsed.as_secs_f64();
        if size == 0 {
            stats.fixed_secs = ewma(stats.fixed_secs, secs, stats.fixed_samples);
            stats.fixed_samples += 1;
        } else {
            let variable = (secs - stats.fixed_secs).max(0.0) / size as f64;
            stats.per_byte_secs = ewma(stats.per_byte_secs, variable, stats.per_byte_samples);
            stats.per_byte_samples += 1;
        }
    }

    /// Time until all requests currently inside the stage are processed
    pub fn estimate_waiting_time(&self) -> Duration {
        let secs: f64 = self
            .kinds
            .lock()
            .iter()
            .map(|s| s.in_flight as f64 * s.fixed_secs + s.in_flight_bytes as f64 * s.per_byte_secs)
            .sum();
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Time needed to process one request of `kind` with `size` bytes
    pub fn estimate_processing_time(&self, kind: usize, size: u64) -> Duration {
        let kinds = self.kinds.lock();
        let secs = kinds
            .get(kind)
            .map_or(0.0, |s| s.fixed_secs + size as f64 * s.per_byte_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Requests of `kind` currently inside the stage
    pub fn in_flight(&self, kind: usize) -> u64 {
        self.kinds.lock().get(kind).map_or(0, |s| s.in_flight)
    }
}

/// Deadline-based admission control
#[derive(Debug)]
pub struct OverloadProtection {
    controller: Controller,
    unrefusable: Vec<bool>,
}

impl OverloadProtection {
    /// Create admission control for `kinds` request kinds; requests of the
    /// kinds listed in `unrefusable` are always admitted
    pub fn new(kinds: usize, unrefusable: &[usize]) -> Self {
        let mut flags = vec![false; kinds];
        for &kind in unrefusable {
            if let Some(flag) = flags.get_mut(kind) {
                *flag = true;
            }
        }
        Self {
            controller: Controller::new(kinds),
            unrefusable: flags,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Decide whether a request may enter
    ///
    /// On refusal returns the estimated response time.
    pub fn admit(&self, kind: usize, size: u64, deadline: Option<Instant>) -> Result<(), Duration> {
        let Some(deadline) = deadline else {
            return Ok(());
        };
        if self.unrefusable.get(kind).copied().unwrap_or(false) {
            return Ok(());
        }

        let estimated =
            self.controller.estimate_waiting_time() + self.controller.estimate_processing_time(kind, size);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if estimated > remaining {
            Err(estimated)
        } else {
            Ok(())
        }
    }
}
