//! OSD selection policies

use super::{NextRequest, StrategyState};
use crate::availability::AvailabilityOracle;
use crate::error::TransferStrategyError;
use osdflow_common::{ObjectNo, ServiceId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Decides which OSD to fetch a selected object from
pub trait OsdSelection: Send {
    /// Pick an OSD for `object_no`, never one listed in `tried`
    ///
    /// Fails with `NoOsdFound` if no untried OSD may hold the object and
    /// with `NoOsdReachable` if all of them are currently unavailable.
    fn select_osd(
        &mut self,
        state: &StrategyState,
        object_no: ObjectNo,
        availability: &dyn AvailabilityOracle,
        tried: &[ServiceId],
    ) -> Result<NextRequest, TransferStrategyError>;

    /// Object sets or locations changed
    fn invalidate(&mut self) {}
}

/// Reachable holders of `object_no`: certain ones if any is reachable,
/// otherwise uncertain ones
fn reachable_holders(
    state: &StrategyState,
    object_no: ObjectNo,
    availability: &dyn AvailabilityOracle,
    tried: &[ServiceId],
) -> Result<Vec<ServiceId>, TransferStrategyError> {
    let holders = state.holders(object_no);
    let untried = |osds: Vec<ServiceId>| -> Vec<ServiceId> {
        osds.into_iter().filter(|osd| !tried.contains(osd)).collect()
    };
    let certain = untried(holders.certain);
    let uncertain = untried(holders.uncertain);
    if certain.is_empty() && uncertain.is_empty() {
        return Err(state.no_osd_found(object_no));
    }

    for group in [certain, uncertain] {
        let reachable: Vec<ServiceId> = group
            .into_iter()
            .filter(|osd| availability.is_available(osd))
            .collect();
        if !reachable.is_empty() {
            return Ok(reachable);
        }
    }
    Err(state.no_osd_reachable(object_no))
}

fn next_request(state: &StrategyState, osd: ServiceId, object_no: ObjectNo) -> NextRequest {
    NextRequest {
        attach_object_set: state.needs_object_set(&osd),
        osd,
        object_no,
    }
}

/// Uniformly random reachable holder
#[derive(Debug)]
pub struct RandomOsds {
    rng: StdRng,
}

impl RandomOsds {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }
}

impl OsdSelection for RandomOsds {
    fn select_osd(
        &mut self,
        state: &StrategyState,
        object_no: ObjectNo,
        availability: &dyn AvailabilityOracle,
        tried: &[ServiceId],
    ) -> Result<NextRequest, TransferStrategyError> {
        let mut candidates = reachable_holders(state, object_no, availability, tried)?;
        candidates.shuffle(&mut self.rng);
        candidates
            .pop()
            .map(|osd| next_request(state, osd, object_no))
            .ok_or_else(|| state.no_osd_reachable(object_no))
    }
}

/// Reachable holders in replica order, rotating by one per selection
#[derive(Debug, Default)]
pub struct SequentialOsds {
    cursor: usize,
}

impl OsdSelection for SequentialOsds {
    fn select_osd(
        &mut self,
        state: &StrategyState,
        object_no: ObjectNo,
        availability: &dyn AvailabilityOracle,
        tried: &[ServiceId],
    ) -> Result<NextRequest, TransferStrategyError> {
        let mut candidates = reachable_holders(state, object_no, availability, tried)?;
        if candidates.is_empty() {
            return Err(state.no_osd_reachable(object_no));
        }
        let osd = candidates.swap_remove(self.cursor % candidates.len());
        self.cursor = self.cursor.wrapping_add(1);
        Ok(next_request(state, osd, object_no))
    }
}

/// OSD selection for strategies that do not trust object sets
///
/// Every remote replica that may hold an object is a candidate for it. The
/// candidates of an object are shuffled once and handed out one after the
/// other, so retries for the same object move on to other OSDs. Every n-th
/// selection asks the chosen OSD for its object set, starting with the
/// first one.
#[derive(Debug)]
pub struct MasqueradingOsds {
    rng: StdRng,
    refresh_interval: u32,
    since_refresh: u32,
    candidates: HashMap<ObjectNo, Vec<ServiceId>>,
}

impl MasqueradingOsds {
    /// `refresh_interval == 0` disables object set requests
    pub fn new(refresh_interval: u32, rng: StdRng) -> Self {
        Self {
            rng,
            refresh_interval,
            since_refresh: refresh_interval.saturating_sub(1),
            candidates: HashMap::new(),
        }
    }

    fn refresh_due(&mut self) -> bool {
        if self.refresh_interval == 0 {
            return false;
        }
        self.since_refresh += 1;
        if self.since_refresh >= self.refresh_interval {
            self.since_refresh = 0;
            true
        } else {
            false
        }
    }
}

impl OsdSelection for MasqueradingOsds {
    fn select_osd(
        &mut self,
        state: &StrategyState,
        object_no: ObjectNo,
        availability: &dyn AvailabilityOracle,
        tried: &[ServiceId],
    ) -> Result<NextRequest, TransferStrategyError> {
        let rng = &mut self.rng;
        let list = self.candidates.entry(object_no).or_default();
        if list.is_empty() {
            let mut holders = state.holders(object_no);
            holders.certain.shuffle(rng);
            holders.uncertain.shuffle(rng);
            list.extend(holders.certain);
            list.extend(holders.uncertain);
        }
        list.retain(|osd| !tried.contains(osd));
        if list.is_empty() {
            self.candidates.remove(&object_no);
            return Err(state.no_osd_found(object_no));
        }

        let Some(position) = list.iter().position(|osd| availability.is_available(osd)) else {
            return Err(state.no_osd_reachable(object_no));
        };
        let osd = list.remove(position);
        if list.is_empty() {
            self.candidates.remove(&object_no);
        }

        Ok(NextRequest {
            attach_object_set: self.refresh_due(),
            osd,
            object_no,
        })
    }

    fn invalidate(&mut self) {
        self.candidates.clear();
    }
}
