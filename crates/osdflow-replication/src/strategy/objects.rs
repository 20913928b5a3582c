//! Object selection policies

use super::StrategyState;
use crate::object_set::ObjectSet;
use osdflow_common::ObjectNo;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use tracing::trace;

/// Decides which missing object to fetch next
pub trait ObjectSelection: Send {
    /// Best candidate among the preferred and required objects of `state`
    /// that is not in `excluded`
    fn next_object(&mut self, state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo>;

    /// `object_no` was selected; it is still in its object set
    fn selected(&mut self, _state: &mut StrategyState, _object_no: ObjectNo) {}

    /// Object sets, locations or the required set changed
    fn invalidate(&mut self) {}
}

fn lowest(state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo> {
    let mut candidates = state
        .preferred()
        .iter()
        .chain(state.required().iter())
        .filter(|no| !excluded.contains(no));
    candidates.next()
}

/// Preferred objects first, each set in random order
#[derive(Debug)]
pub struct RandomObjects {
    rng: StdRng,
}

impl RandomObjects {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }
}

impl ObjectSelection for RandomObjects {
    fn next_object(&mut self, state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo> {
        [state.preferred(), state.required()].into_iter().find_map(|set| {
            set.iter()
                .filter(|no| !excluded.contains(no))
                .choose(&mut self.rng)
        })
    }
}

/// Preferred objects first, each set in ascending order
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialObjects;

impl ObjectSelection for SequentialObjects {
    fn next_object(&mut self, state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo> {
        lowest(state, excluded)
    }
}

/// Sequential selection that prefetches the local OSD's objects following
/// each selected preferred object
#[derive(Debug)]
pub struct PrefetchingObjects {
    prefetch_count: usize,
    /// Objects ever added by prefetching
    prefetched: ObjectSet,
}

impl PrefetchingObjects {
    pub fn new(prefetch_count: usize) -> Self {
        Self {
            prefetch_count,
            prefetched: ObjectSet::new(),
        }
    }
}

impl ObjectSelection for PrefetchingObjects {
    fn next_object(&mut self, state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo> {
        lowest(state, excluded)
    }

    fn selected(&mut self, state: &mut StrategyState, object_no: ObjectNo) {
        if !state.preferred().contains(object_no) {
            return;
        }
        let Some(last) = state.xloc().last_object_no() else {
            return;
        };

        let window = self.prefetch_count + state.preferred().len();
        let stride = u64::from(state.xloc().local_replica().striping.width.max(1));
        let mut added = 0;
        for candidate in (1..=window as u64).map(|slot| object_no + slot * stride) {
            if candidate > last {
                break;
            }
            if state.preferred().contains(candidate) || !self.prefetched.add(candidate) {
                continue;
            }
            if state.add_required(candidate) {
                added += 1;
            }
        }
        trace!(file_id = %state.file_id(), object_no, window, added, "prefetching objects");
    }
}

/// Preferred objects first (ascending), then required objects held by the
/// fewest remote replicas
#[derive(Debug, Default)]
pub struct RarestObjects {
    /// Required objects ordered by rarity, rebuilt after invalidation
    queue: Option<Vec<ObjectNo>>,
}

impl ObjectSelection for RarestObjects {
    fn next_object(&mut self, state: &StrategyState, excluded: &BTreeSet<ObjectNo>) -> Option<ObjectNo> {
        if let Some(object_no) = state.preferred().iter().find(|no| !excluded.contains(no)) {
            return Some(object_no);
        }

        let queue = self.queue.get_or_insert_with(|| {
            let mut ranked: Vec<(usize, ObjectNo)> = state
                .required()
                .iter()
                .map(|no| (state.rarity(no), no))
                .collect();
            ranked.sort_unstable();
            ranked.into_iter().map(|(_, no)| no).collect()
        });
        queue
            .iter()
            .copied()
            .find(|&no| state.required().contains(no) && !excluded.contains(&no))
    }

    fn invalidate(&mut self) {
        self.queue = None;
    }
}
