//! Transfer strategies
//!
//! A [`TransferStrategy`] keeps the replication state of one file: the
//! objects a client is waiting for (*preferred*), the objects fetched in
//! the background (*required*) and what is known about the objects other
//! OSDs hold. Each call to [`TransferStrategy::select_next`] picks one
//! object and one OSD to fetch it from.
//!
//! The strategy is composed of two policies chosen at construction:
//!
//! | Kind | Object selection | OSD selection |
//! |---|---|---|
//! | `Random` | random | random among holders |
//! | `Sequential` | ascending | round-robin among holders |
//! | `SequentialPrefetching` | ascending, prefetching after preferred objects | round-robin among holders |
//! | `RarestFirst` | fewest holders first | masquerading |
//! | `RandomWithoutObjectSets` | random | masquerading |
//!
//! A strategy is not synchronized. All calls for one file must come from
//! the same thread, normally the replication stage owning the file.

mod objects;
mod osds;

pub use objects::{ObjectSelection, PrefetchingObjects, RandomObjects, RarestObjects, SequentialObjects};
pub use osds::{MasqueradingOsds, OsdSelection, RandomOsds, SequentialOsds};

use crate::availability::AvailabilityOracle;
use crate::error::TransferStrategyError;
use crate::object_set::ObjectSet;
use crate::xloc::{StrategyKind, XLocations};
use osdflow_common::config::ReplicationConfig;
use osdflow_common::{FileId, ObjectNo, ServiceId};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Objects prefetched after a preferred object, on top of the number of
/// preferred objects outstanding
pub const DEFAULT_PREFETCH_COUNT: usize = 10;

/// Every n-th masquerading selection asks for the OSD's object set
pub const DEFAULT_OBJECT_SET_REFRESH_INTERVAL: u32 = 20;

/// The next fetch to issue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextRequest {
    pub osd: ServiceId,
    pub object_no: ObjectNo,
    /// Ask the OSD to return its object set along with the object
    pub attach_object_set: bool,
}

/// Tuning of the selection policies
#[derive(Clone, Debug)]
pub struct StrategyOptions {
    pub prefetch_count: usize,
    pub object_set_refresh_interval: u32,
    /// Seed of the random policies; random if unset
    pub seed: Option<u64>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            object_set_refresh_interval: DEFAULT_OBJECT_SET_REFRESH_INTERVAL,
            seed: None,
        }
    }
}

impl StrategyOptions {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            prefetch_count: config.prefetch_count,
            object_set_refresh_interval: config.object_set_refresh_interval,
            seed: None,
        }
    }

    fn rng(&self, stream: u64) -> StdRng {
        self.seed.map_or_else(StdRng::from_entropy, |seed| {
            StdRng::seed_from_u64(seed.wrapping_add(stream))
        })
    }
}

/// OSDs that may serve an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Holders {
    /// Known to hold the object
    pub certain: Vec<ServiceId>,
    /// Partial replicas whose object set is unknown
    pub uncertain: Vec<ServiceId>,
}

impl Holders {
    pub fn is_empty(&self) -> bool {
        self.certain.is_empty() && self.uncertain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.certain.len() + self.uncertain.len()
    }
}

/// Per-file selection state shared by the policies
#[derive(Debug)]
pub struct StrategyState {
    file_id: FileId,
    xloc: XLocations,
    required: ObjectSet,
    preferred: ObjectSet,
    objects_on_osds: HashMap<ServiceId, ObjectSet>,
}

impl StrategyState {
    fn new(file_id: FileId, xloc: XLocations) -> Self {
        Self {
            file_id,
            xloc,
            required: ObjectSet::new(),
            preferred: ObjectSet::new(),
            objects_on_osds: HashMap::new(),
        }
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn xloc(&self) -> &XLocations {
        &self.xloc
    }

    /// Objects fetched in the background
    pub fn required(&self) -> &ObjectSet {
        &self.required
    }

    /// Objects clients are waiting for
    pub fn preferred(&self) -> &ObjectSet {
        &self.preferred
    }

    /// Last known object set of `osd`
    pub fn object_set_of(&self, osd: &ServiceId) -> Option<&ObjectSet> {
        self.objects_on_osds.get(osd)
    }

    /// Check if a fetch from `osd` should ask for its object set
    pub fn needs_object_set(&self, osd: &ServiceId) -> bool {
        !self.objects_on_osds.contains_key(osd)
            && self.xloc.replica_of(osd).is_some_and(|r| !r.is_complete())
    }

    /// Remote OSDs that hold or may hold `object_no`, in replica order
    pub fn holders(&self, object_no: ObjectNo) -> Holders {
        let mut holders = Holders::default();
        for replica in self.xloc.remote_replicas() {
            let osd = replica.osd_for_object(object_no);
            match self.objects_on_osds.get(osd) {
                _ if replica.is_complete() => holders.certain.push(osd.clone()),
                Some(set) if set.contains(object_no) => holders.certain.push(osd.clone()),
                Some(_) => {}
                None => holders.uncertain.push(osd.clone()),
            }
        }
        holders
    }

    /// Number of remote replicas known to hold `object_no`
    pub fn rarity(&self, object_no: ObjectNo) -> usize {
        self.xloc
            .remote_replicas()
            .filter(|replica| {
                replica.is_complete()
                    || self
                        .objects_on_osds
                        .get(replica.osd_for_object(object_no))
                        .is_some_and(|set| set.contains(object_no))
            })
            .count()
    }

    pub(crate) fn no_osd_found(&self, object_no: ObjectNo) -> TransferStrategyError {
        TransferStrategyError::NoOsdFound {
            file_id: self.file_id.clone(),
            object_no,
        }
    }

    pub(crate) fn no_osd_reachable(&self, object_no: ObjectNo) -> TransferStrategyError {
        TransferStrategyError::NoOsdReachable {
            file_id: self.file_id.clone(),
            object_no,
        }
    }

    /// Add to the required set unless preferred; returns `true` if added
    pub(crate) fn add_required(&mut self, object_no: ObjectNo) -> bool {
        !self.preferred.contains(object_no) && self.required.add(object_no)
    }
}

/// Object and OSD selection for one file
pub struct TransferStrategy {
    kind: StrategyKind,
    state: StrategyState,
    objects: Box<dyn ObjectSelection>,
    osds: Box<dyn OsdSelection>,
    availability: Arc<dyn AvailabilityOracle>,
    next: Option<NextRequest>,
}

impl std::fmt::Debug for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStrategy")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl TransferStrategy {
    pub fn new(
        kind: StrategyKind,
        file_id: FileId,
        xloc: XLocations,
        availability: Arc<dyn AvailabilityOracle>,
        options: &StrategyOptions,
    ) -> Self {
        let (objects, osds): (Box<dyn ObjectSelection>, Box<dyn OsdSelection>) = match kind {
            StrategyKind::Random => (
                Box::new(RandomObjects::new(options.rng(0))),
                Box::new(RandomOsds::new(options.rng(1))),
            ),
            StrategyKind::Sequential => (
                Box::new(SequentialObjects),
                Box::new(SequentialOsds::default()),
            ),
            StrategyKind::SequentialPrefetching => (
                Box::new(PrefetchingObjects::new(options.prefetch_count)),
                Box::new(SequentialOsds::default()),
            ),
            StrategyKind::RarestFirst => (
                Box::new(RarestObjects::default()),
                Box::new(MasqueradingOsds::new(options.object_set_refresh_interval, options.rng(1))),
            ),
            StrategyKind::RandomWithoutObjectSets => (
                Box::new(RandomObjects::new(options.rng(0))),
                Box::new(MasqueradingOsds::new(options.object_set_refresh_interval, options.rng(1))),
            ),
        };
        Self::with_policies(kind, file_id, xloc, availability, objects, osds)
    }

    /// Strategy with custom policies
    pub fn with_policies(
        kind: StrategyKind,
        file_id: FileId,
        xloc: XLocations,
        availability: Arc<dyn AvailabilityOracle>,
        objects: Box<dyn ObjectSelection>,
        osds: Box<dyn OsdSelection>,
    ) -> Self {
        Self {
            kind,
            state: StrategyState::new(file_id, xloc),
            objects,
            osds,
            availability,
            next: None,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn file_id(&self) -> &FileId {
        &self.state.file_id
    }

    pub fn xloc(&self) -> &XLocations {
        &self.state.xloc
    }

    /// Pick the next object to fetch and the OSD to fetch it from
    ///
    /// Does nothing if no object is missing. If no OSD can serve the first
    /// candidate, the other candidates are tried; the error of the first
    /// candidate is returned only if none of them can be served.
    pub fn select_next(&mut self) -> Result<(), TransferStrategyError> {
        self.next = None;
        if self.is_object_list_empty() {
            return Ok(());
        }

        let mut excluded = BTreeSet::new();
        let mut first_error = None;
        while let Some(object_no) = self.objects.next_object(&self.state, &excluded) {
            match self
                .osds
                .select_osd(&self.state, object_no, self.availability.as_ref(), &[])
            {
                Ok(next) => {
                    self.objects.selected(&mut self.state, object_no);
                    trace!(file_id = %self.state.file_id, object_no, osd = %next.osd, "selected next object");
                    self.next = Some(next);
                    return Ok(());
                }
                Err(err) => {
                    debug!(file_id = %self.state.file_id, object_no, error = %err, "object cannot be fetched now");
                    first_error.get_or_insert(err);
                    excluded.insert(object_no);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Pick an OSD for a given object, skipping the OSDs in `tried`
    pub fn select_next_osd(
        &mut self,
        object_no: ObjectNo,
        tried: &[ServiceId],
    ) -> Result<(), TransferStrategyError> {
        self.next = None;
        let next = self
            .osds
            .select_osd(&self.state, object_no, self.availability.as_ref(), tried)?;
        self.next = Some(next);
        Ok(())
    }

    /// Take the selected request
    ///
    /// The object is removed from the preferred and required sets until it
    /// is added again.
    pub fn take_next(&mut self) -> Option<NextRequest> {
        let next = self.next.take()?;
        self.state.preferred.remove(next.object_no);
        self.state.required.remove(next.object_no);
        Some(next)
    }

    /// Peek at the selected request
    pub fn next(&self) -> Option<&NextRequest> {
        self.next.as_ref()
    }

    /// Mark an object as missing
    ///
    /// Preferred objects move out of the required set; a required add of a
    /// preferred object has no effect.
    pub fn add_object(&mut self, object_no: ObjectNo, preferred: bool) {
        if preferred {
            self.state.required.remove(object_no);
            self.state.preferred.add(object_no);
        } else if self.state.add_required(object_no) {
            self.objects.invalidate();
        }
    }

    /// Forget an object; returns `true` if it was missing
    pub fn remove_object(&mut self, object_no: ObjectNo) -> bool {
        let preferred = self.state.preferred.remove(object_no);
        let required = self.state.required.remove(object_no);
        preferred || required
    }

    pub fn objects_count(&self) -> usize {
        self.state.preferred.len() + self.state.required.len()
    }

    pub fn preferred_objects_count(&self) -> usize {
        self.state.preferred.len()
    }

    pub fn required_objects_count(&self) -> usize {
        self.state.required.len()
    }

    pub fn is_object_list_empty(&self) -> bool {
        self.state.preferred.is_empty() && self.state.required.is_empty()
    }

    /// Record the object set reported by `osd`
    pub fn set_osds_object_set(&mut self, osd: ServiceId, set: ObjectSet) {
        trace!(file_id = %self.state.file_id, osd = %osd, objects = set.len(), "object set updated");
        self.state.objects_on_osds.insert(osd, set);
        self.objects.invalidate();
        self.osds.invalidate();
    }

    /// Switch to newer replica locations
    ///
    /// Object sets of OSDs no longer listed are dropped.
    pub fn update_xloc(&mut self, xloc: XLocations) {
        self.state
            .objects_on_osds
            .retain(|osd, _| xloc.contains_osd(osd));
        self.state.xloc = xloc;
        self.next = None;
        self.objects.invalidate();
        self.osds.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::ServiceAvailability;
    use crate::xloc::tests::four_replicas;
    use crate::xloc::{Replica, ReplicationFlags};

    fn strategy(kind: StrategyKind) -> TransferStrategy {
        strategy_with(kind, Arc::new(ServiceAvailability::default()))
    }

    fn strategy_with(kind: StrategyKind, availability: Arc<dyn AvailabilityOracle>) -> TransferStrategy {
        let options = StrategyOptions {
            seed: Some(7),
            ..StrategyOptions::default()
        };
        TransferStrategy::new(kind, FileId::from("1:1"), four_replicas(kind), availability, &options)
    }

    fn osd(replica: usize, column: usize) -> ServiceId {
        ServiceId::new(format!("osd-{replica}-{column}"))
    }

    fn select(strategy: &mut TransferStrategy) -> Option<NextRequest> {
        strategy.select_next().unwrap();
        strategy.take_next()
    }

    #[test]
    fn test_add_and_remove_object() {
        let mut strategy = strategy(StrategyKind::Random);
        strategy.add_object(2, false);
        assert!(strategy.remove_object(2));
        strategy.add_object(2, true);
        assert!(strategy.remove_object(2));
        assert!(!strategy.remove_object(2));
    }

    #[test]
    fn test_objects_count() {
        let mut strategy = strategy(StrategyKind::Random);
        for object_no in [1, 2, 3, 4, 4] {
            strategy.add_object(object_no, false);
        }
        strategy.add_object(5, true);
        strategy.add_object(3, true);
        strategy.add_object(3, false);

        assert_eq!(strategy.objects_count(), 5);
        assert_eq!(strategy.preferred_objects_count(), 2);
        assert!(!strategy.state().required().contains(3));
    }

    #[test]
    fn test_preferred_and_required_stay_disjoint() {
        let mut strategy = strategy(StrategyKind::Sequential);
        for object_no in 0..20 {
            strategy.add_object(object_no, object_no % 3 == 0);
            strategy.add_object(object_no, object_no % 2 == 0);
        }
        let state = strategy.state();
        assert!(state.preferred().iter().all(|no| !state.required().contains(no)));
    }

    #[test]
    fn test_select_all_with_object_sets() {
        let mut strategy = strategy(StrategyKind::Random);
        for object_no in 0..5 {
            strategy.add_object(object_no, object_no == 1 || object_no == 2);
        }

        let sets: [(usize, usize, &[ObjectNo]); 9] = [
            (0, 0, &[0]),
            (0, 1, &[1]),
            (0, 2, &[2]),
            (1, 0, &[0, 3, 6, 9]),
            (1, 1, &[1, 4, 7, 10]),
            (1, 2, &[2, 5, 8, 11]),
            (2, 0, &[9]),
            (2, 1, &[10]),
            (2, 2, &[11]),
        ];
        for (replica, column, objects) in sets {
            strategy.set_osds_object_set(osd(replica, column), objects.iter().copied().collect());
        }

        let mut fetched = BTreeSet::new();
        while strategy.objects_count() > 0 {
            let next = select(&mut strategy).unwrap();
            assert!(fetched.insert(next.object_no));
        }
        assert_eq!(fetched, (0..5).collect());
        assert!(select(&mut strategy).is_none());
    }

    #[test]
    fn test_sequential_selection() {
        let mut strategy = strategy(StrategyKind::Sequential);
        strategy.add_object(0, false);
        strategy.add_object(1, true);
        strategy.add_object(2, false);
        strategy.add_object(3, false);
        strategy.add_object(4, false);
        strategy.add_object(2, true);

        let complete = &strategy.xloc().replicas()[1].clone();
        for expected in [1, 2, 0, 3, 4] {
            let next = select(&mut strategy).unwrap();
            assert_eq!(next.object_no, expected);
            assert_eq!(&next.osd, complete.osd_for_object(expected));
            assert!(!next.attach_object_set);
        }
        assert!(select(&mut strategy).is_none());
    }

    #[test]
    fn test_random_selection() {
        let mut strategy = strategy(StrategyKind::Random);
        for object_no in 1..=4 {
            strategy.add_object(object_no, false);
        }
        strategy.add_object(2, true);

        let mut fetched = BTreeSet::new();
        for _ in 0..4 {
            let next = select(&mut strategy).unwrap();
            assert!(strategy.xloc().contains_osd(&next.osd));
            assert_ne!(&next.osd, strategy.xloc().local_osd());
            fetched.insert(next.object_no);
        }
        assert_eq!(fetched, (1..=4).collect());
        assert!(select(&mut strategy).is_none());
    }

    #[test]
    fn test_random_selection_takes_preferred_first() {
        let mut strategy = strategy(StrategyKind::Random);
        for object_no in 0..10 {
            strategy.add_object(object_no, false);
        }
        strategy.add_object(6, true);
        assert_eq!(select(&mut strategy).unwrap().object_no, 6);
    }

    #[test]
    fn test_sequential_prefetching_selection() {
        let mut strategy = strategy(StrategyKind::SequentialPrefetching);
        strategy.add_object(0, true);
        strategy.add_object(60, true);
        strategy.add_object(72, true);
        assert_eq!(strategy.objects_count(), 3);

        assert_eq!(select(&mut strategy).unwrap().object_no, 0);
        let mut prefetched = DEFAULT_PREFETCH_COUNT + 3;
        assert_eq!(strategy.objects_count(), 2 + prefetched);

        assert_eq!(select(&mut strategy).unwrap().object_no, 60);
        // 72 is preferred and keeps its slot without being prefetched
        prefetched += DEFAULT_PREFETCH_COUNT + 2 - 1;
        assert_eq!(strategy.objects_count(), 1 + prefetched);

        assert_eq!(select(&mut strategy).unwrap().object_no, 72);
        // 75..=96 were prefetched already
        prefetched += DEFAULT_PREFETCH_COUNT + 1 - 8;
        assert_eq!(strategy.objects_count(), prefetched);

        assert_eq!(select(&mut strategy).unwrap().object_no, 3);
    }

    #[test]
    fn test_prefetching_stops_at_last_object() {
        let mut strategy = strategy(StrategyKind::SequentialPrefetching);
        strategy.add_object(792, true);
        assert_eq!(select(&mut strategy).unwrap().object_no, 792);
        let prefetched: Vec<_> = strategy.state().required().iter().collect();
        assert_eq!(prefetched, vec![795, 798]);
    }

    /// One local OSD and one remote partial replica on OSD-A whose object
    /// set only contains object 7
    fn single_holder_strategy(kind: StrategyKind) -> TransferStrategy {
        let local = Replica::new(vec![ServiceId::new("local")], 4096, ReplicationFlags::partial(kind));
        let remote = Replica::new(vec![ServiceId::new("OSD-A")], 4096, ReplicationFlags::partial(kind));
        let xloc = XLocations::new(1, 4096 * 16, vec![local, remote], ServiceId::new("local")).unwrap();
        let options = StrategyOptions {
            seed: Some(1),
            ..StrategyOptions::default()
        };
        let mut strategy = TransferStrategy::new(
            kind,
            FileId::from("1:2"),
            xloc,
            Arc::new(ServiceAvailability::default()),
            &options,
        );
        strategy.set_osds_object_set(ServiceId::new("OSD-A"), [7].into_iter().collect());
        strategy
    }

    #[test]
    fn test_selection_skips_object_without_holder() {
        for _ in 0..10 {
            let mut strategy = single_holder_strategy(StrategyKind::Random);
            strategy.add_object(5, false);
            strategy.add_object(7, false);

            let next = select(&mut strategy).unwrap();
            assert_eq!(next.object_no, 7);
            assert_eq!(next.osd, ServiceId::new("OSD-A"));
            assert!(strategy.state().required().contains(5));
        }
    }

    #[test]
    fn test_unreachable_holder_does_not_block_other_objects() {
        let kinds = [
            StrategyKind::Random,
            StrategyKind::Sequential,
            StrategyKind::SequentialPrefetching,
            StrategyKind::RarestFirst,
            StrategyKind::RandomWithoutObjectSets,
        ];
        for kind in kinds {
            let local = Replica::new(vec![ServiceId::new("local")], 4096, ReplicationFlags::partial(kind));
            let a = Replica::new(vec![ServiceId::new("OSD-A")], 4096, ReplicationFlags::partial(kind));
            let b = Replica::new(vec![ServiceId::new("OSD-B")], 4096, ReplicationFlags::partial(kind));
            let xloc = XLocations::new(1, 4096 * 16, vec![local, a, b], ServiceId::new("local")).unwrap();
            let availability = Arc::new(ServiceAvailability::default());
            availability.set_service_was_not_available(&ServiceId::new("OSD-A"));
            let options = StrategyOptions {
                seed: Some(3),
                ..StrategyOptions::default()
            };
            let mut strategy = TransferStrategy::new(kind, FileId::from("1:3"), xloc, availability, &options);
            strategy.set_osds_object_set(ServiceId::new("OSD-A"), [5].into_iter().collect());
            strategy.set_osds_object_set(ServiceId::new("OSD-B"), [7].into_iter().collect());
            strategy.add_object(5, false);
            strategy.add_object(7, false);

            let next = select(&mut strategy).unwrap_or_else(|| panic!("{kind:?} selected nothing"));
            assert_eq!((next.object_no, next.osd), (7, ServiceId::new("OSD-B")), "{kind:?}");
            assert!(strategy.state().required().contains(5), "{kind:?}");
        }
    }

    #[test]
    fn test_selection_reports_first_error_when_exhausted() {
        let mut strategy = single_holder_strategy(StrategyKind::Sequential);
        strategy.add_object(5, false);
        strategy.add_object(6, false);
        assert_eq!(
            strategy.select_next(),
            Err(TransferStrategyError::NoOsdFound {
                file_id: FileId::from("1:2"),
                object_no: 5,
            })
        );
        assert!(strategy.take_next().is_none());
        assert_eq!(strategy.objects_count(), 2);
    }

    #[test]
    fn test_unreachable_holders() {
        let availability = Arc::new(ServiceAvailability::default());
        let mut strategy = strategy_with(StrategyKind::Sequential, availability.clone());
        for replica in 1..4 {
            availability.set_service_was_not_available(&osd(replica, 1));
        }
        strategy.add_object(1, false);
        let err = strategy.select_next().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.object_no(), 1);

        availability.set_service_was_available(&osd(3, 1));
        let next = select(&mut strategy).unwrap();
        assert_eq!(next.osd, osd(3, 1));
        assert!(next.attach_object_set);
    }

    #[test]
    fn test_select_next_osd_skips_tried_osds() {
        let mut strategy = strategy(StrategyKind::Sequential);
        let mut tried = Vec::new();
        for _ in 0..3 {
            strategy.select_next_osd(4, &tried).unwrap();
            let next = strategy.take_next().unwrap();
            assert_eq!(next.object_no, 4);
            assert!(!tried.contains(&next.osd));
            tried.push(next.osd);
        }
        assert!(matches!(
            strategy.select_next_osd(4, &tried),
            Err(TransferStrategyError::NoOsdFound { object_no: 4, .. })
        ));
    }

    #[test]
    fn test_update_xloc_drops_unknown_object_sets() {
        let mut strategy = strategy(StrategyKind::Random);
        strategy.set_osds_object_set(osd(2, 0), [0].into_iter().collect());
        strategy.set_osds_object_set(ServiceId::new("gone"), [0].into_iter().collect());

        let xloc = strategy.xloc().clone();
        strategy.update_xloc(xloc);
        assert!(strategy.state().object_set_of(&osd(2, 0)).is_some());
        assert!(strategy.state().object_set_of(&ServiceId::new("gone")).is_none());
    }

    #[test]
    fn test_holder_resolution() {
        let mut strategy = strategy(StrategyKind::Random);
        strategy.set_osds_object_set(osd(2, 0), [3].into_iter().collect());
        strategy.set_osds_object_set(osd(3, 0), [6].into_iter().collect());

        let holders = strategy.state().holders(3);
        assert_eq!(holders.certain, vec![osd(1, 0), osd(2, 0)]);
        assert!(holders.uncertain.is_empty());

        let holders = strategy.state().holders(4);
        assert_eq!(holders.certain, vec![osd(1, 1)]);
        assert_eq!(holders.uncertain, vec![osd(2, 1), osd(3, 1)]);
        assert_eq!(strategy.state().rarity(3), 2);
        assert_eq!(strategy.state().rarity(4), 1);
    }
}
