//! Replica location metadata
//!
//! An [`XLocations`] lists the replicas of a file. Every replica stripes
//! the file over an ordered list of OSDs (RAID0): object `n` lives on the
//! OSD in column `n % width`. All replicas share the stripe size, so an
//! object number means the same byte range in every replica.

use crate::error::XLocationsError;
use osdflow_common::{ObjectNo, ServiceId};
use serde::{Deserialize, Serialize};

/// RAID0 striping parameters of a replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripingPolicy {
    /// Object size in bytes
    pub stripe_size: u64,
    /// Number of OSDs the file is striped over
    pub width: u32,
}

impl StripingPolicy {
    pub const fn new(stripe_size: u64, width: u32) -> Self {
        Self { stripe_size, width }
    }

    /// Object containing byte `offset`
    #[must_use]
    pub const fn object_no_for_offset(&self, offset: u64) -> ObjectNo {
        offset / self.stripe_size
    }

    /// Column (index into the replica's OSD list) storing `object_no`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn osd_index_for_object(&self, object_no: ObjectNo) -> usize {
        (object_no % self.width as u64) as usize
    }

    /// Size of `object_no`; all objects are full-sized
    #[must_use]
    pub const fn stripe_size_for_object(&self, _object_no: ObjectNo) -> u64 {
        self.stripe_size
    }

    /// Objects stored in `column` within `first..=last`, ascending
    pub fn objects_of_osd(
        &self,
        column: usize,
        first: ObjectNo,
        last: ObjectNo,
    ) -> impl Iterator<Item = ObjectNo> + use<> {
        let width = u64::from(self.width.max(1));
        let column = column as u64;
        let offset = (column + width - first % width) % width;
        (first + offset..=last).step_by(usize::try_from(width).unwrap_or(usize::MAX))
    }
}

/// Transfer strategy used to fill a partial or full replica
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Random,
    Sequential,
    SequentialPrefetching,
    RarestFirst,
    RandomWithoutObjectSets,
}

/// Replication state and strategy of a replica
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFlags {
    /// All objects are present
    pub complete: bool,
    /// Objects are fetched on demand only; a full replica fetches all
    /// objects in the background
    pub partial: bool,
    pub strategy: StrategyKind,
}

impl ReplicationFlags {
    /// A replica holding all objects
    pub const fn complete() -> Self {
        Self {
            complete: true,
            partial: false,
            strategy: StrategyKind::Random,
        }
    }

    /// A replica filled on demand
    pub const fn partial(strategy: StrategyKind) -> Self {
        Self {
            complete: false,
            partial: true,
            strategy,
        }
    }

    /// A replica filled in the background until complete
    pub const fn full(strategy: StrategyKind) -> Self {
        Self {
            complete: false,
            partial: false,
            strategy,
        }
    }
}

/// One replica of a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// OSDs in stripe column order
    pub osds: Vec<ServiceId>,
    pub striping: StripingPolicy,
    pub flags: ReplicationFlags,
}

impl Replica {
    pub fn new(osds: Vec<ServiceId>, stripe_size: u64, flags: ReplicationFlags) -> Self {
        let width = u32::try_from(osds.len()).unwrap_or(u32::MAX);
        Self {
            osds,
            striping: StripingPolicy::new(stripe_size, width),
            flags,
        }
    }

    /// OSD storing `object_no` in this replica
    #[must_use]
    pub fn osd_for_object(&self, object_no: ObjectNo) -> &ServiceId {
        &self.osds[self.striping.osd_index_for_object(object_no)]
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.flags.complete
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.flags.partial
    }

    /// Column of `osd` in this replica
    #[must_use]
    pub fn column_of(&self, osd: &ServiceId) -> Option<usize> {
        self.osds.iter().position(|o| o == osd)
    }
}

/// Replica locations of a file, as seen from one OSD
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XLocations {
    version: u64,
    read_only_file_size: u64,
    replicas: Vec<Replica>,
    local_replica: usize,
    local_osd: ServiceId,
}

impl XLocations {
    /// Validate replica metadata and locate `local_osd` in it
    pub fn new(
        version: u64,
        read_only_file_size: u64,
        replicas: Vec<Replica>,
        local_osd: ServiceId,
    ) -> Result<Self, XLocationsError> {
        let Some(first) = replicas.first() else {
            return Err(XLocationsError::NoReplicas);
        };
        let expected = first.striping.stripe_size;
        if expected == 0 {
            return Err(XLocationsError::ZeroStripeSize);
        }
        for (index, replica) in replicas.iter().enumerate() {
            if replica.osds.is_empty() {
                return Err(XLocationsError::EmptyReplica { replica: index });
            }
            if replica.striping.width as usize != replica.osds.len() {
                return Err(XLocationsError::WidthMismatch {
                    replica: index,
                    width: replica.striping.width,
                    osds: replica.osds.len(),
                });
            }
            if replica.striping.stripe_size != expected {
                return Err(XLocationsError::StripeSizeMismatch {
                    replica: index,
                    stripe_size: replica.striping.stripe_size,
                    expected,
                });
            }
        }

        let local_replica = replicas
            .iter()
            .position(|r| r.column_of(&local_osd).is_some())
            .ok_or_else(|| XLocationsError::LocalOsdNotFound(local_osd.clone()))?;

        Ok(Self {
            version,
            read_only_file_size,
            replicas,
            local_replica,
            local_osd,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn read_only_file_size(&self) -> u64 {
        self.read_only_file_size
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn local_osd(&self) -> &ServiceId {
        &self.local_osd
    }

    pub fn local_replica_index(&self) -> usize {
        self.local_replica
    }

    pub fn local_replica(&self) -> &Replica {
        &self.replicas[self.local_replica]
    }

    /// Stripe column of the local OSD
    pub fn local_column(&self) -> usize {
        self.local_replica()
            .column_of(&self.local_osd)
            .unwrap_or_default()
    }

    /// Replicas other than the local one
    pub fn remote_replicas(&self) -> impl Iterator<Item = &Replica> {
        let local = self.local_replica;
        self.replicas
            .iter()
            .enumerate()
            .filter(move |(index, _)| *index != local)
            .map(|(_, replica)| replica)
    }

    /// Replica `osd` belongs to
    pub fn replica_of(&self, osd: &ServiceId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.column_of(osd).is_some())
    }

    /// Check if `osd` is listed in any replica
    pub fn contains_osd(&self, osd: &ServiceId) -> bool {
        self.replica_of(osd).is_some()
    }

    /// Number of the last object of the file, `None` for an empty file
    pub fn last_object_no(&self) -> Option<ObjectNo> {
        self.read_only_file_size
            .checked_sub(1)
            .map(|offset| self.local_replica().striping.object_no_for_offset(offset))
    }

    /// Objects the local OSD stores, ascending
    pub fn local_objects(&self) -> Vec<ObjectNo> {
        self.last_object_no().map_or_else(Vec::new, |last| {
            self.local_replica()
                .striping
                .objects_of_osd(self.local_column(), 0, last)
                .collect()
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const STRIPE_SIZE: u64 = 128 * 1024;

    /// Four replicas striped over three OSDs each; replica 1 is complete,
    /// the others are partial. The local OSD is the first one of replica 0.
    pub fn four_replicas(strategy: StrategyKind) -> XLocations {
        let replicas = (0..4)
            .map(|replica| {
                let osds = (0..3)
                    .map(|column| ServiceId::new(format!("osd-{replica}-{column}")))
                    .collect();
                let flags = if replica == 1 {
                    ReplicationFlags::complete()
                } else {
                    ReplicationFlags::partial(strategy)
                };
                Replica::new(osds, STRIPE_SIZE, flags)
            })
            .collect();
        XLocations::new(1, 100 * 1024 * 1024, replicas, ServiceId::new("osd-0-0")).unwrap()
    }

    #[test]
    fn test_object_placement() {
        let xloc = four_replicas(StrategyKind::Random);
        let replica = &xloc.replicas()[1];
        assert_eq!(replica.osd_for_object(0), &ServiceId::new("osd-1-0"));
        assert_eq!(replica.osd_for_object(4), &ServiceId::new("osd-1-1"));
        assert_eq!(replica.osd_for_object(8), &ServiceId::new("osd-1-2"));
        assert_eq!(xloc.local_replica_index(), 0);
        assert_eq!(xloc.local_column(), 0);
        assert_eq!(xloc.remote_replicas().count(), 3);
    }

    #[test]
    fn test_last_object_no() {
        let xloc = four_replicas(StrategyKind::Random);
        assert_eq!(xloc.last_object_no(), Some(799));

        let empty = XLocations::new(
            1,
            0,
            xloc.replicas().to_vec(),
            ServiceId::new("osd-2-1"),
        )
        .unwrap();
        assert_eq!(empty.last_object_no(), None);
        assert!(empty.local_objects().is_empty());
        assert_eq!(empty.local_replica_index(), 2);
        assert_eq!(empty.local_column(), 1);
    }

    #[test]
    fn test_objects_of_osd() {
        let striping = StripingPolicy::new(STRIPE_SIZE, 3);
        let objects: Vec<_> = striping.objects_of_osd(1, 0, 10).collect();
        assert_eq!(objects, vec![1, 4, 7, 10]);
        let objects: Vec<_> = striping.objects_of_osd(0, 5, 13).collect();
        assert_eq!(objects, vec![6, 9, 12]);
        assert_eq!(striping.object_no_for_offset(STRIPE_SIZE * 2 + 1), 2);
    }

    #[test]
    fn test_invalid_locations_rejected() {
        let replica = Replica::new(vec![ServiceId::new("a")], STRIPE_SIZE, ReplicationFlags::complete());
        assert_eq!(
            XLocations::new(1, 10, vec![replica.clone()], ServiceId::new("b")),
            Err(XLocationsError::LocalOsdNotFound(ServiceId::new("b")))
        );
        assert_eq!(
            XLocations::new(1, 10, Vec::new(), ServiceId::new("a")),
            Err(XLocationsError::NoReplicas)
        );

        let other = Replica::new(vec![ServiceId::new("c")], STRIPE_SIZE * 2, ReplicationFlags::complete());
        assert!(matches!(
            XLocations::new(1, 10, vec![replica, other], ServiceId::new("a")),
            Err(XLocationsError::StripeSizeMismatch { replica: 1, .. })
        ));
    }
}
