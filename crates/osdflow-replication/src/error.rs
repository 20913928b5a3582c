//! Replication error types

use osdflow_common::{FileId, ObjectNo, ServiceId};
use thiserror::Error;

/// Failure to pick an OSD for an object
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransferStrategyError {
    /// No replica holds the object
    #[error("no OSD holds object {object_no} of file {file_id}")]
    NoOsdFound { file_id: FileId, object_no: ObjectNo },

    /// Holders exist but none of them is reachable right now
    #[error("no OSD holding object {object_no} of file {file_id} is reachable")]
    NoOsdReachable { file_id: FileId, object_no: ObjectNo },
}

impl TransferStrategyError {
    /// Check if selecting again later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoOsdReachable { .. })
    }

    pub fn object_no(&self) -> ObjectNo {
        match self {
            Self::NoOsdFound { object_no, .. } | Self::NoOsdReachable { object_no, .. } => *object_no,
        }
    }
}

/// Inconsistent replica location metadata
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum XLocationsError {
    #[error("file has no replicas")]
    NoReplicas,

    #[error("replica {replica} has no OSDs")]
    EmptyReplica { replica: usize },

    #[error("replica {replica}: stripe width {width} does not match its {osds} OSDs")]
    WidthMismatch { replica: usize, width: u32, osds: usize },

    #[error("replica {replica}: stripe size {stripe_size} differs from {expected}")]
    StripeSizeMismatch {
        replica: usize,
        stripe_size: u64,
        expected: u64,
    },

    #[error("stripe size must not be zero")]
    ZeroStripeSize,

    #[error("local OSD {0} is not part of any replica")]
    LocalOsdNotFound(ServiceId),
}
