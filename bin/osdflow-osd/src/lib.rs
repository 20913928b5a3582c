//! osdflow OSD - Object Storage Daemon library
//!
//! The daemon binary is a thin shell around [`Osd`], which owns the
//! replication stage. Keeping the assembly in a library lets transports and
//! tests drive the OSD in-process.

pub mod osd;
pub mod replication;

pub use osd::{Osd, StageCrash};
pub use replication::{FsPeerBackend, ReplicationBackend, ReplicationMethod, ReplicationReply};
