//! osdflow Replication - object transfer planning for replicated files
//!
//! This crate decides, for a file whose local replica is missing objects,
//! which object to fetch next and from which remote OSD.
//!
//! # Components
//!
//! - **ObjectSet**: bitmap of object numbers known to exist on an OSD
//! - **XLocations**: replica locations, striping and replication flags of a file
//! - **ServiceAvailability**: cached liveness of remote OSDs with backoff
//! - **TransferStrategy**: per-file selection state, composed of an object
//!   selection policy and an OSD selection policy
//!
//! # Example
//! ```ignore
//! use osdflow_replication::{StrategyKind, StrategyOptions, TransferStrategy};
//!
//! let mut strategy = TransferStrategy::new(
//!     StrategyKind::Sequential,
//!     file_id,
//!     xloc,
//!     availability,
//!     &StrategyOptions::default(),
//! );
//! strategy.add_object(3, true);
//! strategy.select_next()?;
//! if let Some(next) = strategy.take_next() {
//!     // fetch next.object_no from next.osd
//! }
//! ```

pub mod availability;
pub mod error;
pub mod object_set;
pub mod strategy;
pub mod xloc;

pub use availability::{AvailabilityOracle, ServiceAvailability};
pub use error::{TransferStrategyError, XLocationsError};
pub use object_set::ObjectSet;
pub use strategy::{NextRequest, StrategyOptions, StrategyState, TransferStrategy};
pub use xloc::{Replica, ReplicationFlags, StrategyKind, StripingPolicy, XLocations};
