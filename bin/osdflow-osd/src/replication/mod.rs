//! Replication of striped files between OSDs
//!
//! The [`ReplicationStage`] keeps one [`ReplicatingFile`] per file whose
//! local replica is missing objects. Each file asks its transfer strategy
//! which object to fetch next and from where, and hands the fetch to the
//! [`ReplicationBackend`]. Completions re-enter the stage as
//! [`ReplicationMethod::ObjectFetched`].

mod backend;
mod file;
mod reply;
mod stage;

pub use backend::{
    FetchDone, FetchOutcome, FetchRequest, FsPeerBackend, ReplicationBackend, list_objects, object_path,
    write_hole, write_object,
};
pub use file::{MAX_OBJECTS_IN_PROGRESS, ReplicatingFile, ReplicationContext, Waiter};
pub use reply::{ObjectData, ObjectReply, ReplicationReply};
pub use stage::{REPLICATION_STAGE, ReplicationHandle, ReplicationMethod, ReplicationRequest, ReplicationStage};
