//! Replication stage
//!
//! Single-threaded owner of all [`ReplicatingFile`]s. Client reads of
//! missing objects, background replication requests and fetch completions
//! all enter this stage, so the per-file strategies never need locking.

use super::file::{ReplicatingFile, ReplicationContext, Waiter};
use super::backend::FetchOutcome;
use super::reply::{ObjectData, ObjectReply, ReplicationReply};
use osdflow_common::{ErrorResponse, FileId, ObjectNo, ServiceId};
use osdflow_replication::XLocations;
use osdflow_stage::{Dispatch, Failure, HandlerHandle, HandlerRequest, StageHandler, StageMethod};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Name of the replication stage
pub const REPLICATION_STAGE: &str = "replication";

/// Request type of the replication stage
pub type ReplicationRequest = HandlerRequest<ReplicationStage>;

/// Handle of the replication stage
pub type ReplicationHandle = HandlerHandle<ReplicationStage>;

/// Methods of the replication stage
#[derive(Debug)]
pub enum ReplicationMethod {
    /// A client reads an object missing from the local replica
    FetchObject {
        file_id: FileId,
        object_no: ObjectNo,
        xloc: XLocations,
    },
    /// Fill the local OSD's part of the replica in the background
    ReplicateFile { file_id: FileId, xloc: XLocations },
    /// A fetch started by the stage completed
    ObjectFetched {
        file_id: FileId,
        object_no: ObjectNo,
        osd: ServiceId,
        outcome: FetchOutcome,
    },
    /// Stop replicating a file
    CancelFile { file_id: FileId },
    /// Writing a fetched object or hole to the local replica failed
    StoreFailed {
        file_id: FileId,
        object_no: ObjectNo,
        error: ErrorResponse,
    },
}

impl ReplicationMethod {
    pub const FETCH_OBJECT: usize = 0;
    pub const REPLICATE_FILE: usize = 1;
    pub const OBJECT_FETCHED: usize = 2;
    pub const CANCEL_FILE: usize = 3;
    pub const STORE_FAILED: usize = 4;
}

impl StageMethod for ReplicationMethod {
    const KINDS: usize = 5;

    fn kind(&self) -> usize {
        match self {
            Self::FetchObject { .. } => Self::FETCH_OBJECT,
            Self::ReplicateFile { .. } => Self::REPLICATE_FILE,
            Self::ObjectFetched { .. } => Self::OBJECT_FETCHED,
            Self::CancelFile { .. } => Self::CANCEL_FILE,
            Self::StoreFailed { .. } => Self::STORE_FAILED,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::FetchObject { .. } => "fetch_object",
            Self::ReplicateFile { .. } => "replicate_file",
            Self::ObjectFetched { .. } => "object_fetched",
            Self::CancelFile { .. } => "cancel_file",
            Self::StoreFailed { .. } => "store_failed",
        }
    }
}

/// Handler of the replication stage
#[derive(Debug)]
pub struct ReplicationStage {
    context: ReplicationContext,
    files: HashMap<FileId, ReplicatingFile>,
}

impl ReplicationStage {
    pub fn new(context: ReplicationContext) -> Self {
        Self {
            context,
            files: HashMap::new(),
        }
    }

    /// The file's replication state, created or updated from `xloc`
    fn file_for(&mut self, file_id: FileId, xloc: XLocations) -> &mut ReplicatingFile {
        match self.files.entry(file_id) {
            Entry::Occupied(entry) => {
                let file = entry.into_mut();
                file.update(xloc);
                file
            }
            Entry::Vacant(entry) => {
                let file_id = entry.key().clone();
                entry.insert(ReplicatingFile::new(file_id, xloc, self.context.clone()))
            }
        }
    }

    fn drop_idle_files(&mut self) {
        self.files.retain(|file_id, file| {
            let idle = file.is_idle();
            if idle {
                debug!(file_id = %file_id, "file replication finished");
            }
            !idle
        });
    }
}

impl StageHandler for ReplicationStage {
    type Method = ReplicationMethod;
    type Request = ();
    type Response = ReplicationReply;

    fn process(
        &mut self,
        request: ReplicationRequest,
        stage: &ReplicationHandle,
    ) -> anyhow::Result<Dispatch> {
        let ticket = request.ticket();
        let (method, _, callback) = request.into_parts();
        match method {
            ReplicationMethod::FetchObject {
                file_id,
                object_no,
                xloc,
            } => {
                let last_object_no = xloc.last_object_no();
                if last_object_no.is_none_or(|last| object_no > last) {
                    let stripe_size = xloc.local_replica().striping.stripe_size_for_object(object_no);
                    callback.success(ReplicationReply::Object(ObjectReply {
                        file_id,
                        object_no,
                        data: ObjectData::Padding,
                        stripe_size,
                        last_object_no,
                    }));
                    return Ok(Dispatch::Completed);
                }

                let file = self.file_for(file_id, xloc);
                if let Err(error) = file.check_view() {
                    debug!(file_id = %file.file_id(), object_no, "refusing read with outdated replica locations");
                    callback.failed(Failure::Remote(error));
                    return Ok(Dispatch::Completed);
                }
                file.add_object_for_replication(object_no, Waiter::new(ticket, callback));
                file.replicate(stage);
                Ok(Dispatch::Deferred)
            }
            ReplicationMethod::ReplicateFile { file_id, xloc } => {
                let file = self.file_for(file_id, xloc);
                if let Err(error) = file.check_view() {
                    callback.failed(Failure::Remote(error));
                    return Ok(Dispatch::Completed);
                }
                file.add_local_objects();
                info!(file_id = %file.file_id(), missing = file.missing_objects(), "background replication requested");
                file.replicate(stage);
                callback.success(ReplicationReply::Accepted);
                Ok(Dispatch::Completed)
            }
            ReplicationMethod::ObjectFetched {
                file_id,
                object_no,
                osd,
                outcome,
            } => {
                match self.files.get_mut(&file_id) {
                    Some(file) => {
                        file.object_fetched(object_no, &osd, outcome, stage);
                        if file.is_idle() {
                            debug!(file_id = %file_id, "file replication finished");
                            self.files.remove(&file_id);
                        }
                    }
                    None => debug!(file_id = %file_id, object_no, "ignoring response for file not being replicated"),
                }
                callback.success(ReplicationReply::Accepted);
                Ok(Dispatch::Completed)
            }
            ReplicationMethod::CancelFile { file_id } => {
                if let Some(mut file) = self.files.remove(&file_id) {
                    file.cancel(stage);
                }
                callback.success(ReplicationReply::Accepted);
                Ok(Dispatch::Completed)
            }
            ReplicationMethod::StoreFailed {
                file_id,
                object_no,
                error,
            } => {
                match self.files.get_mut(&file_id) {
                    Some(file) => file.store_failed(object_no, &error),
                    None => debug!(file_id = %file_id, object_no, %error, "ignoring failed write for file not being replicated"),
                }
                callback.success(ReplicationReply::Accepted);
                Ok(Dispatch::Completed)
            }
        }
    }

    fn chron_job(&mut self, stage: &ReplicationHandle) -> anyhow::Result<Option<Duration>> {
        let now = Instant::now();
        for file in self.files.values_mut() {
            file.expire_fetches(now, stage);
            file.resume_if_due(now, stage);
        }
        self.drop_idle_files();
        Ok(None)
    }

    fn shutdown(&mut self, stage: &ReplicationHandle) {
        let failure = Failure::ShutDown {
            stage: stage.name().to_string(),
        };
        for (_, mut file) in self.files.drain() {
            file.abort(&failure, stage);
        }
    }
}
