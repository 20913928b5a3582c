//! OSD assembly
//!
//! Builds the replication stage from the configuration and exposes the
//! requests a transport hands to the OSD. Every entry point answers through
//! the transport's [`Responder`].

use crate::replication::{
    REPLICATION_STAGE, ReplicationBackend, ReplicationContext, ReplicationHandle, ReplicationMethod,
    ReplicationReply, ReplicationRequest, ReplicationStage,
};
use osdflow_common::{Config, ErrorResponse, FileId, ObjectNo, PosixErrno, ServiceId};
use osdflow_replication::{ServiceAvailability, XLocations};
use osdflow_stage::{
    Callback, Failure, LifeCycleListener, Responder, RpcRequestCallback, Stage, StageError, StageRequest,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A stage that stopped because its handler failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageCrash {
    pub stage: String,
    pub cause: String,
}

struct CrashListener {
    crashes: watch::Sender<Option<StageCrash>>,
}

impl LifeCycleListener for CrashListener {
    fn started(&self, stage: &str) {
        debug!(stage, "stage running");
    }

    fn shut_down(&self, stage: &str) {
        debug!(stage, "stage stopped");
    }

    fn crashed(&self, stage: &str, cause: &anyhow::Error) {
        let cause = format!("{cause:#}");
        error!(stage, error = %cause, "stage crashed, OSD must stop");
        self.crashes.send_replace(Some(StageCrash {
            stage: stage.to_string(),
            cause,
        }));
    }
}

/// Object Storage Daemon
pub struct Osd {
    id: ServiceId,
    config: Config,
    availability: Arc<ServiceAvailability>,
    stage: Stage<ReplicationStage>,
    crashes: watch::Receiver<Option<StageCrash>>,
}

impl Osd {
    /// Assemble the OSD; nothing runs before [`Osd::start`]
    pub fn new(config: Config, backend: Arc<dyn ReplicationBackend>) -> Self {
        let id = config
            .osd
            .uuid
            .as_deref()
            .map_or_else(ServiceId::generate, ServiceId::new);
        let availability = Arc::new(ServiceAvailability::from_config(&config.replication));
        let context = ReplicationContext::new(backend, availability.clone(), &config.replication);

        let (crash_tx, crashes) = watch::channel(None);
        let mut builder = Stage::builder(REPLICATION_STAGE, ReplicationStage::new(context))
            .with_capacity(config.stages.replication_queue_capacity)
            .with_period(config.stages.maintenance_period())
            .with_listener(Arc::new(CrashListener { crashes: crash_tx }));
        if config.stages.overload_protection {
            // completions and cancellations release resources
            builder = builder.with_overload_protection(&[
                ReplicationMethod::OBJECT_FETCHED,
                ReplicationMethod::CANCEL_FILE,
                ReplicationMethod::STORE_FAILED,
            ]);
        }

        Self {
            id,
            config,
            availability,
            stage: builder.build(),
            crashes,
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn availability(&self) -> &Arc<ServiceAvailability> {
        &self.availability
    }

    pub fn replication_stage(&self) -> ReplicationHandle {
        self.stage.handle()
    }

    pub fn start(&mut self) -> Result<(), StageError> {
        self.stage.start()?;
        info!(osd = %self.id, data_dir = %self.config.osd.data_dir.display(), "OSD started");
        Ok(())
    }

    /// Stop all stages; blocks until their workers exited
    pub fn shutdown(&mut self) {
        self.stage.shutdown();
        info!(osd = %self.id, "OSD shut down");
    }

    /// Watch for stage crashes
    pub fn crashes(&self) -> watch::Receiver<Option<StageCrash>> {
        self.crashes.clone()
    }

    /// Read an object missing from the local replica
    ///
    /// Returns `false` if the request was refused; the responder has then
    /// been answered already.
    pub fn fetch_object(
        &self,
        file_id: FileId,
        object_no: ObjectNo,
        xloc: XLocations,
        deadline: Option<Instant>,
        responder: Box<dyn Responder>,
    ) -> bool {
        let Some(callback) = self.check_request(&file_id, &xloc, responder) else {
            return false;
        };
        let size = xloc.local_replica().striping.stripe_size_for_object(object_no);
        let mut request = StageRequest::new(
            ReplicationMethod::FetchObject {
                file_id,
                object_no,
                xloc,
            },
            None,
            Some(callback),
        )
        .with_size(size);
        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }
        self.enter(request)
    }

    /// Fill the local OSD's part of a replica in the background
    pub fn replicate_file(&self, file_id: FileId, xloc: XLocations, responder: Box<dyn Responder>) -> bool {
        let Some(callback) = self.check_request(&file_id, &xloc, responder) else {
            return false;
        };
        self.enter(StageRequest::new(
            ReplicationMethod::ReplicateFile { file_id, xloc },
            None,
            Some(callback),
        ))
    }

    /// Stop replicating a file; clients waiting for its objects fail
    pub fn cancel_file(&self, file_id: FileId, responder: Box<dyn Responder>) -> bool {
        self.enter(StageRequest::new(
            ReplicationMethod::CancelFile { file_id },
            None,
            Some(rpc_callback(responder)),
        ))
    }

    fn enter(&self, request: ReplicationRequest) -> bool {
        self.stage.handle().enter(request)
    }

    /// Callback for a request about `file_id` and `xloc`, unless the file
    /// ID is malformed or the locations are meant for another OSD
    fn check_request(
        &self,
        file_id: &FileId,
        xloc: &XLocations,
        responder: Box<dyn Responder>,
    ) -> Option<Box<dyn Callback<ReplicationReply>>> {
        let callback = rpc_callback(responder);
        if let Err(err) = file_id.validate() {
            debug!(osd = %self.id, error = %err, "refusing request");
            callback.failed(err.into());
            return None;
        }
        if xloc.local_osd() == &self.id {
            return Some(callback);
        }
        debug!(osd = %self.id, local = %xloc.local_osd(), "replica locations name another OSD");
        callback.failed(Failure::Remote(ErrorResponse::errno(
            PosixErrno::Einval,
            format!("replica locations are meant for {}, not {}", xloc.local_osd(), self.id),
        )));
        None
    }
}

fn rpc_callback(responder: Box<dyn Responder>) -> Box<dyn Callback<ReplicationReply>> {
    Box::new(RpcRequestCallback::new(responder))
}
