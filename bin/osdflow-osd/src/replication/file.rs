//! Replication driver of a single file
//!
//! A [`ReplicatingFile`] owns the [`TransferStrategy`] of one file and
//! turns its selections into fetches. At most `max_objects_in_progress`
//! objects are fetched at a time. Clients waiting for an object are
//! answered once the object arrives, turns out to be a hole, or cannot be
//! fetched from any OSD. Objects whose local write fails are queued
//! again. A peer rejecting a fetch for outdated replica locations fails
//! all waiting clients, and the file refuses requests until newer
//! locations arrive.
//!
//! All methods run on the replication stage's worker thread.

use super::backend::{FetchDone, FetchOutcome, FetchRequest, ReplicationBackend, StoreDone};
use super::reply::{ObjectData, ObjectReply, ReplicationReply};
use super::stage::{ReplicationHandle, ReplicationMethod};
use bytes::Bytes;
use osdflow_common::config::ReplicationConfig;
use osdflow_common::{ErrorResponse, FileId, ObjectNo, PosixErrno, ServiceId};
use osdflow_replication::{
    AvailabilityOracle, NextRequest, ObjectSet, Replica, ServiceAvailability, StrategyOptions,
    TransferStrategy, TransferStrategyError, XLocations,
};
use osdflow_stage::{Callback, Failure, RequestTicket, StageRequest};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound for concurrent fetches per file
pub const MAX_OBJECTS_IN_PROGRESS: usize = 5;

/// Collaborators and tuning shared by all replicating files
#[derive(Clone)]
pub struct ReplicationContext {
    pub backend: Arc<dyn ReplicationBackend>,
    pub availability: Arc<ServiceAvailability>,
    pub options: StrategyOptions,
    /// Concurrent fetches per file, within `1..=MAX_OBJECTS_IN_PROGRESS`
    pub max_objects_in_progress: usize,
    /// Pause after no holder of any missing object was reachable
    pub retry_delay: Duration,
    pub fetch_timeout: Duration,
}

impl ReplicationContext {
    pub fn new(
        backend: Arc<dyn ReplicationBackend>,
        availability: Arc<ServiceAvailability>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            backend,
            availability,
            options: StrategyOptions::from_config(config),
            max_objects_in_progress: config
                .max_objects_in_progress
                .clamp(1, MAX_OBJECTS_IN_PROGRESS),
            retry_delay: config.unreachable_retry_delay(),
            fetch_timeout: config.fetch_timeout(),
        }
    }
}

impl fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("options", &self.options)
            .field("max_objects_in_progress", &self.max_objects_in_progress)
            .field("retry_delay", &self.retry_delay)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

/// A deferred client request waiting for an object
pub struct Waiter {
    ticket: RequestTicket,
    callback: Box<dyn Callback<ReplicationReply>>,
}

impl Waiter {
    pub fn new(ticket: RequestTicket, callback: Box<dyn Callback<ReplicationReply>>) -> Self {
        Self { ticket, callback }
    }

    /// Answer the client and release the request from the stage
    pub fn reply(self, reply: ReplicationReply, stage: &ReplicationHandle) {
        self.callback.success(reply);
        stage.exit(self.ticket);
    }

    /// Fail the request and release it from the stage
    pub fn fail(self, failure: Failure, stage: &ReplicationHandle) {
        self.callback.failed(failure);
        stage.exit(self.ticket);
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").field("ticket", &self.ticket).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ReplicatingObject {
    waiters: Vec<Waiter>,
    /// Data with an invalid checksum, answered if nothing better turns up
    fallback: Option<Bytes>,
    /// OSDs already asked for this object
    tried: Vec<ServiceId>,
    /// Outstanding fetch: OSD and time it was sent
    pending: Option<(ServiceId, Instant)>,
}

fn fetch_done(stage: ReplicationHandle, file_id: FileId, object_no: ObjectNo, osd: ServiceId) -> FetchDone {
    Box::new(move |outcome| {
        let method = ReplicationMethod::ObjectFetched {
            file_id,
            object_no,
            osd,
            outcome,
        };
        stage.enter(StageRequest::new(method, None, None));
    })
}

/// Completion of a local write; failures are handed back to the stage,
/// which releases the write from `storing`
fn store_done(
    stage: ReplicationHandle,
    file_id: FileId,
    object_no: ObjectNo,
    storing: Arc<AtomicUsize>,
) -> StoreDone {
    Box::new(move |result| {
        let reported = match result {
            Ok(()) => false,
            Err(err) => {
                let method = ReplicationMethod::StoreFailed {
                    file_id,
                    object_no,
                    error: err.to_error_response(),
                };
                stage.enter(StageRequest::new(method, None, None))
            }
        };
        if !reported {
            release_store(&storing);
        }
    })
}

fn release_store(storing: &AtomicUsize) {
    let _ = storing.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// Replication state of one file
pub struct ReplicatingFile {
    file_id: FileId,
    strategy: TransferStrategy,
    context: ReplicationContext,
    in_progress: HashMap<ObjectNo, ReplicatingObject>,
    /// Requested objects not yet selected for fetching
    waiting: HashMap<ObjectNo, ReplicatingObject>,
    /// Set while paused because no holder was reachable
    retry_at: Option<Instant>,
    /// Local writes not yet reported
    storing: Arc<AtomicUsize>,
    /// A peer rejected the current replica locations as outdated
    view_outdated: bool,
}

impl ReplicatingFile {
    /// Start replicating `file_id`; a full replica queues all objects of
    /// the local OSD right away
    pub fn new(file_id: FileId, xloc: XLocations, context: ReplicationContext) -> Self {
        let kind = xloc.local_replica().flags.strategy;
        let availability: Arc<dyn AvailabilityOracle> = context.availability.clone();
        let strategy = TransferStrategy::new(kind, file_id.clone(), xloc, availability, &context.options);
        let mut file = Self {
            file_id,
            strategy,
            context,
            in_progress: HashMap::new(),
            waiting: HashMap::new(),
            retry_at: None,
            storing: Arc::new(AtomicUsize::new(0)),
            view_outdated: false,
        };
        if file.is_full_replica() {
            file.add_local_objects();
        }
        debug!(
            file_id = %file.file_id,
            strategy = ?kind,
            full = file.is_full_replica(),
            missing = file.missing_objects(),
            "replicating file"
        );
        file
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn xloc(&self) -> &XLocations {
        self.strategy.xloc()
    }

    /// Check if the local replica is filled in the background
    pub fn is_full_replica(&self) -> bool {
        !self.xloc().local_replica().is_partial()
    }

    pub fn objects_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_object_in_progress(&self, object_no: ObjectNo) -> bool {
        self.in_progress.contains_key(&object_no)
    }

    /// Objects requested by clients and not yet selected
    pub fn waiting_objects(&self) -> usize {
        self.waiting.len()
    }

    /// Objects still to be selected
    pub fn missing_objects(&self) -> usize {
        self.strategy.objects_count()
    }

    pub fn is_paused(&self) -> bool {
        self.retry_at.is_some()
    }

    pub fn is_view_outdated(&self) -> bool {
        self.view_outdated
    }

    /// Local writes not yet completed
    pub fn stores_in_progress(&self) -> usize {
        self.storing.load(Ordering::Acquire)
    }

    /// Nothing left to fetch, store or answer
    ///
    /// A file with outdated replica locations is kept so that requests
    /// carrying them keep being refused.
    pub fn is_idle(&self) -> bool {
        self.in_progress.is_empty()
            && self.waiting.is_empty()
            && self.retry_at.is_none()
            && !self.view_outdated
            && self.stores_in_progress() == 0
            && self.strategy.is_object_list_empty()
    }

    /// Refuse requests while the replica locations are known to be outdated
    pub fn check_view(&self) -> Result<(), ErrorResponse> {
        if !self.view_outdated {
            return Ok(());
        }
        Err(ErrorResponse::invalid_view(format!(
            "replica locations version {} of file {} are outdated",
            self.xloc().version(),
            self.file_id
        )))
    }

    /// Switch to `xloc` if it is newer; returns `true` if it was
    pub fn update(&mut self, xloc: XLocations) -> bool {
        if xloc.version() <= self.xloc().version() {
            return false;
        }
        debug!(
            file_id = %self.file_id,
            from = self.xloc().version(),
            to = xloc.version(),
            "replica locations updated"
        );
        self.strategy.update_xloc(xloc);
        self.view_outdated = false;
        true
    }

    /// Queue every object of the local OSD that is not being fetched
    pub fn add_local_objects(&mut self) {
        for object_no in self.xloc().local_objects() {
            if !self.in_progress.contains_key(&object_no) {
                self.strategy.add_object(object_no, false);
            }
        }
    }

    /// Register a client waiting for `object_no`
    pub fn add_object_for_replication(&mut self, object_no: ObjectNo, waiter: Waiter) {
        if let Some(object) = self.in_progress.get_mut(&object_no) {
            object.waiters.push(waiter);
            return;
        }
        let object = match self.waiting.entry(object_no) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.strategy.add_object(object_no, true);
                entry.insert(ReplicatingObject::default())
            }
        };
        object.waiters.push(waiter);
    }

    /// Start fetches until the in-progress limit is reached
    pub fn replicate(&mut self, stage: &ReplicationHandle) {
        if self.retry_at.is_some() || self.view_outdated {
            return;
        }
        while self.in_progress.len() < self.context.max_objects_in_progress {
            match self.strategy.select_next() {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    self.pause(&err);
                    return;
                }
                Err(err) => {
                    if self.skip_object(&err, stage) {
                        continue;
                    }
                    return;
                }
            }
            let Some(next) = self.strategy.take_next() else {
                break;
            };

            let object_no = next.object_no;
            let object = self.waiting.remove(&object_no).unwrap_or_default();
            self.in_progress.insert(object_no, object);
            trace!(
                file_id = %self.file_id,
                object_no,
                osd = %next.osd,
                in_progress = self.in_progress.len(),
                missing = self.strategy.objects_count(),
                "fetching object"
            );
            if let Err(err) = self.send(next, stage) {
                self.give_up(object_no, &err, stage);
            }
        }
    }

    /// Handle the outcome of a fetch
    pub fn object_fetched(
        &mut self,
        object_no: ObjectNo,
        osd: &ServiceId,
        outcome: FetchOutcome,
        stage: &ReplicationHandle,
    ) {
        let expected = self
            .in_progress
            .get(&object_no)
            .and_then(|object| object.pending.as_ref())
            .is_some_and(|(pending, _)| pending == osd);
        if !expected {
            debug!(file_id = %self.file_id, object_no, osd = %osd, "ignoring stale fetch response");
            return;
        }

        match outcome {
            FetchOutcome::Fetched {
                data,
                invalid_checksum,
                object_set,
            } => {
                self.response_from(osd, object_set);
                if invalid_checksum {
                    debug!(file_id = %self.file_id, object_no, osd = %osd, "fetched object has an invalid checksum");
                    if let Some(object) = self.in_progress.get_mut(&object_no) {
                        object.fallback = Some(data);
                    }
                    self.retry(object_no, stage);
                } else {
                    self.object_completed(object_no, data, stage);
                }
            }
            FetchOutcome::NotFound { object_set } => {
                self.response_from(osd, object_set);
                if self.xloc().replica_of(osd).is_some_and(Replica::is_complete) {
                    self.hole_found(object_no, stage);
                } else {
                    debug!(file_id = %self.file_id, object_no, osd = %osd, "object not on partial replica");
                    self.retry(object_no, stage);
                }
            }
            FetchOutcome::Error(error) => {
                debug!(file_id = %self.file_id, object_no, osd = %osd, %error, "fetch failed");
                self.context.availability.set_service_was_not_available(osd);
                self.retry(object_no, stage);
            }
            FetchOutcome::ViewError(error) => {
                warn!(file_id = %self.file_id, object_no, osd = %osd, %error, "replica locations are outdated");
                self.view_error(object_no, error, stage);
            }
        }
        self.replicate(stage);
    }

    /// A local write of `object_no` failed; a full replica fetches the
    /// object again after the retry delay
    pub fn store_failed(&mut self, object_no: ObjectNo, error: &ErrorResponse) {
        release_store(&self.storing);
        warn!(file_id = %self.file_id, object_no, %error, "failed to store replicated object");
        if !self.is_full_replica()
            || self.in_progress.contains_key(&object_no)
            || self.waiting.contains_key(&object_no)
        {
            return;
        }
        self.strategy.add_object(object_no, false);
        self.pause(error);
    }

    /// Resume a paused file once its retry delay elapsed
    pub fn resume_if_due(&mut self, now: Instant, stage: &ReplicationHandle) -> bool {
        match self.retry_at {
            Some(at) if at <= now => {
                debug!(file_id = %self.file_id, "resuming replication");
                self.retry_at = None;
                self.replicate(stage);
                true
            }
            _ => false,
        }
    }

    /// Move fetches unanswered for longer than the fetch timeout to other
    /// OSDs; returns the number of expired fetches
    pub fn expire_fetches(&mut self, now: Instant, stage: &ReplicationHandle) -> usize {
        let timeout = self.context.fetch_timeout;
        let expired: Vec<(ObjectNo, ServiceId)> = self
            .in_progress
            .iter()
            .filter_map(|(object_no, object)| match &object.pending {
                Some((osd, sent_at)) if now.saturating_duration_since(*sent_at) >= timeout => {
                    Some((*object_no, osd.clone()))
                }
                _ => None,
            })
            .collect();
        for (object_no, osd) in &expired {
            warn!(file_id = %self.file_id, object_no, osd = %osd, "object fetch timed out");
            self.context.availability.set_service_was_not_available(osd);
            self.retry(*object_no, stage);
        }
        if !expired.is_empty() {
            self.replicate(stage);
        }
        expired.len()
    }

    /// Fail every waiting client and stop fetching
    pub fn abort(&mut self, failure: &Failure, stage: &ReplicationHandle) {
        let objects = self.waiting.drain().chain(self.in_progress.drain());
        for (object_no, object) in objects {
            self.strategy.remove_object(object_no);
            for waiter in object.waiters {
                waiter.fail(failure.clone(), stage);
            }
        }
        self.retry_at = None;
    }

    /// Stop replicating the file
    pub fn cancel(&mut self, stage: &ReplicationHandle) {
        info!(file_id = %self.file_id, "replication cancelled");
        let failure = Failure::Remote(ErrorResponse::io(format!(
            "replication of file {} was cancelled",
            self.file_id
        )));
        self.abort(&failure, stage);
    }

    /// Reply template for `object_no`
    fn object_reply(&self, object_no: ObjectNo, data: ObjectData) -> ReplicationReply {
        let striping = self.xloc().local_replica().striping;
        ReplicationReply::Object(ObjectReply {
            file_id: self.file_id.clone(),
            object_no,
            data,
            stripe_size: striping.stripe_size_for_object(object_no),
            last_object_no: self.xloc().last_object_no(),
        })
    }

    fn answer(&self, object_no: ObjectNo, waiters: Vec<Waiter>, data: &ObjectData, stage: &ReplicationHandle) {
        for waiter in waiters {
            waiter.reply(self.object_reply(object_no, data.clone()), stage);
        }
    }

    fn fail_waiters(waiters: Vec<Waiter>, err: &TransferStrategyError, stage: &ReplicationHandle) {
        for waiter in waiters {
            let response = ErrorResponse::errno(PosixErrno::Eio, err.to_string());
            waiter.fail(Failure::Remote(response), stage);
        }
    }

    fn response_from(&mut self, osd: &ServiceId, object_set: Option<ObjectSet>) {
        self.context.availability.set_service_was_available(osd);
        if let Some(set) = object_set {
            self.strategy.set_osds_object_set(osd.clone(), set);
        }
    }

    /// Forget a finished object
    fn finish(&mut self, object_no: ObjectNo) -> Option<ReplicatingObject> {
        self.strategy.remove_object(object_no);
        self.in_progress.remove(&object_no)
    }

    fn object_completed(&mut self, object_no: ObjectNo, data: Bytes, stage: &ReplicationHandle) {
        let Some(object) = self.finish(object_no) else {
            return;
        };
        debug!(file_id = %self.file_id, object_no, waiters = object.waiters.len(), "object fetched");
        self.answer(object_no, object.waiters, &ObjectData::Exists(data.clone()), stage);
        let done = self.store_done(object_no, stage);
        self.context.backend.store_object(&self.file_id, object_no, data, done);
    }

    fn store_done(&self, object_no: ObjectNo, stage: &ReplicationHandle) -> StoreDone {
        self.storing.fetch_add(1, Ordering::AcqRel);
        store_done(stage.clone(), self.file_id.clone(), object_no, self.storing.clone())
    }

    /// A peer refused to serve `object_no` because the replica locations
    /// are outdated
    fn view_error(&mut self, object_no: ObjectNo, error: ErrorResponse, stage: &ReplicationHandle) {
        self.view_outdated = true;
        let failure = Failure::Remote(error);
        if let Some(object) = self.finish(object_no) {
            for waiter in object.waiters {
                waiter.fail(failure.clone(), stage);
            }
            if self.is_full_replica() {
                self.strategy.add_object(object_no, false);
            }
        }

        let full = self.is_full_replica();
        for (waiting_no, object) in self.waiting.drain() {
            if !full {
                self.strategy.remove_object(waiting_no);
            }
            for waiter in object.waiters {
                waiter.fail(failure.clone(), stage);
            }
        }
        for object in self.in_progress.values_mut() {
            for waiter in object.waiters.drain(..) {
                waiter.fail(failure.clone(), stage);
            }
        }
    }

    /// A complete replica lacks the object, so it is a hole
    fn hole_found(&mut self, object_no: ObjectNo, stage: &ReplicationHandle) {
        let Some(object) = self.finish(object_no) else {
            return;
        };
        match object.fallback {
            Some(data) if !object.waiters.is_empty() => {
                debug!(file_id = %self.file_id, object_no, "answering with data of invalid checksum");
                self.answer(object_no, object.waiters, &ObjectData::Exists(data), stage);
            }
            _ => {
                debug!(file_id = %self.file_id, object_no, "object is a hole");
                self.answer(object_no, object.waiters, &ObjectData::Padding, stage);
                let done = self.store_done(object_no, stage);
                self.context.backend.mark_hole(&self.file_id, object_no, done);
            }
        }
    }

    /// Fetch an in-progress object from another OSD
    fn retry(&mut self, object_no: ObjectNo, stage: &ReplicationHandle) {
        if let Some(object) = self.in_progress.get_mut(&object_no)
            && let Some((osd, _)) = object.pending.take()
        {
            object.tried.push(osd);
        }
        let result = self
            .select_osd(object_no)
            .and_then(|next| self.send(next, stage));
        if let Err(err) = result {
            self.give_up(object_no, &err, stage);
        }
    }

    fn select_osd(&mut self, object_no: ObjectNo) -> Result<NextRequest, TransferStrategyError> {
        let tried = self
            .in_progress
            .get(&object_no)
            .map(|object| object.tried.as_slice())
            .unwrap_or_default();
        self.strategy.select_next_osd(object_no, tried)?;
        self.strategy
            .take_next()
            .ok_or_else(|| TransferStrategyError::NoOsdFound {
                file_id: self.file_id.clone(),
                object_no,
            })
    }

    /// Send a fetch, moving on to other OSDs while sending fails
    fn send(&mut self, mut next: NextRequest, stage: &ReplicationHandle) -> Result<(), TransferStrategyError> {
        loop {
            let object_no = next.object_no;
            let request = FetchRequest {
                file_id: self.file_id.clone(),
                object_no,
                osd: next.osd.clone(),
                stripe_size: self
                    .xloc()
                    .local_replica()
                    .striping
                    .stripe_size_for_object(object_no),
                attach_object_set: next.attach_object_set,
            };
            let done = fetch_done(stage.clone(), self.file_id.clone(), object_no, next.osd.clone());
            match self.context.backend.fetch_object(request, done) {
                Ok(()) => {
                    if let Some(object) = self.in_progress.get_mut(&object_no) {
                        object.pending = Some((next.osd, Instant::now()));
                    }
                    return Ok(());
                }
                Err(err) => {
                    debug!(file_id = %self.file_id, object_no, osd = %next.osd, error = %err, "cannot send fetch");
                    self.context.availability.set_service_was_not_available(&next.osd);
                    if let Some(object) = self.in_progress.get_mut(&object_no) {
                        object.tried.push(next.osd);
                    }
                    next = self.select_osd(object_no)?;
                }
            }
        }
    }

    /// No OSD can serve an in-progress object
    fn give_up(&mut self, object_no: ObjectNo, err: &TransferStrategyError, stage: &ReplicationHandle) {
        let Some(object) = self.finish(object_no) else {
            return;
        };
        warn!(file_id = %self.file_id, object_no, error = %err, "object cannot be replicated");
        match object.fallback {
            Some(data) if !object.waiters.is_empty() => {
                self.answer(object_no, object.waiters, &ObjectData::Exists(data), stage);
            }
            _ => Self::fail_waiters(object.waiters, err, stage),
        }
        if err.is_retryable() && self.is_full_replica() {
            self.strategy.add_object(object_no, false);
            self.pause(err);
        }
    }

    /// Drop an object no OSD holds; returns `false` if it was not missing
    fn skip_object(&mut self, err: &TransferStrategyError, stage: &ReplicationHandle) -> bool {
        let object_no = err.object_no();
        warn!(file_id = %self.file_id, object_no, error = %err, "skipping object");
        let removed = self.strategy.remove_object(object_no);
        if let Some(object) = self.waiting.remove(&object_no) {
            Self::fail_waiters(object.waiters, err, stage);
        }
        removed
    }

    fn pause(&mut self, reason: &dyn fmt::Display) {
        info!(
            file_id = %self.file_id,
            reason = %reason,
            delay = ?self.context.retry_delay,
            "pausing replication"
        );
        self.retry_at = Some(Instant::now() + self.context.retry_delay);
    }
}

impl fmt::Debug for ReplicatingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatingFile")
            .field("file_id", &self.file_id)
            .field("in_progress", &self.in_progress.keys().collect::<Vec<_>>())
            .field("waiting", &self.waiting.keys().collect::<Vec<_>>())
            .field("missing", &self.strategy.objects_count())
            .field("retry_at", &self.retry_at)
            .field("view_outdated", &self.view_outdated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::replication::stage::{REPLICATION_STAGE, ReplicationStage};
    use osdflow_common::ErrorType;
    use osdflow_replication::{ReplicationFlags, StrategyKind};
    use osdflow_stage::{Outcome, Stage, callback_fn};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    pub const STRIPE_SIZE: u64 = 4096;
    pub const OBJECTS: u64 = 10;

    /// Backend recording every call; fetches stay outstanding until a test
    /// completes them
    #[derive(Default)]
    pub struct MockBackend {
        requests: Mutex<Vec<FetchRequest>>,
        pending: Mutex<VecDeque<(FetchRequest, FetchDone)>>,
        unreachable: Mutex<Vec<ServiceId>>,
        stored: Mutex<Vec<(ObjectNo, Bytes)>>,
        holes: Mutex<Vec<ObjectNo>>,
        failing_stores: Mutex<usize>,
    }

    impl MockBackend {
        /// Make sending to `osd` fail
        pub fn set_unreachable(&self, osd: &str) {
            self.unreachable.lock().push(ServiceId::new(osd));
        }

        /// Object and OSD of every fetch sent, in order
        pub fn fetches(&self) -> Vec<(ObjectNo, String)> {
            self.requests
                .lock()
                .iter()
                .map(|request| (request.object_no, request.osd.as_str().to_string()))
                .collect()
        }

        pub fn last_request(&self) -> Option<FetchRequest> {
            self.requests.lock().last().cloned()
        }

        pub fn outstanding(&self) -> usize {
            self.pending.lock().len()
        }

        /// Complete the oldest outstanding fetch
        pub fn complete_next(&self, outcome: FetchOutcome) -> Option<FetchRequest> {
            let (request, done) = self.pending.lock().pop_front()?;
            done(outcome);
            Some(request)
        }

        pub fn stored(&self) -> Vec<(ObjectNo, Bytes)> {
            self.stored.lock().clone()
        }

        pub fn holes(&self) -> Vec<ObjectNo> {
            self.holes.lock().clone()
        }

        /// Make the next `count` local writes fail
        pub fn fail_stores(&self, count: usize) {
            *self.failing_stores.lock() = count;
        }

        fn write(&self, done: StoreDone, record: impl FnOnce()) {
            let fail = {
                let mut failing = self.failing_stores.lock();
                let fail = *failing > 0;
                *failing = failing.saturating_sub(1);
                fail
            };
            if fail {
                done(Err(std::io::Error::other("disk full").into()));
            } else {
                record();
                done(Ok(()));
            }
        }
    }

    impl ReplicationBackend for MockBackend {
        fn fetch_object(&self, request: FetchRequest, done: FetchDone) -> osdflow_common::Result<()> {
            if self.unreachable.lock().contains(&request.osd) {
                return Err(osdflow_common::Error::ServiceUnavailable(request.osd));
            }
            self.requests.lock().push(request.clone());
            self.pending.lock().push_back((request, done));
            Ok(())
        }

        fn store_object(&self, _file_id: &FileId, object_no: ObjectNo, data: Bytes, done: StoreDone) {
            self.write(done, || self.stored.lock().push((object_no, data)));
        }

        fn mark_hole(&self, _file_id: &FileId, object_no: ObjectNo, done: StoreDone) {
            self.write(done, || self.holes.lock().push(object_no));
        }
    }

    pub fn osd(id: &str) -> ServiceId {
        ServiceId::new(id)
    }

    /// Locations of a file of `OBJECTS` objects: the local OSD "local" in a
    /// single-OSD replica, followed by single-OSD remote replicas
    pub fn xloc_version(version: u64, local: ReplicationFlags, remotes: &[(&str, ReplicationFlags)]) -> XLocations {
        let mut replicas = vec![Replica::new(vec![osd("local")], STRIPE_SIZE, local)];
        replicas.extend(
            remotes
                .iter()
                .map(|(id, flags)| Replica::new(vec![osd(id)], STRIPE_SIZE, *flags)),
        );
        XLocations::new(version, OBJECTS * STRIPE_SIZE, replicas, osd("local")).unwrap()
    }

    pub fn xloc(local: ReplicationFlags, remotes: &[(&str, ReplicationFlags)]) -> XLocations {
        xloc_version(1, local, remotes)
    }

    pub fn context(backend: Arc<MockBackend>, availability: Arc<ServiceAvailability>) -> ReplicationContext {
        ReplicationContext {
            backend,
            availability,
            options: StrategyOptions {
                seed: Some(7),
                ..StrategyOptions::default()
            },
            max_objects_in_progress: MAX_OBJECTS_IN_PROGRESS,
            retry_delay: Duration::ZERO,
            fetch_timeout: Duration::from_secs(60),
        }
    }

    pub fn fetched(data: &'static [u8]) -> FetchOutcome {
        FetchOutcome::Fetched {
            data: Bytes::from_static(data),
            invalid_checksum: false,
            object_set: None,
        }
    }

    pub fn not_found() -> FetchOutcome {
        FetchOutcome::NotFound { object_set: None }
    }

    type Replies = mpsc::Receiver<Outcome<ReplicationReply>>;

    struct Fixture {
        backend: Arc<MockBackend>,
        availability: Arc<ServiceAvailability>,
        stage: Stage<ReplicationStage>,
        tx: mpsc::Sender<Outcome<ReplicationReply>>,
        replies: Replies,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(MockBackend::default());
            let availability = Arc::new(ServiceAvailability::default());
            let stage = Stage::builder(
                REPLICATION_STAGE,
                ReplicationStage::new(context(backend.clone(), availability.clone())),
            )
            .build();
            let (tx, replies) = mpsc::channel();
            Self {
                backend,
                availability,
                stage,
                tx,
                replies,
            }
        }

        fn context(&self) -> ReplicationContext {
            context(self.backend.clone(), self.availability.clone())
        }

        fn file(&self, xloc: XLocations) -> ReplicatingFile {
            ReplicatingFile::new(FileId::from("1:1"), xloc, self.context())
        }

        fn handle(&self) -> ReplicationHandle {
            self.stage.handle()
        }

        fn waiter(&self) -> Waiter {
            let tx = self.tx.clone();
            let ticket = RequestTicket {
                id: 0,
                kind: ReplicationMethod::FETCH_OBJECT,
                entered_at: Instant::now(),
                size: 0,
            };
            Waiter::new(
                ticket,
                callback_fn(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            )
        }

        fn expect_data(&self) -> ObjectData {
            match self.replies.try_recv() {
                Ok(Outcome::Success(ReplicationReply::Object(reply))) => {
                    assert_eq!(reply.stripe_size, STRIPE_SIZE);
                    assert_eq!(reply.last_object_no, Some(OBJECTS - 1));
                    reply.data
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        fn expect_failure(&self) -> Failure {
            match self.replies.try_recv() {
                Ok(Outcome::Failed(failure)) => failure,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        fn expect_eio(&self) {
            match self.expect_failure() {
                Failure::Remote(response) => assert_eq!(response.posix_errno, PosixErrno::Eio),
                other => panic!("unexpected failure {other:?}"),
            }
        }
    }

    fn two_complete_replicas() -> XLocations {
        xloc(
            ReplicationFlags::partial(StrategyKind::Sequential),
            &[
                ("osd-a", ReplicationFlags::complete()),
                ("osd-b", ReplicationFlags::complete()),
            ],
        )
    }

    #[test]
    fn test_fetched_object_answers_all_waiters() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(xloc(
            ReplicationFlags::partial(StrategyKind::Sequential),
            &[("osd-a", ReplicationFlags::complete())],
        ));
        assert!(file.is_idle());

        file.add_object_for_replication(3, f.waiter());
        file.add_object_for_replication(3, f.waiter());
        assert_eq!(file.waiting_objects(), 1);

        file.replicate(&stage);
        assert_eq!(f.backend.fetches(), vec![(3, "osd-a".to_string())]);
        let request = f.backend.last_request().unwrap();
        assert_eq!(request.stripe_size, STRIPE_SIZE);
        assert!(!request.attach_object_set);
        assert!(file.is_object_in_progress(3));
        assert_eq!(file.waiting_objects(), 0);

        // joins the fetch already running
        file.add_object_for_replication(3, f.waiter());
        assert_eq!(f.backend.fetches().len(), 1);

        file.object_fetched(3, &osd("osd-a"), fetched(b"data"), &stage);
        for _ in 0..3 {
            assert_eq!(f.expect_data(), ObjectData::Exists(Bytes::from_static(b"data")));
        }
        assert_eq!(f.backend.stored(), vec![(3, Bytes::from_static(b"data"))]);
        assert!(file.is_idle());
    }

    #[test]
    fn test_missing_object_on_complete_replica_is_hole() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(xloc(
            ReplicationFlags::partial(StrategyKind::Sequential),
            &[("osd-a", ReplicationFlags::complete())],
        ));

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        file.object_fetched(3, &osd("osd-a"), not_found(), &stage);

        assert_eq!(f.expect_data(), ObjectData::Padding);
        assert_eq!(f.backend.holes(), vec![3]);
        assert!(f.backend.stored().is_empty());
        assert!(file.is_idle());
    }

    #[test]
    fn test_invalid_checksum_retries_and_falls_back() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(two_complete_replicas());

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        file.object_fetched(
            3,
            &osd("osd-a"),
            FetchOutcome::Fetched {
                data: Bytes::from_static(b"suspect"),
                invalid_checksum: true,
                object_set: None,
            },
            &stage,
        );
        assert_eq!(
            f.backend.fetches(),
            vec![(3, "osd-a".to_string()), (3, "osd-b".to_string())]
        );
        assert!(f.replies.try_recv().is_err());

        // a hole on a complete replica loses against data that exists
        file.object_fetched(3, &osd("osd-b"), not_found(), &stage);
        assert_eq!(f.expect_data(), ObjectData::Exists(Bytes::from_static(b"suspect")));
        assert!(f.backend.holes().is_empty());
        assert!(f.backend.stored().is_empty());
    }

    #[test]
    fn test_fetch_error_marks_osd_unavailable() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(two_complete_replicas());

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        file.object_fetched(
            3,
            &osd("osd-a"),
            FetchOutcome::Error(ErrorResponse::io("connection reset")),
            &stage,
        );

        assert!(!f.availability.is_available(&osd("osd-a")));
        assert_eq!(f.backend.fetches()[1], (3, "osd-b".to_string()));

        file.object_fetched(3, &osd("osd-b"), fetched(b"data"), &stage);
        assert_eq!(f.expect_data(), ObjectData::Exists(Bytes::from_static(b"data")));
    }

    #[test]
    fn test_send_failure_moves_to_next_osd() {
        let f = Fixture::new();
        let stage = f.handle();
        f.backend.set_unreachable("osd-a");
        let mut file = f.file(two_complete_replicas());

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);

        assert_eq!(f.backend.fetches(), vec![(3, "osd-b".to_string())]);
        assert!(!f.availability.is_available(&osd("osd-a")));
        assert!(file.is_object_in_progress(3));
    }

    #[test]
    fn test_unreachable_holders_fail_waiting_client() {
        let f = Fixture::new();
        let stage = f.handle();
        f.availability.set_service_was_not_available(&osd("osd-a"));
        let mut file = f.file(xloc(
            ReplicationFlags::partial(StrategyKind::Sequential),
            &[
                ("osd-a", ReplicationFlags::complete()),
                ("osd-b", ReplicationFlags::partial(StrategyKind::Sequential)),
            ],
        ));

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        assert_eq!(f.backend.fetches(), vec![(3, "osd-b".to_string())]);
        assert!(f.backend.last_request().unwrap().attach_object_set);

        // a partial replica may lack the object; the complete one is down
        file.object_fetched(3, &osd("osd-b"), not_found(), &stage);
        f.expect_eio();
        assert_eq!(f.backend.fetches().len(), 1);
        assert!(!file.is_paused());
        assert!(file.is_idle());
    }

    #[test]
    fn test_object_held_by_no_osd_is_skipped() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(xloc(
            ReplicationFlags::partial(StrategyKind::Random),
            &[("osd-b", ReplicationFlags::partial(StrategyKind::Random))],
        ));

        file.add_object_for_replication(1, f.waiter());
        file.replicate(&stage);
        assert!(f.backend.last_request().unwrap().attach_object_set);

        let mut set = ObjectSet::new();
        set.add(1);
        file.object_fetched(
            1,
            &osd("osd-b"),
            FetchOutcome::Fetched {
                data: Bytes::from_static(b"one"),
                invalid_checksum: false,
                object_set: Some(set),
            },
            &stage,
        );
        assert_eq!(f.expect_data(), ObjectData::Exists(Bytes::from_static(b"one")));

        file.add_object_for_replication(2, f.waiter());
        file.replicate(&stage);
        f.expect_eio();
        assert_eq!(f.backend.fetches().len(), 1);
        assert!(file.is_idle());
    }

    #[test]
    fn test_full_replica_limits_objects_in_progress() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(xloc(
            ReplicationFlags::full(StrategyKind::Sequential),
            &[("osd-a", ReplicationFlags::complete())],
        ));
        assert!(file.is_full_replica());
        assert_eq!(file.missing_objects(), 10);

        file.replicate(&stage);
        assert_eq!(file.objects_in_progress(), MAX_OBJECTS_IN_PROGRESS);
        let objects: Vec<ObjectNo> = f.backend.fetches().into_iter().map(|(no, _)| no).collect();
        assert_eq!(objects, vec![0, 1, 2, 3, 4]);

        file.object_fetched(0, &osd("osd-a"), fetched(b"zero"), &stage);
        assert_eq!(f.backend.stored(), vec![(0, Bytes::from_static(b"zero"))]);
        assert_eq!(f.backend.fetches().last(), Some(&(5, "osd-a".to_string())));
        assert_eq!(file.objects_in_progress(), MAX_OBJECTS_IN_PROGRESS);
        assert_eq!(file.missing_objects(), 4);
    }

    #[test]
    fn test_paused_file_resumes_when_due() {
        let f = Fixture::new();
        let stage = f.handle();
        f.availability.set_service_was_not_available(&osd("osd-a"));
        let mut file = f.file(xloc(
            ReplicationFlags::full(StrategyKind::Sequential),
            &[("osd-a", ReplicationFlags::complete())],
        ));

        file.replicate(&stage);
        assert!(file.is_paused());
        assert!(!file.is_idle());
        assert!(f.backend.fetches().is_empty());

        f.availability.set_service_was_available(&osd("osd-a"));
        assert!(file.resume_if_due(Instant::now(), &stage));
        assert!(!file.is_paused());
        assert_eq!(f.backend.fetches().len(), MAX_OBJECTS_IN_PROGRESS);
        assert!(!file.resume_if_due(Instant::now(), &stage));
    }

    #[test]
    fn test_stale_response_is_ignored() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut file = f.file(two_complete_replicas());

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        file.object_fetched(3, &osd("osd-b"), fetched(b"stale"), &stage);
        assert!(f.replies.try_recv().is_err());
        assert!(file.is_object_in_progress(3));

        file.object_fetched(3, &osd("osd-a"), fetched(b"data"), &stage);
        assert_eq!(f.expect_data(), ObjectData::Exists(Bytes::from_static(b"data")));
    }

    #[test]
    fn test_expired_fetch_moves_to_other_osd() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut context = f.context();
        context.fetch_timeout = Duration::ZERO;
        let mut file = ReplicatingFile::new(FileId::from("1:1"), two_complete_replicas(), context);

        file.add_object_for_replication(3, f.waiter());
        file.replicate(&stage);
        assert_eq!(file.expire_fetches(Instant::now(), &stage), 1);
        assert!(!f.availability.is_available(&osd("osd-a")));
        assert_eq!(
            f.backend.fetches(),
            vec![(3, "osd-a".to_string()), (3, "osd-b".to_string())]
        );

        // the late answer of the first OSD no longer counts
        file.object_fetched(3, &osd("osd-a"), fetched(b"late"), &stage);
        assert!(f.replies.try_recv().is_err());
    }

    #[test]
    fn test_abort_and_cancel_fail_all_waiters() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut context = f.context();
        context.max_objects_in_progress = 1;
        let mut file = ReplicatingFile::new(FileId::from("1:1"), two_complete_replicas(), context);

        file.add_object_for_replication(3, f.waiter());
        file.add_object_for_replication(4, f.waiter());
        file.replicate(&stage);
        assert_eq!(file.objects_in_progress(), 1);
        assert_eq!(file.waiting_objects(), 1);

        file.abort(
            &Failure::ShutDown {
                stage: REPLICATION_STAGE.to_string(),
            },
            &stage,
        );
        for _ in 0..2 {
            assert!(matches!(f.expect_failure(), Failure::ShutDown { .. }));
        }
        assert!(file.is_idle());

        file.add_object_for_replication(5, f.waiter());
        file.cancel(&stage);
        assert!(matches!(f.expect_failure(), Failure::Remote(_)));
        assert!(file.is_idle());
    }

    #[test]
    fn test_update_applies_newer_locations_only() {
        let f = Fixture::new();
        let mut file = f.file(two_complete_replicas());
        let remotes = [
            ("osd-a", ReplicationFlags::complete()),
            ("osd-c", ReplicationFlags::complete()),
        ];

        assert!(!file.update(xloc_version(1, ReplicationFlags::partial(StrategyKind::Sequential), &remotes)));
        assert!(file.update(xloc_version(2, ReplicationFlags::partial(StrategyKind::Sequential), &remotes)));
        assert_eq!(file.xloc().version(), 2);
        assert!(file.xloc().contains_osd(&osd("osd-c")));
        assert!(!file.xloc().contains_osd(&osd("osd-b")));
    }

    #[test]
    fn test_view_error_fails_all_waiters_until_locations_update() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut context = f.context();
        context.max_objects_in_progress = 2;
        let mut file = ReplicatingFile::new(FileId::from("1:1"), two_complete_replicas(), context);

        for object_no in [3, 4, 5] {
            file.add_object_for_replication(object_no, f.waiter());
        }
        file.replicate(&stage);
        assert_eq!(file.objects_in_progress(), 2);
        assert_eq!(file.waiting_objects(), 1);

        let fetches = f.backend.fetches();
        let (first, first_osd) = fetches[0].clone();
        file.object_fetched(
            first,
            &osd(&first_osd),
            FetchOutcome::ViewError(ErrorResponse::invalid_view("locations version 1 is outdated")),
            &stage,
        );
        for _ in 0..3 {
            match f.expect_failure() {
                Failure::Remote(response) => assert_eq!(response.error_type, ErrorType::InvalidView),
                other => panic!("unexpected failure {other:?}"),
            }
        }
        assert!(f.replies.try_recv().is_err());
        assert!(file.is_view_outdated());
        assert!(f.availability.is_available(&osd(&first_osd)));
        assert_eq!(file.objects_in_progress(), 1);
        assert_eq!(file.waiting_objects(), 0);
        assert!(file.check_view().is_err());
        assert!(!file.is_idle());

        // the other fetch still completes but starts nothing new
        let (second, second_osd) = fetches[1].clone();
        file.object_fetched(second, &osd(&second_osd), fetched(b"data"), &stage);
        assert!(f.replies.try_recv().is_err());
        assert_eq!(f.backend.stored(), vec![(second, Bytes::from_static(b"data"))]);
        assert_eq!(f.backend.fetches().len(), 2);

        assert!(!file.update(two_complete_replicas()));
        assert!(file.check_view().is_err());
        let newer = xloc_version(
            2,
            ReplicationFlags::partial(StrategyKind::Sequential),
            &[
                ("osd-a", ReplicationFlags::complete()),
                ("osd-b", ReplicationFlags::complete()),
            ],
        );
        assert!(file.update(newer));
        assert!(file.check_view().is_ok());
        assert!(file.is_idle());
    }

    #[test]
    fn test_failed_write_queues_object_again() {
        let f = Fixture::new();
        let stage = f.handle();
        let mut context = f.context();
        context.max_objects_in_progress = 1;
        let mut file = ReplicatingFile::new(
            FileId::from("1:1"),
            xloc(
                ReplicationFlags::full(StrategyKind::Sequential),
                &[("osd-a", ReplicationFlags::complete())],
            ),
            context,
        );
        file.replicate(&stage);
        assert_eq!(f.backend.fetches(), vec![(0, "osd-a".to_string())]);

        f.backend.fail_stores(1);
        file.object_fetched(0, &osd("osd-a"), fetched(b"zero"), &stage);
        assert!(f.backend.stored().is_empty());
        assert_eq!(file.stores_in_progress(), 1);
        assert_eq!(stage.queue_len(), 1);
        assert_eq!(file.missing_objects(), 8);

        file.store_failed(0, &ErrorResponse::io("disk full"));
        assert_eq!(file.stores_in_progress(), 0);
        assert_eq!(file.missing_objects(), 9);
        assert!(file.is_paused());
        assert!(!file.is_idle());

        file.object_fetched(1, &osd("osd-a"), fetched(b"one"), &stage);
        assert_eq!(f.backend.stored(), vec![(1, Bytes::from_static(b"one"))]);
        assert_eq!(f.backend.fetches().len(), 2);

        assert!(file.resume_if_due(Instant::now(), &stage));
        assert_eq!(f.backend.fetches().last(), Some(&(0, "osd-a".to_string())));
    }
}
