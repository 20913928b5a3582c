//! Stage request envelope

use crate::callback::{Callback, CompletionGuard, Failure, NoopCallback};
use osdflow_common::ServiceId;
use std::fmt;
use std::time::Instant;

/// Method a stage request asks the stage to run
///
/// Implemented by an enum per stage whose variants carry the arguments of
/// the method. `kind` maps every variant to a dense index below `KINDS`,
/// which is used for per-kind accounting.
pub trait StageMethod: fmt::Debug + Send + 'static {
    /// Number of distinct kinds
    const KINDS: usize;

    /// Dense index of this method's kind
    fn kind(&self) -> usize;

    /// Human-readable name of this method's kind
    fn name(&self) -> &'static str;
}

/// Bookkeeping data of an entered request, needed to exit it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTicket {
    pub id: u64,
    pub kind: usize,
    pub entered_at: Instant,
    pub size: u64,
}

/// A request waiting for, or being processed by, a stage
///
/// `M` is the stage method (with its arguments), `R` the original domain
/// request (absent for internal events), `T` the result delivered to the
/// callback.
pub struct StageRequest<M, R, T> {
    id: u64,
    method: M,
    request: Option<R>,
    callback: Box<dyn Callback<T>>,
    entered_at: Instant,
    deadline: Option<Instant>,
    size: u64,
}

impl<M, R, T: 'static> StageRequest<M, R, T> {
    /// Create a request; without a callback the outcome is discarded
    ///
    /// A request dropped without being completed fails its callback with
    /// [`Failure::Internal`].
    pub fn new(method: M, request: Option<R>, callback: Option<Box<dyn Callback<T>>>) -> Self {
        let callback = callback.unwrap_or_else(|| Box::new(NoopCallback));
        Self {
            id: 0,
            method,
            request,
            callback: CompletionGuard::wrap(callback),
            entered_at: Instant::now(),
            deadline: None,
            size: 0,
        }
    }
}

impl<M, R, T> StageRequest<M, R, T> {
    /// Latest instant at which processing is still useful
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Payload size in bytes, for load estimation
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub(crate) fn assign_id(&mut self, id: u64) {
        self.id = id;
        self.entered_at = Instant::now();
    }

    /// Per-stage sequence number, assigned when the request enters a stage
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &M {
        &self.method
    }

    pub fn request(&self) -> Option<&R> {
        self.request.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// Split into method, original request and callback
    pub fn into_parts(self) -> (M, Option<R>, Box<dyn Callback<T>>) {
        (self.method, self.request, self.callback)
    }

    /// Complete the request successfully
    pub fn success(self, result: T) {
        self.callback.success(result);
    }

    /// Complete the request with a failure
    pub fn failed(self, failure: Failure) {
        self.callback.failed(failure);
    }

    /// Complete the request with a redirect
    pub fn redirect(self, target: ServiceId) {
        self.callback.redirect(target);
    }
}

impl<M: StageMethod, R, T> StageRequest<M, R, T> {
    /// Ticket used to exit this request from its stage
    pub fn ticket(&self) -> RequestTicket {
        RequestTicket {
            id: self.id,
            kind: self.method.kind(),
            entered_at: self.entered_at,
            size: self.size,
        }
    }
}

impl<M: fmt::Debug, R, T> fmt::Debug for StageRequest<M, R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("has_request", &self.request.is_some())
            .field("deadline", &self.deadline)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
