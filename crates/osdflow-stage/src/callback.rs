//! Result delivery for stage requests
//!
//! Every request carries a [`Callback`] that is completed exactly once with
//! one of three outcomes: success, failure or redirect. The methods consume
//! the boxed callback, so a second completion does not compile.

use bytes::Bytes;
use osdflow_common::{ErrorResponse, PosixErrno, ServiceId};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Receiver of the outcome of a stage request
pub trait Callback<T>: Send {
    /// The request was processed successfully
    fn success(self: Box<Self>, result: T);

    /// The request failed
    fn failed(self: Box<Self>, failure: Failure);

    /// The request must be sent to another service
    fn redirect(self: Box<Self>, target: ServiceId);
}

/// Reason a stage request failed
#[derive(Clone, Debug, Error)]
pub enum Failure {
    #[error("stage {stage} is at capacity ({capacity} queued requests)")]
    CapacityExceeded { stage: String, capacity: usize },

    #[error("stage {stage} is overloaded (estimated response time {estimated:?})")]
    Overloaded { stage: String, estimated: Duration },

    #[error("stage {stage} has been shut down")]
    ShutDown { stage: String },

    /// Structured error reported by a remote service, passed through verbatim
    #[error("{0}")]
    Remote(ErrorResponse),

    /// Unexpected internal error
    #[error("internal error: {message}")]
    Internal {
        message: String,
        trace: Option<String>,
    },
}

impl Failure {
    /// Wrap an arbitrary error, keeping its cause chain as the trace
    pub fn internal(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self::Internal {
            message: err.to_string(),
            trace: (!causes.is_empty()).then(|| format!("caused by: {}", causes.join("\ncaused by: "))),
        }
    }

    /// Internal error from a plain message
    pub fn internal_message(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace: None,
        }
    }

    /// Check if the submitter may retry the request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CapacityExceeded { .. } | Self::Overloaded { .. } => true,
            Self::Remote(response) => response.is_retryable(),
            Self::ShutDown { .. } | Self::Internal { .. } => false,
        }
    }

    /// Structured response sent to the remote caller
    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Self::CapacityExceeded { .. } | Self::Overloaded { .. } => {
                ErrorResponse::errno(PosixErrno::Eagain, self.to_string())
            }
            Self::ShutDown { .. } => ErrorResponse::io(self.to_string()),
            Self::Remote(response) => response.clone(),
            Self::Internal { message, trace } => {
                ErrorResponse::internal(format!("internal server error: {message}"), trace.clone())
            }
        }
    }
}

impl From<ErrorResponse> for Failure {
    fn from(response: ErrorResponse) -> Self {
        Self::Remote(response)
    }
}

impl From<osdflow_common::Error> for Failure {
    fn from(err: osdflow_common::Error) -> Self {
        Self::Remote(err.to_error_response())
    }
}

/// Callback for fire-and-forget requests; outcomes are only logged
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallback;

impl<T> Callback<T> for NoopCallback {
    fn success(self: Box<Self>, _result: T) {}

    fn failed(self: Box<Self>, failure: Failure) {
        debug!(%failure, "request without callback failed");
    }

    fn redirect(self: Box<Self>, target: ServiceId) {
        debug!(%target, "request without callback redirected");
    }
}

/// Wrapper completing its callback with [`Failure::Internal`] when dropped
/// uncompleted, e.g. while a stage handler unwinds
pub(crate) struct CompletionGuard<T> {
    inner: Option<Box<dyn Callback<T>>>,
}

impl<T: 'static> CompletionGuard<T> {
    pub(crate) fn wrap(callback: Box<dyn Callback<T>>) -> Box<dyn Callback<T>> {
        Box::new(Self { inner: Some(callback) })
    }
}

impl<T> Callback<T> for CompletionGuard<T> {
    fn success(mut self: Box<Self>, result: T) {
        if let Some(inner) = self.inner.take() {
            inner.success(result);
        }
    }

    fn failed(mut self: Box<Self>, failure: Failure) {
        if let Some(inner) = self.inner.take() {
            inner.failed(failure);
        }
    }

    fn redirect(mut self: Box<Self>, target: ServiceId) {
        if let Some(inner) = self.inner.take() {
            inner.redirect(target);
        }
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let message = if std::thread::panicking() {
            "request handler panicked"
        } else {
            "request dropped without a response"
        };
        error!(reason = message, "completing abandoned request");
        inner.failed(Failure::internal_message(message));
    }
}

/// Outcome of a request, as seen by closure callbacks
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Failed(Failure),
    Redirect(ServiceId),
}

impl<T> Outcome<T> {
    /// Check if the request succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

struct FnCallback<T, F> {
    f: F,
    _result: PhantomData<fn(T)>,
}

impl<T, F> Callback<T> for FnCallback<T, F>
where
    F: FnOnce(Outcome<T>) + Send,
{
    fn success(self: Box<Self>, result: T) {
        (self.f)(Outcome::Success(result));
    }

    fn failed(self: Box<Self>, failure: Failure) {
        (self.f)(Outcome::Failed(failure));
    }

    fn redirect(self: Box<Self>, target: ServiceId) {
        (self.f)(Outcome::Redirect(target));
    }
}

/// Build a callback from a closure receiving the [`Outcome`]
pub fn callback_fn<T, F>(f: F) -> Box<dyn Callback<T>>
where
    T: 'static,
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    Box::new(FnCallback {
        f,
        _result: PhantomData,
    })
}

/// Reply message handed to the transport layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcReply {
    /// Encoded response message
    pub message: Bytes,
    /// Optional bulk data following the message
    pub data: Option<Bytes>,
}

/// Transport-level responder of a single RPC
///
/// Exactly one of the methods is called per request.
pub trait Responder: Send {
    fn send_success(self: Box<Self>, reply: RpcReply);

    fn send_error(self: Box<Self>, error: ErrorResponse);

    fn send_redirect(self: Box<Self>, target: ServiceId);
}

/// Callback that answers the originating RPC through its [`Responder`]
pub struct RpcRequestCallback {
    responder: Box<dyn Responder>,
}

impl RpcRequestCallback {
    pub fn new(responder: Box<dyn Responder>) -> Self {
        Self { responder }
    }
}

impl fmt::Debug for RpcRequestCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcRequestCallback").finish_non_exhaustive()
    }
}

impl<T: Into<RpcReply>> Callback<T> for RpcRequestCallback {
    fn success(self: Box<Self>, result: T) {
        self.responder.send_success(result.into());
    }

    fn failed(self: Box<Self>, failure: Failure) {
        if let Failure::Internal { message, trace } = &failure {
            error!(%message, trace = trace.as_deref().unwrap_or(""), "internal error while processing request");
        }
        self.responder.send_error(failure.to_error_response());
    }

    fn redirect(self: Box<Self>, target: ServiceId) {
        self.responder.send_redirect(target);
    }
}
