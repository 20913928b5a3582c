//! Stage worker
//!
//! A [`Stage`] owns one [`StageQueue`] and one worker thread. The worker
//! takes requests in FIFO order and hands each one to the stage's
//! [`StageHandler`], which has exclusive access to its own state. Between
//! requests the worker runs the handler's periodic maintenance job.
//!
//! Errors and panics escaping the handler are fatal: the stage stops,
//! fails all queued requests and notifies its [`LifeCycleListener`].

use crate::callback::Failure;
use crate::component::{AutonomousComponent, LifeCycleListener};
use crate::error::StageError;
use crate::olp::OverloadProtection;
use crate::queue::{StageQueue, Take};
use crate::request::{RequestTicket, StageMethod, StageRequest};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// What happened to a request handed to [`StageHandler::process`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Processing finished; the stage exits the request
    Completed,
    /// The handler kept the request and calls [`StageHandle::exit`] later
    Deferred,
}

/// Lifecycle state of a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Request type processed by handler `H`
pub type HandlerRequest<H> = StageRequest<
    <H as StageHandler>::Method,
    <H as StageHandler>::Request,
    <H as StageHandler>::Response,
>;

/// Handle of the stage running handler `H`
pub type HandlerHandle<H> = StageHandle<
    <H as StageHandler>::Method,
    <H as StageHandler>::Request,
    <H as StageHandler>::Response,
>;

/// Per-stage request logic, run on the stage's worker thread only
pub trait StageHandler: Send + Sized + 'static {
    type Method: StageMethod;
    type Request: Send + 'static;
    type Response: 'static;

    /// Process one request
    ///
    /// Domain errors must be reported through the request's callback.
    /// Returning `Err` means the handler's state can no longer be trusted
    /// and stops the stage.
    fn process(
        &mut self,
        request: HandlerRequest<Self>,
        stage: &HandlerHandle<Self>,
    ) -> anyhow::Result<Dispatch>;

    /// Periodic maintenance job
    ///
    /// Returns the delay until the next run, or `None` for the configured
    /// period.
    fn chron_job(&mut self, _stage: &HandlerHandle<Self>) -> anyhow::Result<Option<Duration>> {
        Ok(None)
    }

    /// Called once when the stage stops; must complete deferred requests
    fn shutdown(&mut self, _stage: &HandlerHandle<Self>) {}
}

struct StageShared<M, R, T> {
    name: String,
    queue: StageQueue<M, R, T>,
    outstanding: AtomicUsize,
    next_id: AtomicU64,
    olp: Option<OverloadProtection>,
    state: Mutex<StageState>,
}

/// Cloneable entry point of a stage, usable from any thread
pub struct StageHandle<M, R, T> {
    shared: Arc<StageShared<M, R, T>>,
}

impl<M, R, T> Clone for StageHandle<M, R, T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: StageMethod, R, T: 'static> StageHandle<M, R, T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> StageState {
        *self.shared.state.lock()
    }

    /// Number of requests waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn overload_protection(&self) -> Option<&OverloadProtection> {
        self.shared.olp.as_ref()
    }

    /// Admit and enqueue a request; see [`AutonomousComponent::enter`]
    pub fn enter(&self, mut request: StageRequest<M, R, T>) -> bool {
        let shared = &self.shared;
        if let Some(olp) = &shared.olp {
            let kind = request.method().kind();
            if let Err(estimated) = olp.admit(kind, request.size(), request.deadline()) {
                debug!(
                    stage = %shared.name,
                    method = request.method().name(),
                    ?estimated,
                    "refusing request, stage overloaded"
                );
                request.failed(Failure::Overloaded {
                    stage: shared.name.clone(),
                    estimated,
                });
                return false;
            }
        }

        request.assign_id(shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let ticket = request.ticket();
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(olp) = &shared.olp {
            olp.controller().enter(ticket.kind, ticket.size);
        }

        if shared.queue.enqueue(request) {
            true
        } else {
            self.release(ticket);
            false
        }
    }

    /// Release a processed request; see [`AutonomousComponent::exit`]
    pub fn exit(&self, ticket: RequestTicket) {
        self.decrement();
        if let Some(olp) = &self.shared.olp {
            olp.controller()
                .record(ticket.kind, ticket.size, ticket.entered_at.elapsed());
        }
    }

    /// Requests entered but not yet exited
    pub fn num_requests(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Release a request without recording a processing time
    fn release(&self, ticket: RequestTicket) {
        self.decrement();
        if let Some(olp) = &self.shared.olp {
            olp.controller().quit(ticket.kind, ticket.size);
        }
    }

    fn decrement(&self) {
        let _ = self
            .shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Close the queue and fail every request still waiting in it
    fn fail_pending(&self) -> usize {
        let pending = self.shared.queue.close();
        let count = pending.len();
        for request in pending {
            let ticket = request.ticket();
            request.failed(Failure::ShutDown {
                stage: self.shared.name.clone(),
            });
            self.release(ticket);
        }
        count
    }

    fn set_state(&self, state: StageState) {
        *self.shared.state.lock() = state;
    }
}

impl<M: StageMethod, R, T: 'static> AutonomousComponent for StageHandle<M, R, T> {
    type Method = M;
    type Request = R;
    type Response = T;

    fn enter(&self, request: StageRequest<M, R, T>) -> bool {
        StageHandle::enter(self, request)
    }

    fn exit(&self, ticket: RequestTicket) {
        StageHandle::exit(self, ticket);
    }

    fn num_requests(&self) -> usize {
        StageHandle::num_requests(self)
    }
}

/// Builder for [`Stage`]
pub struct StageBuilder<H: StageHandler> {
    name: String,
    handler: H,
    capacity: usize,
    period: Option<Duration>,
    listener: Option<Arc<dyn LifeCycleListener>>,
    olp: Option<OverloadProtection>,
}

impl<H: StageHandler> StageBuilder<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
            capacity: 0,
            period: None,
            listener: None,
            olp: None,
        }
    }

    /// Bound the queue; 0 (the default) means unbounded
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Run the maintenance job every `period`; zero disables it
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = (!period.is_zero()).then_some(period);
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn LifeCycleListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Refuse requests whose deadline cannot be met, except for the
    /// method kinds listed in `unrefusable`
    #[must_use]
    pub fn with_overload_protection(mut self, unrefusable: &[usize]) -> Self {
        self.olp = Some(OverloadProtection::new(H::Method::KINDS, unrefusable));
        self
    }

    pub fn build(self) -> Stage<H> {
        let handle = StageHandle {
            shared: Arc::new(StageShared {
                queue: StageQueue::new(self.name.clone(), self.capacity),
                name: self.name,
                outstanding: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                olp: self.olp,
                state: Mutex::new(StageState::Created),
            }),
        };
        Stage {
            worker: Some(Worker {
                handler: self.handler,
                handle: handle.clone(),
                period: self.period,
                listener: self.listener,
            }),
            handle,
            thread: None,
        }
    }
}

/// A stage with its worker thread
///
/// Requests may be entered before [`Stage::start`]; they are processed once
/// the worker runs. Dropping the stage shuts it down.
pub struct Stage<H: StageHandler> {
    handle: HandlerHandle<H>,
    worker: Option<Worker<H>>,
    thread: Option<JoinHandle<()>>,
}

impl<H: StageHandler> Stage<H> {
    pub fn builder(name: impl Into<String>, handler: H) -> StageBuilder<H> {
        StageBuilder::new(name, handler)
    }

    pub fn handle(&self) -> HandlerHandle<H> {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn state(&self) -> StageState {
        self.handle.state()
    }

    /// Spawn the worker thread
    pub fn start(&mut self) -> Result<(), StageError> {
        let Some(worker) = self.worker.take() else {
            return Err(StageError::AlreadyStarted(self.name().to_string()));
        };
        self.handle.set_state(StageState::Running);

        let spawned = std::thread::Builder::new()
            .name(format!("stage-{}", self.name()))
            .spawn(move || worker.run());
        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                Ok(())
            }
            Err(source) => {
                self.handle.set_state(StageState::Stopped);
                self.handle.fail_pending();
                Err(StageError::Spawn {
                    stage: self.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Stop the stage
    ///
    /// Queued requests fail with [`Failure::ShutDown`]; a request being
    /// processed is allowed to finish. Blocks until the worker exited.
    /// Calling it again has no effect.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.handle.shared.state.lock();
            match *state {
                StageState::Running => *state = StageState::ShuttingDown,
                StageState::Created => *state = StageState::Stopped,
                StageState::ShuttingDown | StageState::Stopped => {}
            }
        }

        let failed = self.handle.fail_pending();
        if failed > 0 {
            debug!(stage = %self.name(), failed, "failed queued requests at shutdown");
        }

        // never started
        if let Some(mut worker) = self.worker.take() {
            worker.handler.shutdown(&self.handle);
        }

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!(stage = %self.name(), "stage worker thread panicked");
            }
        }
    }
}

impl<H: StageHandler> Drop for Stage<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<H: StageHandler> {
    handler: H,
    handle: HandlerHandle<H>,
    period: Option<Duration>,
    listener: Option<Arc<dyn LifeCycleListener>>,
}

impl<H: StageHandler> Worker<H> {
    fn run(mut self) {
        let name = self.handle.name().to_string();
        info!(stage = %name, "stage started");
        if let Some(listener) = &self.listener {
            listener.started(&name);
        }

        let mut next_run = self.period.map(|period| Instant::now() + period);
        loop {
            let timeout = next_run.map(|at| at.saturating_duration_since(Instant::now()));
            let result = match self.handle.shared.queue.take(timeout) {
                Take::Closed => break,
                Take::TimedOut => Ok(()),
                Take::Request(request) => self.dispatch(request),
            };
            let result = result.and_then(|()| self.maintain(&mut next_run));
            if let Err(cause) = result {
                self.crash(&name, cause);
                return;
            }
        }

        if catch_unwind(AssertUnwindSafe(|| self.handler.shutdown(&self.handle))).is_err() {
            error!(stage = %name, "handler panicked during shutdown");
        }
        self.handle.set_state(StageState::Stopped);
        info!(stage = %name, "stage shut down");
        if let Some(listener) = &self.listener {
            listener.shut_down(&name);
        }
    }

    fn dispatch(&mut self, request: HandlerRequest<H>) -> anyhow::Result<()> {
        let ticket = request.ticket();
        let method = request.method().name();
        trace!(stage = %self.handle.name(), id = ticket.id, method, "processing request");

        let handle = &self.handle;
        let handler = &mut self.handler;
        match catch_unwind(AssertUnwindSafe(|| handler.process(request, handle))) {
            Ok(Ok(Dispatch::Completed)) => {
                handle.exit(ticket);
                Ok(())
            }
            Ok(Ok(Dispatch::Deferred)) => Ok(()),
            Ok(Err(err)) => {
                handle.release(ticket);
                Err(err.context(format!("{method} request {} failed", ticket.id)))
            }
            Err(panic) => {
                handle.release(ticket);
                Err(anyhow::anyhow!(
                    "{method} request {} panicked: {}",
                    ticket.id,
                    panic_message(&*panic)
                ))
            }
        }
    }

    fn maintain(&mut self, next_run: &mut Option<Instant>) -> anyhow::Result<()> {
        let Some(period) = self.period else {
            return Ok(());
        };
        if next_run.is_some_and(|at| Instant::now() < at) {
            return Ok(());
        }

        trace!(stage = %self.handle.name(), "running maintenance job");
        let handle = &self.handle;
        let handler = &mut self.handler;
        let delay = match catch_unwind(AssertUnwindSafe(|| handler.chron_job(handle))) {
            Ok(result) => result.map_err(|err| err.context("maintenance job failed"))?,
            Err(panic) => anyhow::bail!("maintenance job panicked: {}", panic_message(&*panic)),
        };
        *next_run = Some(Instant::now() + delay.unwrap_or(period));
        Ok(())
    }

    fn crash(&mut self, name: &str, cause: anyhow::Error) {
        error!(stage = %name, error = format!("{cause:#}"), "stage crashed");
        self.handle.set_state(StageState::Stopped);
        self.handle.fail_pending();
        if catch_unwind(AssertUnwindSafe(|| self.handler.shutdown(&self.handle))).is_err() {
            error!(stage = %name, "handler panicked during shutdown");
        }
        if let Some(listener) = &self.listener {
            listener.crashed(name, &cause);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
