//! Blocking FIFO queue in front of a stage worker

use crate::callback::Failure;
use crate::request::StageRequest;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of [`StageQueue::take`]
#[derive(Debug)]
pub enum Take<M, R, T> {
    /// The head request, removed from the queue
    Request(StageRequest<M, R, T>),
    /// The timeout elapsed while the queue was empty
    TimedOut,
    /// The queue has been closed; no further requests will arrive
    Closed,
}

struct Inner<M, R, T> {
    requests: VecDeque<StageRequest<M, R, T>>,
    closed: bool,
}

/// Bounded or unbounded FIFO of pending stage requests
///
/// Any number of producers may enqueue; a single consumer takes.
pub struct StageQueue<M, R, T> {
    name: String,
    /// Maximum length; 0 means unbounded
    capacity: usize,
    inner: Mutex<Inner<M, R, T>>,
    available: Condvar,
}

impl<M, R, T> StageQueue<M, R, T> {
    /// Create a queue; `capacity == 0` means unbounded
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                requests: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a request
    ///
    /// Returns `false` if the request was rejected. A rejected request has
    /// already had its callback failed, with [`Failure::CapacityExceeded`]
    /// when the queue is full or [`Failure::ShutDown`] when it is closed.
    pub fn enqueue(&self, request: StageRequest<M, R, T>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            debug!(stage = %self.name, "rejecting request, stage shut down");
            request.failed(Failure::ShutDown {
                stage: self.name.clone(),
            });
            return false;
        }
        if self.capacity > 0 && inner.requests.len() >= self.capacity {
            drop(inner);
            debug!(stage = %self.name, capacity = self.capacity, "rejecting request, queue full");
            request.failed(Failure::CapacityExceeded {
                stage: self.name.clone(),
                capacity: self.capacity,
            });
            return false;
        }

        let was_empty = inner.requests.is_empty();
        inner.requests.push_back(request);
        drop(inner);
        if was_empty {
            self.available.notify_one();
        }
        true
    }

    /// Remove the head request, waiting up to `timeout` (forever if `None`)
    pub fn take(&self, timeout: Option<Duration>) -> Take<M, R, T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Take::Closed;
            }
            if let Some(request) = inner.requests.pop_front() {
                return Take::Request(request);
            }
            match deadline {
                None => self.available.wait(&mut inner),
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        if inner.closed {
                            return Take::Closed;
                        }
                        return inner
                            .requests
                            .pop_front()
                            .map_or(Take::TimedOut, Take::Request);
                    }
                }
            }
        }
    }

    /// Close the queue and return the requests that were never taken
    ///
    /// Later enqueues are rejected and a blocked `take` returns
    /// [`Take::Closed`].
    pub fn close(&self) -> Vec<StageRequest<M, R, T>> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.requests.drain(..).collect()
        };
        self.available.notify_all();
        drained
    }

    /// Number of queued requests
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().requests.is_empty()
    }

    /// Configured capacity, 0 if unbounded
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
