//! osdflow Stage - staged request processing
//!
//! A [`Stage`] decouples the threads that receive requests from the thread
//! that processes them. Producers only ever enqueue; one dedicated worker
//! per stage drains the queue in FIFO order and dispatches every request to
//! the stage's [`StageHandler`]. Results travel back through the
//! [`Callback`] attached to the request.
//!
//! # Architecture
//!
//! ```text
//!  transport / other stages           stage worker thread
//! ┌────────────────────────┐        ┌──────────────────────────────┐
//! │ StageHandle::enter ────┼──────▶ │ StageQueue::take             │
//! │   (admission, bounded  │        │   └▶ StageHandler::process   │
//! │    queue, rejection)   │        │   └▶ StageHandler::chron_job │
//! └────────────────────────┘        └──────────────┬───────────────┘
//!                                                  │
//!                                   Callback::{success, failed, redirect}
//! ```

pub mod callback;
pub mod component;
pub mod error;
pub mod olp;
pub mod queue;
pub mod request;
pub mod stage;

pub use callback::{
    Callback, Failure, NoopCallback, Outcome, Responder, RpcReply, RpcRequestCallback, callback_fn,
};
pub use component::{AutonomousComponent, LifeCycleListener};
pub use error::StageError;
pub use olp::{Controller, OverloadProtection};
pub use queue::{StageQueue, Take};
pub use request::{RequestTicket, StageMethod, StageRequest};
pub use stage::{Dispatch, HandlerHandle, HandlerRequest, Stage, StageBuilder, StageHandle, StageHandler, StageState};
