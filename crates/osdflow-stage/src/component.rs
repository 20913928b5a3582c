//! Component contracts shared by all stages

use crate::request::{RequestTicket, StageMethod, StageRequest};

/// Component that buffers requests and processes them on its own
///
/// Admission happens in `enter`; every admitted request must be released
/// with `exit` exactly once, after its processing finished.
pub trait AutonomousComponent {
    type Method: StageMethod;
    type Request;
    type Response;

    /// Hand a request to the component
    ///
    /// Returns `false` if it was refused; the refused request's callback has
    /// then already been failed.
    fn enter(&self, request: StageRequest<Self::Method, Self::Request, Self::Response>) -> bool;

    /// Release a request that finished processing
    fn exit(&self, ticket: RequestTicket);

    /// Requests entered but not yet exited
    fn num_requests(&self) -> usize;
}

/// Observer of stage lifecycle transitions
pub trait LifeCycleListener: Send + Sync {
    fn started(&self, _stage: &str) {}

    fn shut_down(&self, _stage: &str) {}

    /// The stage stopped because its handler failed unexpectedly
    fn crashed(&self, stage: &str, cause: &anyhow::Error);
}
