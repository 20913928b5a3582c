//! Errors raised by stage lifecycle operations

use thiserror::Error;

/// Error starting or controlling a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {0} has already been started")]
    AlreadyStarted(String),

    #[error("failed to spawn worker thread of stage {stage}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}
