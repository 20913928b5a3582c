//! Error types for osdflow
//!
//! This module defines the structured protocol error handed back to
//! clients ([`ErrorResponse`]) and the common error type used by the
//! libraries.

use crate::types::ServiceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Common result type for osdflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a protocol-level error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    InvalidInterfaceId,
    InvalidProcId,
    GarbageArgs,
    AuthFailed,
    InternalServerError,
    Errno,
    Redirect,
    IoError,
    /// The caller's replica locations are outdated
    InvalidView,
}

/// POSIX error number carried by [`ErrorType::Errno`] responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PosixErrno {
    #[default]
    None,
    Eperm,
    Enoent,
    Eintr,
    Eio,
    Eagain,
    Eacces,
    Eexist,
    Exdev,
    Enodev,
    Enotdir,
    Eisdir,
    Einval,
    Enotempty,
    Enodata,
}

/// Structured error returned to a remote caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_type: ErrorType,
    pub posix_errno: PosixErrno,
    pub message: String,
    /// Diagnostic information, e.g. a rendered cause chain
    pub debug_info: Option<String>,
    /// Target of a [`ErrorType::Redirect`]
    pub redirect_to: Option<ServiceId>,
}

impl ErrorResponse {
    /// Create an error response without errno or debug information
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            posix_errno: PosixErrno::None,
            message: message.into(),
            debug_info: None,
            redirect_to: None,
        }
    }

    /// Create an `Errno` response
    pub fn errno(errno: PosixErrno, message: impl Into<String>) -> Self {
        Self {
            posix_errno: errno,
            ..Self::new(ErrorType::Errno, message)
        }
    }

    /// Create an `InternalServerError` response with optional diagnostics
    pub fn internal(message: impl Into<String>, debug_info: Option<String>) -> Self {
        Self {
            posix_errno: PosixErrno::Eio,
            debug_info,
            ..Self::new(ErrorType::InternalServerError, message)
        }
    }

    /// Create an `IoError` response
    pub fn io(message: impl Into<String>) -> Self {
        Self {
            posix_errno: PosixErrno::Eio,
            ..Self::new(ErrorType::IoError, message)
        }
    }

    /// Create an `InvalidView` response for outdated replica locations
    pub fn invalid_view(message: impl Into<String>) -> Self {
        Self::new(ErrorType::InvalidView, message)
    }

    /// Create a redirect to another service
    pub fn redirect(target: ServiceId) -> Self {
        Self {
            redirect_to: Some(target.clone()),
            ..Self::new(ErrorType::Redirect, format!("redirect to {target}"))
        }
    }

    /// Check if the caller may retry the request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.error_type, ErrorType::IoError)
            || matches!(self.posix_errno, PosixErrno::Eagain | PosixErrno::Eintr)
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.error_type)?;
        if self.posix_errno != PosixErrno::None {
            write!(f, "/{:?}", self.posix_errno)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ErrorResponse {}

/// Common error type for osdflow
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote error: {0}")]
    Remote(ErrorResponse),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(ServiceId),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::ServiceUnavailable(_) => true,
            Self::Remote(response) => response.is_retryable(),
            Self::InvalidArgument(_) => false,
        }
    }

    /// Convert into the structured response sent to a remote caller
    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Self::Remote(response) => response.clone(),
            Self::Io(e) => ErrorResponse::io(e.to_string()),
            Self::InvalidArgument(msg) => ErrorResponse::errno(PosixErrno::Einval, msg.clone()),
            Self::ServiceUnavailable(_) => ErrorResponse::errno(PosixErrno::Eagain, self.to_string()),
        }
    }
}

impl From<ErrorResponse> for Error {
    fn from(response: ErrorResponse) -> Self {
        Self::Remote(response)
    }
}
