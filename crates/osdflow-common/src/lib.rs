//! osdflow Common - Shared types and utilities
//!
//! This crate provides the identifiers, error taxonomy and configuration
//! structures used by the stage pipeline, the replication strategies and
//! the OSD daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorResponse, ErrorType, PosixErrno, Result};
pub use types::*;
