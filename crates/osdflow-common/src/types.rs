//! Core type definitions for osdflow
//!
//! Identifiers for services (OSDs) and files, and the object numbering
//! used by striped files.

use crate::error::{Error, Result};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Index of a fixed-size chunk ("object") of a striped file
pub type ObjectNo = u64;

/// Identity of a service, usually an OSD holding object replicas
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service ID from its textual form
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random service ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.0)
    }
}

/// Globally unique identifier of a file (`<volume>:<file number>`)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct FileId(String);

impl FileId {
    /// Create a file ID from its textual form
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the ID names a single directory below a data directory
    pub fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        if id.is_empty() || id.contains(['/', '\\', '\0']) || id.contains("..") {
            return Err(Error::invalid_argument(format!("invalid file ID {id:?}")));
        }
        Ok(())
    }

    /// Volume part of the ID, if the ID is of the form `<volume>:<file>`
    #[must_use]
    pub fn volume(&self) -> Option<&str> {
        self.0.split_once(':').map(|(volume, _)| volume)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}
