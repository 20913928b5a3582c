//! Object transfer collaborators of the replication stage
//!
//! The stage never performs I/O itself. Fetches from remote OSDs are
//! started through [`ReplicationBackend::fetch_object`] and complete on a
//! backend thread; local writes are handed off the same way and report
//! their result through a [`StoreDone`].
//!
//! [`FsPeerBackend`] serves peers from local directories. Every object is
//! stored as `<dir>/<file id>/<object no>.obj`: a big-endian CRC32C of the
//! data followed by the data. Holes are marked by an empty
//! `<object no>.hole` file. File IDs that do not name a single directory
//! are rejected.

use bytes::{BufMut, Bytes, BytesMut};
use osdflow_common::config::Config;
use osdflow_common::{Error, ErrorResponse, ErrorType, FileId, ObjectNo, Result, ServiceId};
use osdflow_replication::ObjectSet;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;
use tracing::debug;

const CHECKSUM_LEN: usize = 4;
const OBJECT_EXT: &str = "obj";
const HOLE_EXT: &str = "hole";

/// Read of one object from a remote OSD
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub file_id: FileId,
    pub object_no: ObjectNo,
    pub osd: ServiceId,
    pub stripe_size: u64,
    /// Ask the OSD for its object set of the file
    pub attach_object_set: bool,
}

/// Result of a [`FetchRequest`]
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    /// The OSD returned the object
    Fetched {
        data: Bytes,
        /// The OSD found a checksum mismatch while reading the object
        invalid_checksum: bool,
        object_set: Option<ObjectSet>,
    },
    /// The OSD does not have the object
    NotFound { object_set: Option<ObjectSet> },
    /// The OSD could not be reached or failed to read
    Error(ErrorResponse),
    /// The OSD refused the request because the replica locations sent
    /// with it are outdated
    ViewError(ErrorResponse),
}

impl FetchOutcome {
    /// Outcome of a fetch the OSD answered with `error`
    pub fn failed(error: ErrorResponse) -> Self {
        if error.error_type == ErrorType::InvalidView {
            Self::ViewError(error)
        } else {
            Self::Error(error)
        }
    }

    pub fn object_set(&self) -> Option<&ObjectSet> {
        match self {
            Self::Fetched { object_set, .. } | Self::NotFound { object_set } => object_set.as_ref(),
            Self::Error(_) | Self::ViewError(_) => None,
        }
    }
}

/// Called exactly once with the outcome of a fetch, from any thread
pub type FetchDone = Box<dyn FnOnce(FetchOutcome) + Send>;

/// Called exactly once with the result of a local write, from any thread
pub type StoreDone = Box<dyn FnOnce(Result<()>) + Send>;

/// Object transfer and local storage used by the replication stage
///
/// Implementations must not block: all methods are called on the stage's
/// worker thread.
pub trait ReplicationBackend: Send + Sync {
    /// Start fetching an object from a remote OSD
    ///
    /// An `Err` means the request could not be sent; `done` is not called
    /// then.
    fn fetch_object(&self, request: FetchRequest, done: FetchDone) -> Result<()>;

    /// Store a replicated object locally
    fn store_object(&self, file_id: &FileId, object_no: ObjectNo, data: Bytes, done: StoreDone);

    /// Record locally that an object is a hole
    fn mark_hole(&self, file_id: &FileId, object_no: ObjectNo, done: StoreDone);
}

/// Directory of a file's objects below `dir`
fn file_dir(dir: &Path, file_id: &FileId) -> Result<PathBuf> {
    file_id.validate()?;
    Ok(dir.join(file_id.as_str()))
}

/// Path of an object's data file below `dir`
pub fn object_path(dir: &Path, file_id: &FileId, object_no: ObjectNo) -> Result<PathBuf> {
    Ok(file_dir(dir, file_id)?.join(format!("{object_no}.{OBJECT_EXT}")))
}

fn hole_path(dir: &Path, file_id: &FileId, object_no: ObjectNo) -> Result<PathBuf> {
    Ok(file_dir(dir, file_id)?.join(format!("{object_no}.{HOLE_EXT}")))
}

/// Write an object with its checksum below `dir`
pub fn write_object(dir: &Path, file_id: &FileId, object_no: ObjectNo, data: &[u8]) -> Result<()> {
    let path = object_path(dir, file_id, object_no)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = BytesMut::with_capacity(CHECKSUM_LEN + data.len());
    buf.put_u32(crc32c::crc32c(data));
    buf.put_slice(data);
    fs::write(path, buf)?;
    Ok(())
}

/// Mark an object as a hole below `dir`
pub fn write_hole(dir: &Path, file_id: &FileId, object_no: ObjectNo) -> Result<()> {
    let path = hole_path(dir, file_id, object_no)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")?;
    Ok(())
}

/// Objects of `file_id` stored below `dir`
pub fn list_objects(dir: &Path, file_id: &FileId) -> Result<ObjectSet> {
    let entries = match fs::read_dir(file_dir(dir, file_id)?) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ObjectSet::new()),
        Err(e) => return Err(e.into()),
    };
    let mut set = ObjectSet::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(OBJECT_EXT) {
            continue;
        }
        if let Some(object_no) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok())
        {
            set.add(object_no);
        }
    }
    Ok(set)
}

/// Serve a fetch from an OSD data directory
fn read_object(dir: &Path, request: &FetchRequest) -> FetchOutcome {
    if !dir.is_dir() {
        return FetchOutcome::failed(ErrorResponse::io(format!(
            "data directory of {} is not available",
            request.osd
        )));
    }

    let object_set = if request.attach_object_set {
        match list_objects(dir, &request.file_id) {
            Ok(set) => Some(set),
            Err(e) => return FetchOutcome::failed(e.to_error_response()),
        }
    } else {
        None
    };

    let path = match object_path(dir, &request.file_id, request.object_no) {
        Ok(path) => path,
        Err(e) => return FetchOutcome::failed(e.to_error_response()),
    };
    match fs::read(path) {
        Ok(raw) => {
            let mut raw = Bytes::from(raw);
            if raw.len() < CHECKSUM_LEN {
                return FetchOutcome::Fetched {
                    data: Bytes::new(),
                    invalid_checksum: true,
                    object_set,
                };
            }
            let data = raw.split_off(CHECKSUM_LEN);
            let stored = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            FetchOutcome::Fetched {
                invalid_checksum: crc32c::crc32c(&data) != stored,
                data,
                object_set,
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => FetchOutcome::NotFound { object_set },
        Err(e) => FetchOutcome::failed(ErrorResponse::io(e.to_string())),
    }
}

/// Backend serving peer OSDs from local data directories
///
/// Fetches and writes run on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct FsPeerBackend {
    runtime: Handle,
    local_dir: PathBuf,
    peers: HashMap<ServiceId, PathBuf>,
}

impl FsPeerBackend {
    pub fn new(runtime: Handle, local_dir: PathBuf, peers: HashMap<ServiceId, PathBuf>) -> Self {
        Self {
            runtime,
            local_dir,
            peers,
        }
    }

    /// Backend for the data directory and peers of `config`
    pub fn from_config(runtime: Handle, config: &Config) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|(id, dir)| (ServiceId::new(id.as_str()), dir.clone()))
            .collect();
        Self::new(runtime, config.osd.data_dir.clone(), peers)
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }
}

impl ReplicationBackend for FsPeerBackend {
    fn fetch_object(&self, request: FetchRequest, done: FetchDone) -> Result<()> {
        let Some(dir) = self.peers.get(&request.osd).cloned() else {
            return Err(Error::ServiceUnavailable(request.osd));
        };
        debug!(
            file_id = %request.file_id,
            object_no = request.object_no,
            osd = %request.osd,
            attach_object_set = request.attach_object_set,
            "fetching object"
        );
        self.runtime.spawn_blocking(move || done(read_object(&dir, &request)));
        Ok(())
    }

    fn store_object(&self, file_id: &FileId, object_no: ObjectNo, data: Bytes, done: StoreDone) {
        let dir = self.local_dir.clone();
        let file_id = file_id.clone();
        self.runtime
            .spawn_blocking(move || done(write_object(&dir, &file_id, object_no, &data)));
    }

    fn mark_hole(&self, file_id: &FileId, object_no: ObjectNo, done: StoreDone) {
        let dir = self.local_dir.clone();
        let file_id = file_id.clone();
        self.runtime
            .spawn_blocking(move || done(write_hole(&dir, &file_id, object_no)));
    }
}
