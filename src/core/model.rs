use crate::core::error::EngineError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type DownloadId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: DownloadId,
    pub url: String,
    pub file: PathBuf,
    pub group_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Request {
    /// The id is derived from url + file, so the same pair always maps to the same download.
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let file = file.into();
        Self {
            id: download_id(&url, &file),
            url,
            file,
            group_id: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: DownloadId) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// First 8 bytes (big-endian) of SHA-256 over `url`, a NUL separator and `file`.
/// Stable across builds and platforms with the same path text.
pub fn download_id(url: &str, file: &Path) -> DownloadId {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(file.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    DownloadId::from_be_bytes(head)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
    Removed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Removed)
    }
}

/// Point-in-time view of a request, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    pub request: Request,
    pub status: Status,
    pub progress: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub error: Option<EngineError>,
}

impl RequestData {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            status: Status::Queued,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            error: None,
        }
    }

    pub fn id(&self) -> DownloadId {
        self.request.id
    }

    pub fn group_id(&self) -> Option<&str> {
        self.request.group_id.as_deref()
    }
}

/// Which requests a control action applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(DownloadId),
    Group(String),
    All,
}

impl Target {
    pub fn matches(&self, data: &RequestData) -> bool {
        match self {
            Target::Id(id) => data.id() == *id,
            Target::Group(group) => data.group_id() == Some(group.as_str()),
            Target::All => true,
        }
    }
}
