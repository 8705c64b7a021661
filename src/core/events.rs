use crate::core::error::EngineError;
use crate::core::model::DownloadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub id: DownloadId,
    pub progress: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

impl DownloadProgress {
    pub fn new(id: DownloadId, downloaded_bytes: u64, total_bytes: u64) -> Self {
        let progress = if total_bytes == 0 {
            0
        } else {
            ((downloaded_bytes.min(total_bytes) * 100) / total_bytes) as u8
        };
        Self { id, progress, downloaded_bytes, total_bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Complete,
    Error,
    Progress,
    Paused,
    Cancelled,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Complete(DownloadProgress),
    Error { progress: DownloadProgress, error: EngineError },
    Progress(DownloadProgress),
    Paused(DownloadProgress),
    Cancelled(DownloadProgress),
    Removed(DownloadProgress),
}

impl DownloadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DownloadEvent::Complete(_) => EventKind::Complete,
            DownloadEvent::Error { .. } => EventKind::Error,
            DownloadEvent::Progress(_) => EventKind::Progress,
            DownloadEvent::Paused(_) => EventKind::Paused,
            DownloadEvent::Cancelled(_) => EventKind::Cancelled,
            DownloadEvent::Removed(_) => EventKind::Removed,
        }
    }

    pub fn progress(&self) -> &DownloadProgress {
        match self {
            DownloadEvent::Complete(p)
            | DownloadEvent::Progress(p)
            | DownloadEvent::Paused(p)
            | DownloadEvent::Cancelled(p)
            | DownloadEvent::Removed(p) => p,
            DownloadEvent::Error { progress, .. } => progress,
        }
    }

    pub fn id(&self) -> DownloadId {
        self.progress().id
    }
}
