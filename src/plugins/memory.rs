//! In-memory download engine.
//!
//! Nothing touches the network or the disk. Each request gets a simulated
//! transfer of `file_size` bytes split into `chunks` steps, driven by a task
//! spawned on the worker's runtime. With `chunks == 0` requests simply stay
//! queued, which is what most tests want.
//!
//! Url prefixes pick a scripted behaviour:
//! - `fail:` is rejected at enqueue time.
//! - `flaky:` fails halfway through its first attempt and succeeds on retry.

use crate::core::engine::{EventSink, FetchEngine};
use crate::core::error::EngineError;
use crate::core::events::{DownloadEvent, DownloadProgress};
use crate::core::model::{DownloadId, Request, RequestData, Status, Target};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Progress steps per transfer. `0` disables the simulated transfer.
    pub chunks: u32,
    pub chunk_delay: Duration,
    /// Size reported for every request.
    pub file_size: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            chunks: 0,
            chunk_delay: Duration::from_millis(50),
            file_size: 4 * 1024 * 1024,
        }
    }
}

struct Entry {
    data: RequestData,
    // Bumped on every (re)start so a stale transfer task knows to stop.
    run: u64,
    attempts: u32,
}

type Downloads = Arc<Mutex<BTreeMap<DownloadId, Entry>>>;

pub struct MemoryEngine {
    sink: EventSink,
    settings: MemorySettings,
    downloads: Downloads,
}

impl MemoryEngine {
    pub fn new(sink: EventSink, settings: MemorySettings) -> Self {
        Self {
            sink,
            settings,
            downloads: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn start(&self, entry: &mut Entry) {
        entry.run += 1;
        entry.attempts += 1;
        if self.settings.chunks == 0 {
            entry.data.status = Status::Queued;
            return;
        }
        entry.data.status = Status::Downloading;
        tokio::spawn(transfer(
            entry.data.id(),
            entry.run,
            self.downloads.clone(),
            self.sink.clone(),
            self.settings.clone(),
        ));
    }

    /// Apply `step` to every download `target` selects, then emit the events
    /// it produced. A specific id that is not known is an error; groups and
    /// `All` may match nothing.
    fn apply<F>(&self, action: &str, target: Target, mut step: F) -> Result<(), EngineError>
    where
        F: FnMut(&Self, &mut BTreeMap<DownloadId, Entry>, DownloadId) -> Option<DownloadEvent>,
    {
        let events: Vec<DownloadEvent> = {
            let mut downloads = lock(&self.downloads);
            let ids: Vec<DownloadId> = downloads
                .values()
                .filter(|e| target.matches(&e.data))
                .map(|e| e.data.id())
                .collect();
            if let Target::Id(id) = target {
                if ids.is_empty() {
                    return Err(EngineError::new(format!("download {} not found", id)));
                }
            }
            ids.into_iter()
                .filter_map(|id| step(self, &mut *downloads, id))
                .collect()
        };

        debug!(action, changed = events.len(), "memory engine applied");
        for event in events {
            self.sink.emit(event);
        }
        Ok(())
    }

    fn snapshot(&self, keep: impl Fn(&RequestData) -> bool) -> Vec<RequestData> {
        lock(&self.downloads)
            .values()
            .map(|e| &e.data)
            .filter(|d| keep(d))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FetchEngine for MemoryEngine {
    async fn enqueue(&mut self, request: Request) -> Result<(), EngineError> {
        let id = request.id;
        if request.url.starts_with("fail:") {
            let error = EngineError::new(format!("unsupported url {}", request.url));
            self.sink.emit(DownloadEvent::Error {
                progress: DownloadProgress::new(id, 0, 0),
                error: error.clone(),
            });
            return Err(error);
        }

        let mut downloads = lock(&self.downloads);
        if downloads.contains_key(&id) {
            return Err(EngineError::new(format!("download {} already exists", id)));
        }

        info!(id, url = %request.url, "memory engine queued");
        let mut data = RequestData::new(request);
        data.total_bytes = self.settings.file_size;
        let mut entry = Entry { data, run: 0, attempts: 0 };
        self.start(&mut entry);
        downloads.insert(id, entry);
        Ok(())
    }

    async fn pause(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("pause", target, |_, downloads, id| {
            let entry = downloads.get_mut(&id)?;
            if !matches!(entry.data.status, Status::Queued | Status::Downloading) {
                return None;
            }
            entry.data.status = Status::Paused;
            Some(DownloadEvent::Paused(progress_of(&entry.data)))
        })
    }

    async fn resume(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("resume", target, |engine, downloads, id| {
            let entry = downloads.get_mut(&id)?;
            if entry.data.status != Status::Paused {
                return None;
            }
            engine.start(entry);
            Some(DownloadEvent::Progress(progress_of(&entry.data)))
        })
    }

    async fn retry(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("retry", target, |engine, downloads, id| {
            let entry = downloads.get_mut(&id)?;
            if !matches!(entry.data.status, Status::Failed | Status::Cancelled) {
                return None;
            }
            entry.data.downloaded_bytes = 0;
            entry.data.progress = 0;
            entry.data.error = None;
            engine.start(entry);
            Some(DownloadEvent::Progress(progress_of(&entry.data)))
        })
    }

    async fn cancel(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("cancel", target, |_, downloads, id| {
            let entry = downloads.get_mut(&id)?;
            if entry.data.status.is_terminal() {
                return None;
            }
            entry.data.status = Status::Cancelled;
            Some(DownloadEvent::Cancelled(progress_of(&entry.data)))
        })
    }

    async fn remove(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("remove", target, |_, downloads, id| {
            let mut entry = downloads.remove(&id)?;
            entry.data.status = Status::Removed;
            Some(DownloadEvent::Removed(progress_of(&entry.data)))
        })
    }

    async fn delete(&mut self, target: Target) -> Result<(), EngineError> {
        self.apply("delete", target, |_, downloads, id| {
            let mut entry = downloads.remove(&id)?;
            debug!(id, file = %entry.data.request.file.display(), "memory engine has no file to delete");
            entry.data.status = Status::Removed;
            Some(DownloadEvent::Removed(progress_of(&entry.data)))
        })
    }

    async fn query(&mut self, id: DownloadId) -> Option<RequestData> {
        lock(&self.downloads).get(&id).map(|e| e.data.clone())
    }

    async fn query_many(&mut self, ids: Vec<DownloadId>) -> Vec<RequestData> {
        let downloads = lock(&self.downloads);
        ids.iter()
            .filter_map(|id| downloads.get(id).map(|e| e.data.clone()))
            .collect()
    }

    async fn query_all(&mut self) -> Vec<RequestData> {
        self.snapshot(|_| true)
    }

    async fn query_by_status(&mut self, status: Status) -> Vec<RequestData> {
        self.snapshot(|d| d.status == status)
    }

    async fn query_by_group(&mut self, group_id: String) -> Vec<RequestData> {
        self.snapshot(|d| d.group_id() == Some(group_id.as_str()))
    }

    async fn query_group_by_status(&mut self, group_id: String, status: Status) -> Vec<RequestData> {
        self.snapshot(|d| d.group_id() == Some(group_id.as_str()) && d.status == status)
    }

    async fn contains(&mut self, id: DownloadId) -> bool {
        lock(&self.downloads).contains_key(&id)
    }
}

async fn transfer(id: DownloadId, run: u64, downloads: Downloads, sink: EventSink, settings: MemorySettings) {
    let step = (settings.file_size / u64::from(settings.chunks.max(1))).max(1);
    loop {
        tokio::time::sleep(settings.chunk_delay).await;

        let event = {
            let mut downloads = lock(&downloads);
            let entry = match downloads.get_mut(&id) {
                Some(entry) if entry.run == run && entry.data.status == Status::Downloading => entry,
                _ => return,
            };
            let data = &mut entry.data;
            data.downloaded_bytes = (data.downloaded_bytes + step).min(data.total_bytes);
            data.progress = progress_of(data).progress;

            let halfway = data.downloaded_bytes * 2 >= data.total_bytes;
            if data.request.url.starts_with("flaky:") && entry.attempts == 1 && halfway {
                let error = EngineError::new("connection reset by peer");
                data.status = Status::Failed;
                data.error = Some(error.clone());
                DownloadEvent::Error { progress: progress_of(data), error }
            } else if data.downloaded_bytes >= data.total_bytes {
                data.status = Status::Completed;
                DownloadEvent::Complete(progress_of(data))
            } else {
                DownloadEvent::Progress(progress_of(data))
            }
        };

        let finished = !matches!(event, DownloadEvent::Progress(_));
        sink.emit(event);
        if finished {
            return;
        }
    }
}

fn progress_of(data: &RequestData) -> DownloadProgress {
    DownloadProgress::new(data.id(), data.downloaded_bytes, data.total_bytes)
}

fn lock(downloads: &Downloads) -> MutexGuard<'_, BTreeMap<DownloadId, Entry>> {
    downloads.lock().unwrap_or_else(PoisonError::into_inner)
}
