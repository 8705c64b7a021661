//! Test doubles shared by the unit tests in `core`.

use crate::config::FetchConfig;
use crate::core::context::{self, ContextHandle, ContextId, ContextLoop};
use crate::core::engine::{EventSink, FetchEngine};
use crate::core::error::EngineError;
use crate::core::events::DownloadProgress;
use crate::core::fetch::{Callback, Fetch};
use crate::core::listeners::FetchListener;
use crate::core::model::{DownloadId, Request, RequestData, Status, Target};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

/// Querying this id makes [`RecordingEngine`] panic.
pub(crate) const PANIC_ID: DownloadId = 666;

const WAIT: Duration = Duration::from_secs(5);

/// Engine that logs every call. Urls starting with `fail:` are rejected and
/// urls starting with `panic:` blow up the call.
pub(crate) struct RecordingEngine {
    calls: Arc<Mutex<Vec<String>>>,
    store: BTreeMap<DownloadId, RequestData>,
}

impl RecordingEngine {
    pub(crate) fn new(calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self { calls, store: BTreeMap::new() }
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn collect(&self, keep: impl Fn(&RequestData) -> bool) -> Vec<RequestData> {
        self.store.values().filter(|d| keep(d)).cloned().collect()
    }
}

#[async_trait]
impl FetchEngine for RecordingEngine {
    async fn enqueue(&mut self, request: Request) -> Result<(), EngineError> {
        self.record(format!("enqueue:{}", request.url));
        if request.url.starts_with("panic:") {
            panic!("engine bug on {}", request.url);
        }
        if request.url.starts_with("fail:") {
            return Err(EngineError::new(format!("rejected {}", request.url)));
        }
        self.store.insert(request.id, RequestData::new(request));
        Ok(())
    }

    async fn pause(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("pause:{:?}", target));
        Ok(())
    }

    async fn resume(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("resume:{:?}", target));
        Ok(())
    }

    async fn retry(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("retry:{:?}", target));
        Ok(())
    }

    async fn cancel(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("cancel:{:?}", target));
        Ok(())
    }

    async fn remove(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("remove:{:?}", target));
        Ok(())
    }

    async fn delete(&mut self, target: Target) -> Result<(), EngineError> {
        self.record(format!("delete:{:?}", target));
        Ok(())
    }

    async fn query(&mut self, id: DownloadId) -> Option<RequestData> {
        self.record(format!("query:{}", id));
        if id == PANIC_ID {
            panic!("engine bug on query {}", id);
        }
        self.store.get(&id).cloned()
    }

    async fn query_many(&mut self, ids: Vec<DownloadId>) -> Vec<RequestData> {
        self.record("query_many".to_string());
        ids.iter().filter_map(|id| self.store.get(id).cloned()).collect()
    }

    async fn query_all(&mut self) -> Vec<RequestData> {
        self.record("query_all".to_string());
        self.collect(|_| true)
    }

    async fn query_by_status(&mut self, status: Status) -> Vec<RequestData> {
        self.record(format!("query_by_status:{:?}", status));
        self.collect(|d| d.status == status)
    }

    async fn query_by_group(&mut self, group_id: String) -> Vec<RequestData> {
        self.record(format!("query_by_group:{}", group_id));
        self.collect(|d| d.group_id() == Some(group_id.as_str()))
    }

    async fn query_group_by_status(&mut self, group_id: String, status: Status) -> Vec<RequestData> {
        self.record(format!("query_group_by_status:{}:{:?}", group_id, status));
        self.collect(|d| d.group_id() == Some(group_id.as_str()) && d.status == status)
    }

    async fn contains(&mut self, id: DownloadId) -> bool {
        self.record(format!("contains:{}", id));
        self.store.contains_key(&id)
    }
}

/// A facade over [`RecordingEngine`] whose main context is pumped by the test.
pub(crate) struct Harness {
    pub fetch: Fetch,
    pub main: ContextHandle,
    pub main_loop: ContextLoop,
    pub sink: EventSink,
    pub journal: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(FetchConfig::default().with_worker_name("fetch-test-worker"))
    }

    pub fn with_config(config: FetchConfig) -> Self {
        let (main, main_loop) = context::channel("test-main");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine_calls = calls.clone();
        let mut captured = None;
        let fetch = Fetch::new(config.with_main_context(main.clone()), |sink| {
            captured = Some(sink);
            RecordingEngine::new(engine_calls)
        })
        .expect("build fetch");
        let sink = captured.expect("factory runs during construction");

        Self {
            fetch,
            main,
            main_loop,
            sink,
            journal: Arc::new(Mutex::new(Vec::new())),
            calls,
        }
    }

    /// Wait for every command submitted so far, then drain the main context.
    pub fn settle(&mut self) -> usize {
        let (tx, rx) = std_mpsc::channel();
        if self
            .fetch
            .submit(move |_| {
                let _ = tx.send(());
                async {}.boxed()
            })
            .is_ok()
        {
            rx.recv_timeout(WAIT).expect("worker stalled");
        }
        self.main_loop.run_pending()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub url: String,
    pub result: Result<(), String>,
    pub context: Option<ContextId>,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingCallback {
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

impl RecordingCallback {
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    fn push(&self, request: &Request, result: Result<(), String>) {
        self.outcomes.lock().unwrap().push(Outcome {
            url: request.url.clone(),
            result,
            context: ContextHandle::current().map(|c| c.id()),
        });
    }
}

impl Callback for RecordingCallback {
    fn on_queued(&self, request: &Request) {
        self.push(request, Ok(()));
    }

    fn on_failure(&self, request: &Request, error: &EngineError) {
        self.push(request, Err(error.message().to_string()));
    }
}

struct Seen {
    kind: &'static str,
    progress: Option<DownloadProgress>,
    context: Option<ContextId>,
}

/// Listener that remembers every call it gets. With a journal, it also
/// appends its name there on each event so tests can check ordering across
/// listeners.
pub(crate) struct RecordingListener {
    name: &'static str,
    seen: Mutex<Vec<Seen>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingListener {
    pub fn new(name: &'static str) -> Self {
        Self { name, seen: Mutex::new(Vec::new()), journal: None }
    }

    pub fn with_journal(name: &'static str, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self { journal: Some(journal), ..Self::new(name) }
    }

    pub fn count(&self, kind: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| s.kind == kind).count()
    }

    pub fn events(&self) -> Vec<(String, DownloadProgress)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.progress.map(|p| (s.kind.to_string(), p)))
            .collect()
    }

    pub fn progress_events(&self) -> Vec<DownloadProgress> {
        self.events()
            .into_iter()
            .filter(|(kind, _)| kind == "progress")
            .map(|(_, p)| p)
            .collect()
    }

    /// Context each event was delivered on.
    pub fn contexts(&self) -> Vec<Option<ContextId>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.progress.is_some())
            .map(|s| s.context)
            .collect()
    }

    fn record(&self, kind: &'static str, progress: Option<&DownloadProgress>) {
        self.seen.lock().unwrap().push(Seen {
            kind,
            progress: progress.copied(),
            context: ContextHandle::current().map(|c| c.id()),
        });
        if let (Some(journal), Some(_)) = (&self.journal, progress) {
            journal.lock().unwrap().push(self.name.to_string());
        }
    }
}

impl FetchListener for RecordingListener {
    fn on_attach(&self, _fetch: &Fetch) {
        self.record("attach", None);
    }

    fn on_detach(&self, _fetch: &Fetch) {
        self.record("detach", None);
    }

    fn on_complete(&self, progress: &DownloadProgress) {
        self.record("complete", Some(progress));
    }

    fn on_error(&self, progress: &DownloadProgress, _error: &EngineError) {
        self.record("error", Some(progress));
    }

    fn on_progress(&self, progress: &DownloadProgress) {
        self.record("progress", Some(progress));
    }

    fn on_paused(&self, progress: &DownloadProgress) {
        self.record("paused", Some(progress));
    }

    fn on_cancelled(&self, progress: &DownloadProgress) {
        self.record("cancelled", Some(progress));
    }

    fn on_removed(&self, progress: &DownloadProgress) {
        self.record("removed", Some(progress));
    }
}
