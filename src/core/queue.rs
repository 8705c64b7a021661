//! Single-worker command queue.
//!
//! Commands run one at a time, in submission order, on a dedicated thread
//! that owns the worker state `S`. Nothing else ever touches `S`, so the
//! state needs no locking of its own. There is no per-command timeout: a
//! slow command holds up everything queued behind it.

use crate::core::error::{panic_message, FetchError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};

pub type Command<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

enum Outbox<S> {
    Unbounded(mpsc::UnboundedSender<Command<S>>),
    Bounded { tx: mpsc::Sender<Command<S>>, capacity: usize },
}

impl<S> Outbox<S> {
    fn send(&self, command: Command<S>) -> Result<(), FetchError> {
        match self {
            Outbox::Unbounded(tx) => tx.send(command).map_err(|_| FetchError::Shutdown),
            Outbox::Bounded { tx, capacity } => tx.try_send(command).map_err(|e| match e {
                TrySendError::Full(_) => FetchError::QueueFull { capacity: *capacity },
                TrySendError::Closed(_) => FetchError::Shutdown,
            }),
        }
    }
}

enum Inbox<S> {
    Unbounded(mpsc::UnboundedReceiver<Command<S>>),
    Bounded(mpsc::Receiver<Command<S>>),
}

impl<S> Inbox<S> {
    async fn recv(&mut self) -> Option<Command<S>> {
        match self {
            Inbox::Unbounded(rx) => rx.recv().await,
            Inbox::Bounded(rx) => rx.recv().await,
        }
    }
}

enum Worker<S> {
    Idle { state: S, inbox: Inbox<S> },
    Running(JoinHandle<()>),
    Stopped,
}

struct Shared<S> {
    outbox: Option<Outbox<S>>,
    worker: Worker<S>,
}

pub struct CommandQueue<S> {
    name: String,
    shared: Mutex<Shared<S>>,
}

impl<S: Send + 'static> CommandQueue<S> {
    /// `capacity` of `None` means unbounded.
    pub fn new(name: impl Into<String>, state: S, capacity: Option<usize>) -> Self {
        let (outbox, inbox) = match capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Outbox::Unbounded(tx), Inbox::Unbounded(rx))
            }
            Some(capacity) => {
                let capacity = capacity.max(1);
                let (tx, rx) = mpsc::channel(capacity);
                (Outbox::Bounded { tx, capacity }, Inbox::Bounded(rx))
            }
        };

        Self {
            name: name.into(),
            shared: Mutex::new(Shared {
                outbox: Some(outbox),
                worker: Worker::Idle { state, inbox },
            }),
        }
    }

    /// Queue `command` and return immediately. Starts the worker on first use.
    pub fn submit<F>(&self, command: F) -> Result<(), FetchError>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
    {
        let mut shared = self.lock();
        shared
            .outbox
            .as_ref()
            .ok_or(FetchError::Shutdown)?
            .send(Box::new(command))?;

        if matches!(shared.worker, Worker::Idle { .. }) {
            self.start(&mut shared)?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().worker, Worker::Running(_))
    }

    /// Stop accepting commands. Commands already accepted still run; the
    /// returned handle joins the worker once it has drained them.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        let mut shared = self.lock();
        shared.outbox = None;
        match std::mem::replace(&mut shared.worker, Worker::Stopped) {
            Worker::Running(handle) => {
                info!(worker = %self.name, "worker shutting down");
                Some(handle)
            }
            Worker::Idle { .. } | Worker::Stopped => None,
        }
    }

    fn start(&self, shared: &mut Shared<S>) -> Result<(), FetchError> {
        let (state, inbox) = match std::mem::replace(&mut shared.worker, Worker::Stopped) {
            Worker::Idle { state, inbox } => (state, inbox),
            other => {
                shared.worker = other;
                return Ok(());
            }
        };

        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(name, state, inbox));

        match spawned {
            Ok(handle) => {
                debug!(worker = %self.name, "worker thread spawned");
                shared.worker = Worker::Running(handle);
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.name, error = %e, "failed to spawn worker");
                shared.outbox = None;
                Err(FetchError::WorkerSpawn(e.to_string()))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<S>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_worker<S>(name: String, mut state: S, mut inbox: Inbox<S>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = %name, error = %e, "failed to build worker runtime");
            return;
        }
    };

    runtime.block_on(async {
        info!(worker = %name, "worker started");
        let mut executed: u64 = 0;
        while let Some(command) = inbox.recv().await {
            let outcome = AssertUnwindSafe(async { command(&mut state).await })
                .catch_unwind()
                .await;
            executed += 1;
            if let Err(payload) = outcome {
                error!(worker = %name, panic = %panic_message(&*payload), "command panicked");
            }
        }
        info!(worker = %name, executed, "worker stopped");
    });
}
