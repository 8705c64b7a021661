use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use orange_fetch::{
    channel, initialize, instance, logging, Callback, DownloadId, DownloadProgress, EngineError, Fetch,
    FetchConfig, FetchListener, MemoryEngine, MemorySettings, Request, RequestData,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

fn build_cli() -> Command {
    let demo = Command::new("demo")
        .about("Drive simulated downloads through the fetch facade")
        .arg(
            Arg::new("downloads")
                .long("downloads")
                .help("Number of downloads to enqueue")
                .default_value("4")
                .num_args(1),
        )
        .arg(
            Arg::new("chunks")
                .long("chunks")
                .help("Progress steps per download (at least 1)")
                .default_value("20")
                .num_args(1),
        )
        .arg(
            Arg::new("chunk_delay_ms")
                .long("chunk-delay-ms")
                .help("Delay between progress steps")
                .default_value("80")
                .num_args(1),
        )
        .arg(
            Arg::new("fail")
                .long("fail")
                .help("Extra url the engine will reject")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("flaky")
                .long("flaky")
                .help("Extra url that fails halfway once, then is retried")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("queue_capacity")
                .long("queue-capacity")
                .help("Bound the command queue (unbounded by default)")
                .num_args(1),
        );

    Command::new("orange-fetch")
        .about("Asynchronous download-manager facade (demo over an in-memory engine)")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity")
                .action(ArgAction::Count)
                .global(true),
        )
        .subcommand(demo)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("demo", m)) => run_demo(m).await,
        _ => Ok(()),
    }
}

async fn run_demo(m: &ArgMatches) -> anyhow::Result<()> {
    logging::init(m.get_count("verbose"));

    let downloads: usize = arg(m, "downloads")?;
    let chunks: u32 = arg(m, "chunks")?;
    let chunk_delay_ms: u64 = arg(m, "chunk_delay_ms")?;
    let settings = demo_settings(chunks, chunk_delay_ms)?;

    let mut requests: Vec<Request> = (1..=downloads)
        .map(|i| {
            Request::new(
                format!("https://example.com/file-{i}.bin"),
                format!("downloads/file-{i}.bin"),
            )
            .with_group("demo")
        })
        .collect();
    for url in values(m, "flaky") {
        requests.push(Request::new(prefixed("flaky:", url), "downloads/flaky.bin"));
    }
    for url in values(m, "fail") {
        requests.push(Request::new(prefixed("fail:", url), "downloads/rejected.bin"));
    }
    if requests.is_empty() {
        println!("Nothing to download");
        return Ok(());
    }

    // The tokio main thread doubles as the UI context.
    let (ui, mut ui_loop) = channel("ui");
    let _on_ui = ui.enter();

    let mut config = FetchConfig::default().with_main_context(ui.clone());
    if m.contains_id("queue_capacity") {
        config = config.with_queue_capacity(arg(m, "queue_capacity")?);
    }
    let fetch = initialize(config, |sink| MemoryEngine::new(sink, settings))?;

    let board = Arc::new(Board::new(requests.len())?);
    fetch.add_listener(&board);
    fetch.enqueue_all_with_callback(requests, Enqueued(board.clone()))?;

    tokio::select! {
        _ = ui_loop.run() => {}
        _ = board.done.notified() => {}
    }

    let (tx, rx) = oneshot::channel();
    fetch.query_all(move |all| {
        let _ = tx.send(all.unwrap_or_default());
    })?;
    let summary: Vec<RequestData> = tokio::select! {
        _ = ui_loop.run() => Vec::new(),
        all = rx => all.unwrap_or_default(),
    };

    let _ = board.mp.println("");
    let _ = board.mp.println("Summary:");
    for data in &summary {
        let _ = board.mp.println(format!(
            "- id={} status={:?} {} / {} url={}",
            data.id(),
            data.status,
            fmt_bytes(data.downloaded_bytes),
            fmt_bytes(data.total_bytes),
            data.request.url,
        ));
        if let Some(e) = &data.error {
            let _ = board.mp.println(format!("  error: {}", e));
        }
    }

    fetch.remove_listener(&board);
    if let Some(worker) = fetch.shutdown() {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("fetch worker panicked"))?;
    }
    Ok(())
}

#[derive(Default)]
struct BoardState {
    bars: HashMap<DownloadId, ProgressBar>,
    open: HashSet<DownloadId>,
    retried: HashSet<DownloadId>,
    answered: usize,
}

/// One bar per accepted request. Signals `done` once every request got its
/// enqueue outcome and every accepted one reached an end state.
struct Board {
    mp: MultiProgress,
    style: ProgressStyle,
    expected: usize,
    state: Mutex<BoardState>,
    done: Notify,
}

impl Board {
    fn new(expected: usize) -> anyhow::Result<Self> {
        let style = ProgressStyle::with_template(
            "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
        )?;
        Ok(Self {
            mp: MultiProgress::new(),
            style,
            expected,
            state: Mutex::new(BoardState::default()),
            done: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, state: &mut BoardState, id: DownloadId, message: &str) {
        if let Some(pb) = state.bars.get(&id) {
            pb.finish_with_message(message.to_string());
        }
        state.open.remove(&id);
        self.check_done(state);
    }

    fn check_done(&self, state: &BoardState) {
        if state.answered == self.expected && state.open.is_empty() {
            self.done.notify_one();
        }
    }

    fn update(&self, progress: &DownloadProgress, message: &str) {
        if let Some(pb) = self.lock().bars.get(&progress.id) {
            pb.set_length(progress.total_bytes);
            pb.set_position(progress.downloaded_bytes);
            pb.set_message(message.to_string());
        }
    }
}

impl FetchListener for Board {
    fn on_attach(&self, fetch: &Fetch) {
        let _ = self
            .mp
            .println(format!("[INFO] watching {} listener(s)", fetch.listener_count()));
    }

    fn on_progress(&self, progress: &DownloadProgress) {
        self.update(progress, &format!("{}%", progress.progress));
    }

    fn on_complete(&self, progress: &DownloadProgress) {
        self.update(progress, "done");
        let mut state = self.lock();
        self.finish(&mut state, progress.id, "done");
    }

    fn on_paused(&self, progress: &DownloadProgress) {
        self.update(progress, "paused");
    }

    fn on_cancelled(&self, progress: &DownloadProgress) {
        let mut state = self.lock();
        self.finish(&mut state, progress.id, "cancelled");
    }

    fn on_removed(&self, progress: &DownloadProgress) {
        let mut state = self.lock();
        self.finish(&mut state, progress.id, "removed");
    }

    fn on_error(&self, progress: &DownloadProgress, error: &EngineError) {
        let mut state = self.lock();
        if !state.open.contains(&progress.id) {
            return;
        }
        let _ = self.mp.println(format!("[ERR] {}: {}", progress.id, error));
        if state.retried.insert(progress.id) {
            let retried = instance().and_then(|fetch| fetch.retry(progress.id));
            if retried.is_ok() {
                if let Some(pb) = state.bars.get(&progress.id) {
                    pb.set_message("retrying".to_string());
                }
                return;
            }
        }
        self.finish(&mut state, progress.id, "failed");
    }
}

struct Enqueued(Arc<Board>);

impl Callback for Enqueued {
    fn on_queued(&self, request: &Request) {
        let board = &self.0;
        let pb = board.mp.add(ProgressBar::new(0));
        pb.set_style(board.style.clone());
        pb.set_prefix(format!("[{}]", request.file.display()));
        pb.set_message("queued".to_string());

        let mut state = board.lock();
        state.bars.insert(request.id, pb);
        state.open.insert(request.id);
        state.answered += 1;
        board.check_done(&state);
    }

    fn on_failure(&self, request: &Request, error: &EngineError) {
        let board = &self.0;
        let _ = board.mp.println(format!("[REJECTED] {}: {}", request.url, error));
        let mut state = board.lock();
        state.answered += 1;
        board.check_done(&state);
    }
}

/// The demo waits for every download to end, so it needs real transfers.
fn demo_settings(chunks: u32, chunk_delay_ms: u64) -> anyhow::Result<MemorySettings> {
    if chunks == 0 {
        anyhow::bail!("--chunks must be at least 1");
    }
    Ok(MemorySettings {
        chunks,
        chunk_delay: Duration::from_millis(chunk_delay_ms),
        ..MemorySettings::default()
    })
}

fn arg<T>(m: &ArgMatches, name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = m
        .get_one::<String>(name)
        .with_context(|| format!("missing --{}", name))?;
    raw.parse()
        .with_context(|| format!("invalid value for --{}: {}", name, raw))
}

fn values<'a>(m: &'a ArgMatches, name: &str) -> impl Iterator<Item = &'a String> + 'a {
    m.get_many::<String>(name).into_iter().flatten()
}

fn prefixed(prefix: &str, url: &str) -> String {
    if url.starts_with(prefix) {
        url.to_string()
    } else {
        format!("{}{}", prefix, url)
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let f = n as f64;
    if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
