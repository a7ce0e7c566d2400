use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use flagplane_core::{
    config::{self, DaemonConfig, SourceConfig},
    resolve::resolve_from,
    FlagStore, MemoryStore, NotificationType, SubscriptionId, VariantKind,
};
use flagplane_sync::{Multiplexer, Payload};

use crate::error::{io_err, DaemonError};
use crate::paths::{debounce_window, flagplane_root, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::source::{FileSource, LoadReport};

/// Per-source last-successful-reload timestamps (Unix seconds), keyed by source id.
pub type ReloadTimestamps = HashMap<String, u64>;

/// How often pending watcher events are checked against the debounce window.
const DEBOUNCE_TICK: Duration = Duration::from_millis(50);

struct ReloadJob {
    source: String,
    trigger: &'static str,
    respond_to: oneshot::Sender<Result<ReloadSummary, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub source: String,
    pub trigger: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: bool,
    pub missing: bool,
    pub published: bool,
    pub duration_ms: u128,
}

/// Everything a socket client needs, cloned per connection.
#[derive(Clone)]
struct DaemonContext {
    home: PathBuf,
    store: Arc<dyn FlagStore>,
    mux: Arc<Multiplexer>,
    sources: Arc<Vec<SourceConfig>>,
    timestamps: Arc<RwLock<ReloadTimestamps>>,
    reload_tx: mpsc::Sender<ReloadJob>,
    shutdown_tx: broadcast::Sender<()>,
    subscriber_buffer: usize,
    started_at_unix: u64,
    next_watch_id: Arc<AtomicU64>,
}

/// Load config from `home`, append `extra_sources`, and block the current
/// thread on the daemon runtime until it exits.
pub fn start_blocking(home: &Path, extra_sources: Vec<PathBuf>) -> Result<(), DaemonError> {
    init_tracing();
    let config = config::load_at(home)?.with_extra_sources(extra_sources);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf, config: DaemonConfig) -> Result<(), DaemonError> {
    config.validate()?;
    ensure_runtime_dirs(&home)?;

    let store: Arc<dyn FlagStore> = Arc::new(MemoryStore::new(config.source_ids()));
    let mux = Arc::new(Multiplexer::new(store.clone())?);
    let timestamps: Arc<RwLock<ReloadTimestamps>> = Arc::new(RwLock::new(HashMap::new()));

    let mut sources = HashMap::new();
    for source_config in &config.sources {
        let mut source = FileSource::new(source_config);
        match source.load(store.as_ref()) {
            Ok(report) => {
                tracing::info!(
                    source = %source.id(),
                    selector = %source.selector(),
                    path = %source.path().display(),
                    flags = report.count(NotificationType::Create),
                    missing = report.missing,
                    "initial source load",
                );
                timestamps
                    .write()
                    .await
                    .insert(source.id().to_string(), unix_seconds_now());
            }
            Err(err) => tracing::warn!(source = %source.id(), error = %err, "initial source load failed"),
        }
        sources.insert(source.id().to_string(), source);
    }
    mux.publish()?;

    let watch_targets = watch_targets(&config.sources);
    let (reload_tx, reload_rx) = mpsc::channel::<ReloadJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let ctx = DaemonContext {
        home: home.clone(),
        store: store.clone(),
        mux: mux.clone(),
        sources: Arc::new(config.sources.clone()),
        timestamps: timestamps.clone(),
        reload_tx: reload_tx.clone(),
        shutdown_tx: shutdown_tx.clone(),
        subscriber_buffer: config.subscriber_buffer.max(1),
        started_at_unix: unix_seconds_now(),
        next_watch_id: Arc::new(AtomicU64::new(1)),
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let reload_tx = reload_tx.clone();
        let window = debounce_window(config.debounce_ms);
        tokio::spawn(async move {
            let result = watcher_task(watch_targets, reload_tx, window, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result =
                reload_processor_task(sources, store, mux, timestamps, reload_rx, shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(ctx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    drop(ctx);
    drop(reload_tx);

    let (watcher_result, processor_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, processor_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("reload_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Canonical source file path -> source id.
fn watch_targets(sources: &[SourceConfig]) -> HashMap<PathBuf, String> {
    let mut targets = HashMap::new();
    for source in sources {
        match canonical_file_path(&source.uri) {
            Some(path) => {
                targets.insert(path, source.id());
            }
            None => tracing::warn!(
                source = %source.id(),
                "source directory does not exist; changes will not be watched",
            ),
        }
    }
    targets
}

async fn watcher_task(
    targets: HashMap<PathBuf, String>,
    reload_tx: mpsc::Sender<ReloadJob>,
    window: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    // Watch parent directories so that files created, replaced or removed
    // after startup are still observed.
    let mut watched_dirs = HashSet::new();
    for path in targets.keys() {
        if let Some(dir) = path.parent() {
            if watched_dirs.insert(dir.to_path_buf()) {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
                tracing::debug!(path = %dir.display(), "watching source directory");
            }
        }
    }

    let mut debouncer = Debouncer::new(window);
    let mut tick = tokio::time::interval(DEBOUNCE_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    let Some(path) = canonical_file_path(&path) else { continue };
                    if targets.contains_key(&path) {
                        debouncer.record(path, Instant::now());
                    }
                }
            }
            _ = tick.tick() => {
                for path in debouncer.due(Instant::now()) {
                    let Some(source) = targets.get(&path) else { continue };
                    match enqueue_reload(&reload_tx, source.clone(), "watcher").await {
                        Ok(summary) => tracing::info!(
                            source = %summary.source,
                            created = summary.created,
                            updated = summary.updated,
                            deleted = summary.deleted,
                            published = summary.published,
                            duration_ms = summary.duration_ms,
                            "watcher-triggered reload completed",
                        ),
                        Err(err) => tracing::error!(source = %source, error = %err, "watcher-triggered reload failed"),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Trailing-edge debounce: a path becomes due once no event for it has
/// arrived for a full window.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn record(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due.sort();
        due
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Canonical form of a file path that may not exist (yet or any more):
/// the canonical parent directory joined with the file name.
fn canonical_file_path(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = fs::canonicalize(path) {
        return Some(canonical);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::canonicalize(parent).ok().map(|dir| dir.join(name))
}

// ---------------------------------------------------------------------------
// Reload processor
// ---------------------------------------------------------------------------

async fn reload_processor_task(
    mut sources: HashMap<String, FileSource>,
    store: Arc<dyn FlagStore>,
    mux: Arc<Multiplexer>,
    timestamps: Arc<RwLock<ReloadTimestamps>>,
    mut reload_rx: mpsc::Receiver<ReloadJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = reload_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let started = Instant::now();

                let Some(mut source) = sources.remove(&job.source) else {
                    let _ = job.respond_to.send(Err(format!("unknown source '{}'", job.source)));
                    continue;
                };

                let store = store.clone();
                let mux = mux.clone();
                let (source, result) = tokio::task::spawn_blocking(move || {
                    let result = reload_source(&mut source, store.as_ref(), &mux);
                    (source, result)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("reload task join error: {err}")))?;
                sources.insert(source.id().to_string(), source);

                let outcome = match result {
                    Ok((report, published)) => {
                        timestamps
                            .write()
                            .await
                            .insert(job.source.clone(), unix_seconds_now());
                        Ok(build_reload_summary(
                            job.source,
                            job.trigger,
                            &report,
                            published,
                            started.elapsed(),
                        ))
                    }
                    Err(err) => Err(err.to_string()),
                };

                let _ = job.respond_to.send(outcome);
            }
        }
    }

    Ok(())
}

/// Load one source and publish when the store actually changed.
fn reload_source(
    source: &mut FileSource,
    store: &dyn FlagStore,
    mux: &Multiplexer,
) -> Result<(LoadReport, bool), DaemonError> {
    let report = source.load(store)?;
    if !report.changed() {
        return Ok((report, false));
    }
    if report.outcome.resync_required {
        tracing::info!(
            source = %source.id(),
            selector = %source.selector(),
            path = %source.path().display(),
            "flags removed from source; full resync published",
        );
    }
    mux.publish()?;
    Ok((report, true))
}

fn build_reload_summary(
    source: String,
    trigger: &'static str,
    report: &LoadReport,
    published: bool,
    duration: Duration,
) -> ReloadSummary {
    ReloadSummary {
        source,
        trigger: trigger.to_string(),
        created: report.count(NotificationType::Create),
        updated: report.count(NotificationType::Update),
        deleted: report.count(NotificationType::Delete),
        unchanged: report.unchanged,
        missing: report.missing,
        published,
        duration_ms: duration.as_millis(),
    }
}

async fn enqueue_reload(
    reload_tx: &mpsc::Sender<ReloadJob>,
    source: String,
    trigger: &'static str,
) -> Result<ReloadSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    reload_tx
        .send(ReloadJob {
            source,
            trigger,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("reload queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("reload response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    ctx: DaemonContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&ctx.home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, ctx: DaemonContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<DaemonRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        if request.cmd == "watch" {
            let selector = request.selector.unwrap_or_default();
            return handle_watch(&ctx, selector, &mut lines, &mut writer).await;
        }

        let stop = request.cmd == "stop";
        let response = dispatch(&ctx, request).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Answer every single-response command.
async fn dispatch(ctx: &DaemonContext, request: DaemonRequest) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(ctx).await),
        "stop" => {
            let _ = ctx.shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        "resolve" => {
            let Some(flag) = request.flag else {
                return DaemonResponse::error("resolve requires a 'flag' field");
            };
            let expected = match request
                .kind
                .as_deref()
                .map(str::parse::<VariantKind>)
                .transpose()
            {
                Ok(expected) => expected,
                Err(err) => return DaemonResponse::error(err),
            };
            match resolve_from(ctx.store.as_ref(), &flag, request.flag_set.as_deref(), expected) {
                Ok(resolution) => DaemonResponse::ok(json!(resolution)),
                Err(err) => DaemonResponse::error(format!("{}: {err}", err.code())),
            }
        }
        "flags" => {
            let source = request.source.unwrap_or_default();
            match ctx.mux.get_all_flags(&source) {
                Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(snapshot) => DaemonResponse::ok(snapshot),
                    Err(err) => DaemonResponse::error(format!("corrupt snapshot: {err}")),
                },
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "reload" => {
            let targets: Vec<String> = match request.source {
                Some(source) => vec![source],
                None => ctx.sources.iter().map(SourceConfig::id).collect(),
            };
            let mut summaries = Vec::with_capacity(targets.len());
            for source in targets {
                match enqueue_reload(&ctx.reload_tx, source, "socket").await {
                    Ok(summary) => summaries.push(summary),
                    Err(err) => return DaemonResponse::error(err.to_string()),
                }
            }
            DaemonResponse::ok(json!(summaries))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

/// Register a subscriber and stream one line per snapshot until the client
/// disconnects or the daemon shuts down.
async fn handle_watch(
    ctx: &DaemonContext,
    selector: String,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), DaemonError> {
    let id = SubscriptionId(format!(
        "watch-{}",
        ctx.next_watch_id.fetch_add(1, Ordering::Relaxed)
    ));
    let (tx, mut rx) = mpsc::channel::<Payload>(ctx.subscriber_buffer);
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();

    let initial = match ctx.mux.register(id.clone(), &selector, tx) {
        Ok(initial) => initial,
        Err(err) => return write_response(writer, &DaemonResponse::error(err.to_string())).await,
    };
    tracing::info!(subscriber = %id, selector = %selector, "watch stream opened");

    if write_response(writer, &snapshot_response(&initial)).await.is_ok() {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    if write_response(writer, &snapshot_response(&payload)).await.is_err() {
                        break;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }
    }

    ctx.mux.unregister(&id, &selector);
    tracing::info!(subscriber = %id, "watch stream closed");
    Ok(())
}

fn snapshot_response(payload: &Payload) -> DaemonResponse {
    match serde_json::from_str::<Value>(&payload.flags) {
        Ok(snapshot) => DaemonResponse::ok(snapshot),
        Err(err) => DaemonResponse::error(format!("corrupt snapshot: {err}")),
    }
}

async fn build_status_payload(ctx: &DaemonContext) -> Value {
    // Snapshot timestamps (read lock, dropped before JSON assembly).
    let ts_snapshot: ReloadTimestamps = ctx.timestamps.read().await.clone();

    let sources: Vec<Value> = ctx
        .sources
        .iter()
        .map(|source| {
            let id = source.id();
            json!({
                "last_reload_at_unix": ts_snapshot.get(&id).copied().unwrap_or(0),
                "id": id,
                "selector": source.selector(),
            })
        })
        .collect();

    let last_reload_at_unix = ts_snapshot.values().copied().max().unwrap_or(0);

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": ctx.started_at_unix,
        "last_reload_at_unix": last_reload_at_unix,
        "sources": sources,
        "sources_metadata": ctx.mux.sources_as_metadata(),
        "subscribers": ctx.mux.subscriber_count(),
        "socket": socket_path(&ctx.home).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [flagplane_root(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` filters (default `info`); `FLAGPLANE_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLAGPLANE_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::advance;

    const FLAGS: &str = r##"{
      "metadata": {"team": "web"},
      "flags": {
        "headerColor": {"state": "ENABLED", "variants": {"red": "#CC0000", "blue": "#0000CC"}, "defaultVariant": "red"},
        "killSwitch": {"state": "DISABLED", "variants": {"on": true, "off": false}, "defaultVariant": "off"}
      }
    }"##;

    struct Fixture {
        _dir: TempDir,
        ctx: DaemonContext,
        source: FileSource,
        reload_rx: mpsc::Receiver<ReloadJob>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("flags.json");
        fs::write(&path, FLAGS).expect("write flags");
        let source_config = SourceConfig::new(&path);

        let store: Arc<dyn FlagStore> = Arc::new(MemoryStore::new(vec![source_config.id()]));
        let mux = Arc::new(Multiplexer::new(store.clone()).expect("mux"));
        let mut source = FileSource::new(&source_config);
        reload_source(&mut source, store.as_ref(), &mux).expect("load");

        let (reload_tx, reload_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(4);
        let ctx = DaemonContext {
            home: dir.path().to_path_buf(),
            store,
            mux,
            sources: Arc::new(vec![source_config]),
            timestamps: Arc::new(RwLock::new(ReloadTimestamps::new())),
            reload_tx,
            shutdown_tx,
            subscriber_buffer: 4,
            started_at_unix: 1_000_000,
            next_watch_id: Arc::new(AtomicU64::new(1)),
        };
        Fixture {
            _dir: dir,
            ctx,
            source,
            reload_rx,
        }
    }

    fn resolve_request(flag: &str, kind: Option<&str>) -> DaemonRequest {
        DaemonRequest {
            flag: Some(flag.to_string()),
            kind: kind.map(str::to_string),
            ..DaemonRequest::command("resolve")
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_fires_once_after_a_burst_settles() {
        let threshold = Duration::from_millis(100);
        let mut debouncer = Debouncer::new(threshold);
        let path = PathBuf::from("/tmp/flags.json");
        let mut reloads = 0usize;

        for _ in 0..5 {
            debouncer.record(path.clone(), Instant::now());
            reloads += debouncer.due(Instant::now()).len();
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(reloads, 0, "nothing fires while events keep arriving");

        advance(Duration::from_millis(150)).await;
        assert_eq!(debouncer.due(Instant::now()), vec![path]);
        assert!(debouncer.due(Instant::now()).is_empty());
    }

    #[test]
    fn canonical_path_of_missing_file_uses_parent() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("later.json");
        let canonical = canonical_file_path(&missing).expect("parent exists");
        assert_eq!(
            canonical,
            fs::canonicalize(dir.path()).unwrap().join("later.json")
        );
        assert!(canonical_file_path(Path::new("/definitely/not/here/x.json")).is_none());
    }

    #[test]
    fn relevant_events_include_removal() {
        use notify::event::{CreateKind, RemoveKind};
        assert!(is_relevant_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant_event_kind(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_relevant_event_kind(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }

    #[test]
    fn reload_publishes_only_on_change() {
        let mut fx = fixture();
        let (report, published) =
            reload_source(&mut fx.source, fx.ctx.store.as_ref(), &fx.ctx.mux).expect("reload");
        assert!(report.unchanged);
        assert!(!published);

        fs::write(fx.source.path(), FLAGS.replace("\"red\"}", "\"blue\"}")).expect("edit");
        let (report, published) =
            reload_source(&mut fx.source, fx.ctx.store.as_ref(), &fx.ctx.mux).expect("reload");
        assert_eq!(report.count(NotificationType::Update), 1);
        assert!(published);
    }

    #[tokio::test]
    async fn resolve_returns_default_variant() {
        let fx = fixture();
        let response = dispatch(&fx.ctx, resolve_request("headerColor", Some("string"))).await;
        assert!(response.ok, "{response:?}");
        let data = response.data.expect("data");
        assert_eq!(data["value"], json!("#CC0000"));
        assert_eq!(data["reason"], json!("STATIC"));
    }

    #[tokio::test]
    async fn resolve_errors_carry_codes() {
        let fx = fixture();
        let cases = [
            (resolve_request("nope", None), "FLAG_NOT_FOUND"),
            (resolve_request("killSwitch", None), "FLAG_DISABLED"),
            (resolve_request("headerColor", Some("boolean")), "TYPE_MISMATCH"),
        ];
        for (request, code) in cases {
            let response = dispatch(&fx.ctx, request).await;
            assert!(!response.ok);
            let error = response.error.expect("error");
            assert!(error.starts_with(code), "expected {code}, got {error}");
        }

        let bad_kind = dispatch(&fx.ctx, resolve_request("headerColor", Some("list"))).await;
        assert!(bad_kind.error.expect("error").contains("unknown variant kind"));
    }

    #[tokio::test]
    async fn flags_serves_cached_snapshots() {
        let fx = fixture();
        let source_id = fx.ctx.sources[0].id();

        let global = dispatch(&fx.ctx, DaemonRequest::command("flags")).await;
        let data = global.data.expect("data");
        assert_eq!(data["flags"]["headerColor"]["source"], json!(source_id));
        assert_eq!(data["metadata"], json!({"team": "web"}));

        let scoped = dispatch(
            &fx.ctx,
            DaemonRequest {
                source: Some("elsewhere.json".into()),
                ..DaemonRequest::command("flags")
            },
        )
        .await;
        assert!(!scoped.ok);
        assert!(scoped.error.expect("error").contains("no flag watcher setup"));
    }

    #[tokio::test]
    async fn status_payload_before_any_reload() {
        let fx = fixture();
        let payload = build_status_payload(&fx.ctx).await;

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["last_reload_at_unix"], json!(0u64));
        assert_eq!(payload["subscribers"], json!(0));
        let sources = payload["sources"].as_array().expect("sources array");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["id"], sources[0]["selector"]);
    }

    #[tokio::test]
    async fn reload_command_goes_through_the_processor_queue() {
        let mut fx = fixture();
        let ctx = fx.ctx.clone();
        let request = tokio::spawn(async move {
            dispatch(
                &ctx,
                DaemonRequest {
                    source: Some("flags.json".into()),
                    ..DaemonRequest::command("reload")
                },
            )
            .await
        });

        let job = fx.reload_rx.recv().await.expect("queued job");
        assert_eq!(job.source, "flags.json");
        assert_eq!(job.trigger, "socket");
        let report = LoadReport {
            unchanged: true,
            ..LoadReport::default()
        };
        let summary =
            build_reload_summary(job.source, job.trigger, &report, false, Duration::ZERO);
        job.respond_to.send(Ok(summary)).expect("respond");

        let response = request.await.expect("join");
        assert!(response.ok);
        assert_eq!(response.data.expect("data")[0]["unchanged"], json!(true));
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown() {
        let fx = fixture();
        let mut shutdown_rx = fx.ctx.shutdown_tx.subscribe();
        let response = dispatch(&fx.ctx, DaemonRequest::command("stop")).await;
        assert!(response.ok);
        shutdown_rx.recv().await.expect("shutdown signal");
    }
}
