//! # Watch mode
//!
//! Filesystem events are turned into [`ChangeEvent`]s and sent into a channel. A
//! [`WatchScheduler`] task drains the channel and coalesces bursts of events into one
//! [`ChangeBatch`] per quiet period:
//!
//! ```text
//! Idle --event--> Collecting --quiet period elapsed--> Flushing --done--> Idle
//!                   ^    |
//!                   +----+ event (restarts the quiet period)
//! ```
//!
//! A flush hands the batch to a [`BatchHandler`] (normally the
//! [`RebuildPipeline`](crate::pipeline::RebuildPipeline)) on the blocking thread pool and waits
//! for it. Only one flush runs at a time. Events that arrive during a flush wait in the channel
//! and start the next batch, so a rebuild never sees a change set that is still growing.
//!
//! With the `service` feature, [`WatchService`] connects a `notify` watcher to a scheduler
//! running on its own runtime.

use crate::{config::BuildOptions, error::PagewrightError};
use globset::GlobSet;
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

#[cfg(feature = "service")]
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
#[cfg(feature = "service")]
use tokio::{
    runtime::Runtime,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn changed(path: impl Into<PathBuf>) -> Self {
        ChangeEvent {
            path: path.into(),
            kind: ChangeKind::Changed,
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        ChangeEvent {
            path: path.into(),
            kind: ChangeKind::Removed,
        }
    }
}

/// Paths changed since the last flush, each with its latest kind of change. A removal replaces
/// a pending change of the same path and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    changes: BTreeMap<PathBuf, ChangeKind>,
}

impl ChangeBatch {
    pub fn record(&mut self, path: impl Into<PathBuf>, kind: ChangeKind) {
        self.changes.insert(path.into(), kind);
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.record(event.path, event.kind);
    }

    /// Snapshot the pending changes and start over with an empty set.
    pub fn take(&mut self) -> ChangeBatch {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &ChangeKind)> {
        self.changes.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.changes.keys()
    }

    pub fn kind_of(&self, path: &Path) -> Option<ChangeKind> {
        self.changes.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl FromIterator<ChangeEvent> for ChangeBatch {
    fn from_iter<I: IntoIterator<Item = ChangeEvent>>(iter: I) -> Self {
        let mut batch = ChangeBatch::default();
        for event in iter {
            batch.push(event);
        }
        batch
    }
}

/// Receives one coalesced batch per flush. Runs on the blocking thread pool; failures must be
/// handled (logged) inside `on_batch` since the scheduler keeps going regardless.
pub trait BatchHandler: Send + 'static {
    fn on_batch(&mut self, batch: ChangeBatch);
}

impl<F> BatchHandler for F
where
    F: FnMut(ChangeBatch) + Send + 'static,
{
    fn on_batch(&mut self, batch: ChangeBatch) {
        self(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Collecting,
    Flushing,
}

impl fmt::Display for DebounceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchScheduler {
    quiet_period: Duration,
}

impl WatchScheduler {
    pub fn new(quiet_period: Duration) -> Self {
        WatchScheduler { quiet_period }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Debounce `events` into batches for `handler` until every sender is gone. Changes still
    /// pending when the channel closes are flushed before returning the handler.
    pub async fn run<H: BatchHandler>(
        self,
        mut events: UnboundedReceiver<ChangeEvent>,
        mut handler: H,
    ) -> Result<H, PagewrightError> {
        let mut pending = ChangeBatch::default();
        let mut closed = false;
        while !closed {
            tracing::trace!("Scheduler {}", DebounceState::Idle);
            let Some(first) = events.recv().await else {
                break;
            };
            pending.push(first);

            tracing::trace!("Scheduler {}", DebounceState::Collecting);
            loop {
                match timeout(self.quiet_period, events.recv()).await {
                    Ok(Some(event)) => pending.push(event),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            tracing::debug!(
                "Scheduler {}: {} path(s)",
                DebounceState::Flushing,
                pending.len()
            );
            let batch = pending.take();
            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_batch(batch)));
                (handler, outcome)
            })
            .await?;
            handler = returned;
            // A panicking rebuild loses its batch; the next change starts a fresh one.
            if let Err(payload) = outcome {
                tracing::error!("Rebuild panicked: {}", panic_message(payload.as_ref()));
            }
        }
        tracing::debug!("Change channel closed, scheduler stopping");
        Ok(handler)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Decides which filesystem paths are worth a rebuild.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    source: PathBuf,
    ignored_dirs: Vec<PathBuf>,
    exclude: GlobSet,
}

impl ChangeFilter {
    pub fn new(source: impl Into<PathBuf>, ignored_dirs: Vec<PathBuf>, exclude: GlobSet) -> Self {
        ChangeFilter {
            source: source.into(),
            ignored_dirs,
            exclude,
        }
    }

    /// Watch `options.source`, ignoring the output tree and the configured exclude patterns.
    pub fn for_options(options: &BuildOptions) -> Result<Self, PagewrightError> {
        Ok(ChangeFilter::new(
            options.source.clone(),
            vec![options.dest.clone(), options.compile_dir.clone()],
            options.project.watch.exclude_set()?,
        ))
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// False for directories, hidden paths, paths inside an ignored directory (the output tree)
    /// and paths matching an exclude pattern.
    pub fn accepts(&self, path: &Path) -> bool {
        if path.is_dir() {
            return false;
        }
        if self.ignored_dirs.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        let relative = path.strip_prefix(&self.source).unwrap_or(path);
        let hidden = relative.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.') && s != "." && s != "..")
                .unwrap_or(false)
        });
        !hidden && !self.exclude.is_match(relative)
    }
}

#[cfg(feature = "service")]
fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(ChangeKind::Changed),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

/// A running watch session: a `notify` watcher feeding a [`WatchScheduler`].
#[cfg(feature = "service")]
pub struct WatchService {
    runtime: Runtime,
    watcher: RecommendedWatcher,
    scheduler: JoinHandle<Result<(), PagewrightError>>,
}

#[cfg(feature = "service")]
impl WatchService {
    pub fn start<H: BatchHandler>(
        filter: ChangeFilter,
        scheduler: WatchScheduler,
        handler: H,
    ) -> Result<Self, PagewrightError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let (tx, rx) = unbounded_channel::<ChangeEvent>();
        let root = filter.source().to_path_buf();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            forward(&filter, &tx, result)
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(
            "Watching {:?} (quiet period {:?})",
            root,
            scheduler.quiet_period()
        );

        let scheduler = runtime.spawn(async move {
            scheduler.run(rx, handler).await.map(|_| ())
        });
        Ok(WatchService {
            runtime,
            watcher,
            scheduler,
        })
    }

    /// Stop watching, flush what is pending and wait for the last rebuild to finish.
    pub fn stop(self) -> Result<(), PagewrightError> {
        let WatchService {
            runtime,
            watcher,
            scheduler,
        } = self;
        drop(watcher);
        runtime.block_on(scheduler)?
    }
}

#[cfg(feature = "service")]
fn forward(
    filter: &ChangeFilter,
    tx: &UnboundedSender<ChangeEvent>,
    result: notify::Result<Event>,
) {
    let event = match result {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("File watcher error: {}", PagewrightError::from(e));
            return;
        }
    };
    let Some(kind) = change_kind(&event.kind) else {
        return;
    };
    for path in event.paths.into_iter() {
        if !filter.accepts(&path) {
            tracing::trace!("Ignoring event for {:?}", path);
            continue;
        }
        tracing::debug!("{:?} {:?}", kind, path);
        if tx.send(ChangeEvent { path, kind }).is_err() {
            tracing::debug!("Scheduler is gone, dropping event");
            return;
        }
    }
}
