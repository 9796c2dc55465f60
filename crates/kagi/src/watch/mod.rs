mod settle;

pub use settle::SettleTracker;

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::KagiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file exists but may still be written to.
    Pending(PathBuf),
    /// The file stopped changing and can be read.
    Ready(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Pending(path) | WatchEvent::Ready(path) | WatchEvent::Removed(path) => path,
        }
    }
}

/// Where change notifications come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatcherBackend {
    /// Native notifications, falling back to polling when they are unavailable.
    #[default]
    Auto,
    Native,
    Poll,
}

impl FromStr for WatcherBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "poll" => Ok(Self::Poll),
            _ => Err(format!("unknown watcher backend: {s}")),
        }
    }
}

impl fmt::Display for WatcherBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatcherBackend::Auto => "auto",
            WatcherBackend::Native => "native",
            WatcherBackend::Poll => "poll",
        })
    }
}

/// Turns filesystem notifications for one directory into settled file events.
///
/// ```text
/// notify backend ──paths──► SettleTracker ──WatchEvent──► [bounded MPSC] ──► consumer
///                    initial scan ┘      ▲ re-stat every debounce / 2
/// ```
pub struct DirectoryWatcher {
    dir: PathBuf,
    backend: WatcherBackend,
    poll_interval: Duration,
    debounce: Duration,
    stall_after: Duration,
    capacity: usize,
}

impl DirectoryWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            backend: WatcherBackend::Auto,
            poll_interval: Duration::from_millis(500),
            debounce: Duration::from_millis(300),
            stall_after: Duration::from_secs(30),
            capacity: 64,
        }
    }

    pub fn backend(mut self, backend: WatcherBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn stall_after(mut self, stall_after: Duration) -> Self {
        self.stall_after = stall_after;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Start watching.
    ///
    /// Files already in the directory are reported first. The returned channel
    /// closes once `cancel` fires, at which point the notification backend has
    /// been released.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> KagiResult<(mpsc::Receiver<WatchEvent>, JoinHandle<()>)> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<PathBuf>(self.capacity * 4);
        let watcher = self.start_backend(raw_tx)?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut tracker = SettleTracker::new(self.debounce, self.stall_after);
        let tick_every = (self.debounce / 2).max(Duration::from_millis(10));
        let dir = self.dir;

        let handle = tokio::spawn(async move {
            // keep the backend alive for as long as we are watching
            let _watcher = watcher;

            let mut existing: Vec<PathBuf> = match std::fs::read_dir(&dir) {
                Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
                Err(e) => {
                    log::error!("Failed to scan {}: {e}", dir.display());
                    Vec::new()
                }
            };
            existing.sort();
            for path in existing {
                if let Some(event) = tracker.file_changed(path) {
                    if !forward(&tx, event, &cancel).await {
                        return;
                    }
                }
            }

            let mut ticker = interval(tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(path) = raw_rx.recv() => {
                        if let Some(event) = tracker.file_changed(path) {
                            if !forward(&tx, event, &cancel).await {
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        for event in tracker.check_settled() {
                            if !forward(&tx, event, &cancel).await {
                                return;
                            }
                        }
                    }
                }
            }

            log::debug!("Stopped watching {}", dir.display());
        });

        Ok((rx, handle))
    }

    fn start_backend(&self, tx: mpsc::Sender<PathBuf>) -> KagiResult<Box<dyn Watcher + Send>> {
        Ok(match self.backend {
            WatcherBackend::Native => self.native(tx)?,
            WatcherBackend::Poll => self.poll(tx)?,
            WatcherBackend::Auto => match self.native(tx.clone()) {
                Ok(watcher) => watcher,
                Err(e) => {
                    log::warn!("Native file notifications unavailable ({e}), polling instead.");
                    self.poll(tx)?
                }
            },
        })
    }

    fn native(&self, tx: mpsc::Sender<PathBuf>) -> KagiResult<Box<dyn Watcher + Send>> {
        let mut watcher = RecommendedWatcher::new(event_handler(tx), Config::default())?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        log::info!("Watching {} for changes.", self.dir.display());
        Ok(Box::new(watcher))
    }

    fn poll(&self, tx: mpsc::Sender<PathBuf>) -> KagiResult<Box<dyn Watcher + Send>> {
        let config = Config::default().with_poll_interval(self.poll_interval);
        let mut watcher = PollWatcher::new(event_handler(tx), config)?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        log::info!(
            "Polling {} every {:?} for changes.",
            self.dir.display(),
            self.poll_interval
        );
        Ok(Box::new(watcher))
    }
}

/// Runs on the backend's own thread, so blocking here applies backpressure to it.
fn event_handler(tx: mpsc::Sender<PathBuf>) -> impl Fn(notify::Result<Event>) + Send + 'static {
    move |res: notify::Result<Event>| match res {
        Ok(event) => {
            // our own reads show up as access events
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for path in event.paths {
                if tx.blocking_send(path).is_err() {
                    return;
                }
            }
        }
        Err(e) => log::warn!("File watcher error: {e}"),
    }
}

async fn forward(
    tx: &mpsc::Sender<WatchEvent>,
    event: WatchEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        result = tx.send(event) => result.is_ok(),
        _ = cancel.cancelled() => false,
    }
}
