//! Download directory watcher
//!
//! Reports files that appear in the watched directories once they have
//! stopped changing for the settle delay, so half-written downloads are not
//! scanned.

use bastion_scan::RunningState;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often settled files are flushed to the sink
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// Receives every settled new file
pub type FileSink = Arc<dyn Fn(&Path) + Send + Sync>;

/// Watcher errors
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("None of the configured directories exist")]
    NoDirectories,

    #[error("Failed to spawn watcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A source of newly downloaded files the supervisor can start and stop.
pub trait Watcher: Send + Sync {
    /// Start watching. Starting a running watcher is a logged no-op.
    fn start(&self) -> Result<(), WatcherError>;

    /// Stop watching. Stopping a stopped watcher is a logged no-op.
    fn stop(&self);

    fn running_state(&self) -> RunningState;
}

/// Watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directories to watch
    pub directories: Vec<PathBuf>,
    /// Also watch subdirectories
    pub recursive: bool,
    /// Quiet period before a new file is reported
    pub settle_millis: u64,
}

impl WatcherConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            directories: dirs::download_dir().into_iter().collect(),
            recursive: false,
            settle_millis: 500,
        }
    }
}

/// New files waiting for their settle delay to pass
#[derive(Debug, Default)]
struct Settling {
    seen: HashMap<PathBuf, Instant>,
}

impl Settling {
    fn observe(&mut self, event: &Event, now: Instant) {
        match &event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.seen.insert(path.clone(), now);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                // paths = [from, to]
                if let [from, to] = event.paths.as_slice() {
                    self.seen.remove(from);
                    self.seen.insert(to.clone(), now);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for path in &event.paths {
                    self.seen.remove(path);
                }
            }
            EventKind::Modify(_) => {
                // Still being written: restart the settle delay
                for path in &event.paths {
                    if let Some(last) = self.seen.get_mut(path) {
                        *last = now;
                    }
                }
            }
            _ => {}
        }
    }

    /// Remove and return paths quiet for at least `settle`
    fn take_settled(&mut self, settle: Duration, now: Instant) -> Vec<PathBuf> {
        let settled: Vec<PathBuf> = self
            .seen
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= settle)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &settled {
            self.seen.remove(path);
        }
        settled
    }
}

struct ActiveWatch {
    /// Dropping the watcher stops filesystem notifications
    _watcher: RecommendedWatcher,
    shutdown: Sender<()>,
    forwarder: JoinHandle<()>,
}

/// Watches download directories with `notify` and feeds new files to a sink.
pub struct DownloadWatcher {
    config: WatcherConfig,
    sink: FileSink,
    active: Mutex<Option<ActiveWatch>>,
}

impl DownloadWatcher {
    pub fn new(config: WatcherConfig, sink: FileSink) -> Self {
        Self {
            config,
            sink,
            active: Mutex::new(None),
        }
    }
}

impl Watcher for DownloadWatcher {
    fn start(&self) -> Result<(), WatcherError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            warn!("Download watcher is already running");
            return Ok(());
        }

        let (event_tx, event_rx) = unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => error!("Watch error: {}", e),
            },
            notify::Config::default(),
        )?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let mut watched = 0;
        for dir in &self.config.directories {
            if !dir.is_dir() {
                warn!("Not watching {}: not a directory", dir.display());
                continue;
            }
            watcher.watch(dir, mode)?;
            info!("Watching {}", dir.display());
            watched += 1;
        }
        if watched == 0 {
            return Err(WatcherError::NoDirectories);
        }

        let (shutdown_tx, shutdown_rx) = unbounded();
        let sink = self.sink.clone();
        let settle = self.config.settle();
        let forwarder = thread::Builder::new()
            .name("download-watcher".to_string())
            .spawn(move || {
                debug!("Download watcher forwarder started");
                forward_settled(event_rx, shutdown_rx, sink, settle);
                debug!("Download watcher forwarder stopped");
            })?;

        *active = Some(ActiveWatch {
            _watcher: watcher,
            shutdown: shutdown_tx,
            forwarder,
        });
        info!("Download watcher started");
        Ok(())
    }

    fn stop(&self) {
        let Some(watch) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            warn!("Download watcher is already stopped");
            return;
        };

        let _ = watch.shutdown.send(());
        if watch.forwarder.join().is_err() {
            error!("Download watcher forwarder panicked");
        }
        info!("Download watcher stopped");
    }

    fn running_state(&self) -> RunningState {
        if self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            RunningState::Up
        } else {
            RunningState::Down
        }
    }
}

impl Drop for DownloadWatcher {
    fn drop(&mut self) {
        if self.running_state().is_up() {
            self.stop();
        }
    }
}

fn forward_settled(
    events: Receiver<Event>,
    shutdown: Receiver<()>,
    sink: FileSink,
    settle: Duration,
) {
    let mut settling = Settling::default();

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => settling.observe(&event, Instant::now()),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            default(FLUSH_TICK) => {}
        }

        for path in settling.take_settled(settle, Instant::now()) {
            if path.is_file() {
                debug!("New download: {}", path.display());
                sink(path.as_path());
            }
        }
    }
}
