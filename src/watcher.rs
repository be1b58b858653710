//! File change watcher
//!
//! Watches individual asset files and reports "this file probably changed"
//! once a burst of filesystem events has gone quiet for the debounce
//! interval. Each watched file is observed through a non-recursive watch on
//! its parent directory, so editors that save by renaming a temp file over
//! the original are still seen. Directory watches are shared and
//! ref-counted across files.
//!
//! Raw `notify` events are forwarded over a channel to a dispatcher task
//! that owns the debounce timers.

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// Callback invoked with the watched path once its debounce timer elapses
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct WatchEntry {
    dir: PathBuf,
    on_change: ChangeCallback,
    debounce: Duration,
    pending: Option<PendingTimer>,
}

struct WatchState {
    backend: RecommendedWatcher,
    entries: HashMap<PathBuf, WatchEntry>,
    /// Parent directories under an OS watch, with the number of entries using each
    dirs: HashMap<PathBuf, usize>,
    next_timer: u64,
}

impl WatchState {
    fn retain_dir(&mut self, dir: &Path) -> notify::Result<()> {
        if let Some(count) = self.dirs.get_mut(dir) {
            *count += 1;
            return Ok(());
        }
        self.backend.watch(dir, RecursiveMode::NonRecursive)?;
        self.dirs.insert(dir.to_path_buf(), 1);
        Ok(())
    }

    fn release_dir(&mut self, dir: &Path) {
        let Some(count) = self.dirs.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.dirs.remove(dir);
            if let Err(err) = self.backend.unwatch(dir) {
                // The directory may already be gone
                debug!("Unwatch of {} failed: {}", dir.display(), err);
            }
        }
    }

    fn remove(&mut self, path: &Path) -> bool {
        match self.entries.remove(path) {
            Some(entry) => {
                if let Some(timer) = entry.pending {
                    timer.handle.abort();
                }
                self.release_dir(&entry.dir);
                true
            }
            None => false,
        }
    }

    /// Drop every entry under `dir` after its OS watch died. The backend
    /// has already released the watch, so it is not asked to again.
    fn forget_dir(&mut self, dir: &Path) -> Vec<PathBuf> {
        self.dirs.remove(dir);
        let orphaned: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dir == dir)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &orphaned {
            self.remove(path);
        }
        orphaned
    }
}

/// Debouncing per-file watcher
///
/// Callbacks run while the watcher's internal lock is held: they must be
/// quick and must not call back into the watcher. Forwarding onto a channel
/// is the intended use.
pub struct FileWatcher {
    state: Arc<Mutex<WatchState>>,
    dispatcher: JoinHandle<()>,
}

impl FileWatcher {
    /// Create a watcher. Must be called from within a tokio runtime.
    pub fn new() -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let backend = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = raw_tx.send(result);
        })?;

        let state = Arc::new(Mutex::new(WatchState {
            backend,
            entries: HashMap::new(),
            dirs: HashMap::new(),
            next_timer: 0,
        }));
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&state), raw_rx));

        Ok(Self { state, dispatcher })
    }

    /// Start watching `path`, replacing any previous watch on it.
    ///
    /// Returns `Ok(false)` without registering anything when the file does
    /// not exist.
    pub fn watch<F>(&self, path: impl AsRef<Path>, on_change: F, debounce: Duration) -> Result<bool>
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        let path = normalize(path.as_ref());
        if !path.exists() {
            debug!("Not watching missing file {}", path.display());
            return Ok(false);
        }
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());

        let mut state = self.state.lock();
        state.remove(&path);
        state.retain_dir(&dir)?;
        state.entries.insert(
            path.clone(),
            WatchEntry {
                dir,
                on_change: Arc::new(on_change),
                debounce,
                pending: None,
            },
        );

        debug!("Watching {} (debounce {:?})", path.display(), debounce);
        Ok(true)
    }

    /// Stop watching `path` and cancel its pending timer.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> bool {
        let path = normalize(path.as_ref());
        let removed = self.state.lock().remove(&path);
        if removed {
            debug!("Stopped watching {}", path.display());
        }
        removed
    }

    /// Release every OS watch and cancel every pending timer.
    pub fn unwatch_all(&self) {
        let mut state = self.state.lock();
        let paths: Vec<PathBuf> = state.entries.keys().cloned().collect();
        for path in paths {
            state.remove(&path);
        }
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        let path = normalize(path.as_ref());
        self.state.lock().entries.contains_key(&path)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.unwatch_all();
        self.dispatcher.abort();
    }
}

/// Absolute path with the parent resolved, matching what the backend reports
fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

fn is_content_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        _ => false,
    }
}

async fn dispatch(
    state: Arc<Mutex<WatchState>>,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
) {
    while let Some(result) = raw_rx.recv().await {
        on_raw_event(&state, result);
    }
}

/// Whether `kind` can mean the OS watch on a directory is gone
fn ends_dir_watch(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) | EventKind::Other
    )
}

fn on_raw_event(state: &Arc<Mutex<WatchState>>, result: notify::Result<Event>) {
    match result {
        Ok(event) => {
            if ends_dir_watch(&event.kind) {
                let mut guard = state.lock();
                for path in &event.paths {
                    if !guard.dirs.contains_key(path) {
                        continue;
                    }
                    for orphan in guard.forget_dir(path) {
                        warn!(
                            "Stopped watching {}: {} went away",
                            orphan.display(),
                            path.display()
                        );
                    }
                }
            }
            if !is_content_event(&event.kind) {
                return;
            }
            for path in &event.paths {
                schedule(state, path);
            }
        }
        Err(err) => {
            warn!("File watch error: {}", err);
            let mut guard = state.lock();
            for failed in &err.paths {
                let affected: Vec<PathBuf> = guard
                    .entries
                    .iter()
                    .filter(|(path, entry)| {
                        path.as_path() == failed.as_path() || entry.dir == *failed
                    })
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in affected {
                    guard.remove(&path);
                    warn!("Stopped watching {} after watch error", path.display());
                }
            }
        }
    }
}

/// (Re)start the debounce timer for `path` if it is watched.
fn schedule(state: &Arc<Mutex<WatchState>>, path: &Path) {
    let mut guard = state.lock();
    guard.next_timer += 1;
    let id = guard.next_timer;

    let Some(entry) = guard.entries.get_mut(path) else {
        return;
    };
    if let Some(previous) = entry.pending.take() {
        previous.handle.abort();
    }

    trace!("Debouncing {}", path.display());
    let debounce = entry.debounce;
    let timer_state = Arc::clone(state);
    let timer_path = path.to_path_buf();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        fire(&timer_state, &timer_path, id);
    });
    entry.pending = Some(PendingTimer { id, handle });
}

fn fire(state: &Mutex<WatchState>, path: &Path, id: u64) {
    let mut guard = state.lock();
    let Some(entry) = guard.entries.get_mut(path) else {
        return;
    };
    // A newer event, an unwatch or a re-watch superseded this timer
    if entry.pending.as_ref().map(|t| t.id) != Some(id) {
        return;
    }
    entry.pending = None;

    if path.exists() {
        debug!("Change settled on {}", path.display());
        (entry.on_change)(path);
    } else {
        debug!("{} disappeared during debounce, not reporting", path.display());
    }
}
