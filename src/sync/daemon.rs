//! Watch daemon
//!
//! Wires the file watcher to the push path and the remote poller to the
//! pull path. Both sources only enqueue events; a single loop drains the
//! queue, so per-asset work never runs concurrently with itself.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::links::{LinkEntry, LinkSet};
use crate::poller::RemotePoller;
use crate::sync::engine::{LocalWriteHook, PullOptions, PushOptions, RunSummary, SyncEngine};
use crate::sync::remote::SyncRemote;
use crate::watcher::FileWatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// A linked file settled after an edit
    LocalChange { asset_id: String },
    PollTick,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
}

/// Watches for every linked file, keyed by path so a watch can be dropped
/// and restored around a pulled write.
struct WatchSet {
    watcher: FileWatcher,
    events: mpsc::UnboundedSender<DaemonEvent>,
    debounce: Duration,
    assets: Mutex<HashMap<PathBuf, String>>,
}

impl WatchSet {
    fn watch(&self, path: &Path, asset_id: &str) -> Result<bool> {
        let events = self.events.clone();
        let id = asset_id.to_string();
        self.watcher.watch(
            path,
            move |_: &Path| {
                let _ = events.send(DaemonEvent::LocalChange {
                    asset_id: id.clone(),
                });
            },
            self.debounce,
        )
    }

    /// Bring the watch set in line with the current links. Watches that
    /// are still wanted are left alone so pending debounce timers survive.
    fn rewatch(&self, entries: &[LinkEntry]) {
        let wanted: HashMap<PathBuf, String> = entries
            .iter()
            .map(|e| (e.local_path.clone(), e.asset_id.clone()))
            .collect();
        let mut assets = self.assets.lock();

        for path in assets.keys().filter(|p| !wanted.contains_key(*p)) {
            self.watcher.unwatch(path);
        }
        for (path, asset_id) in &wanted {
            let known = assets.get(path) == Some(asset_id);
            if known && self.watcher.is_watching(path) {
                continue;
            }
            match self.watch(path, asset_id) {
                // The watch lapsed (file or directory went away); edits made
                // before it was restored only show up as a hash difference
                Ok(true) if known => {
                    let _ = self.events.send(DaemonEvent::LocalChange {
                        asset_id: asset_id.clone(),
                    });
                }
                Ok(true) => {}
                Ok(false) => debug!(
                    "{} does not exist yet; watching after first pull",
                    path.display()
                ),
                Err(err) => warn!("Cannot watch {}: {}", path.display(), err),
            }
        }

        *assets = wanted;
        debug!("Watching {} linked files", self.watcher.watch_count());
    }
}

impl LocalWriteHook for WatchSet {
    fn suspend(&self, path: &Path) {
        self.watcher.unwatch(path);
    }

    fn resume(&self, path: &Path) {
        let asset_id = self.assets.lock().get(path).cloned();
        if let Some(asset_id) = asset_id {
            if let Err(err) = self.watch(path, &asset_id) {
                warn!("Cannot re-watch {}: {}", path.display(), err);
            }
        }
    }
}

pub struct Daemon<R> {
    engine: SyncEngine<R>,
    links: LinkSet,
    options: DaemonOptions,
}

impl<R: SyncRemote> Daemon<R> {
    pub fn new(engine: SyncEngine<R>, links: LinkSet, options: DaemonOptions) -> Self {
        Self {
            engine,
            links,
            options,
        }
    }

    /// Run until `shutdown` resolves. Returns early only on a fatal error.
    pub async fn run<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watches = WatchSet {
            watcher: FileWatcher::new()?,
            events: tx.clone(),
            debounce: self.options.debounce,
            assets: Mutex::new(HashMap::new()),
        };

        info!(
            "Daemon started for {} links (poll every {:?})",
            self.links.entries().len(),
            self.options.poll_interval
        );
        self.sweep(&watches).await?;

        let poller = RemotePoller::new();
        poller.start(self.options.poll_interval, move || {
            let tx = tx.clone();
            async move {
                tx.send(DaemonEvent::PollTick)
                    .map_err(|_| "daemon loop has stopped")
            }
        });

        tokio::pin!(shutdown);
        let result = loop {
            let event = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            if let Err(err) = self.handle(event, &watches).await {
                break Err(err);
            }
        };

        poller.stop();
        watches.watcher.unwatch_all();
        info!("Daemon stopped");
        result
    }

    async fn handle(&mut self, event: DaemonEvent, watches: &WatchSet) -> Result<()> {
        match event {
            DaemonEvent::LocalChange { asset_id } => self.push_one(&asset_id).await,
            DaemonEvent::PollTick => self.sweep(watches).await,
        }
    }

    async fn push_one(&mut self, asset_id: &str) -> Result<()> {
        // Links may have been edited by another command since the last event
        self.links.reload();
        let options = PushOptions {
            asset: Some(asset_id.to_string()),
            force: false,
        };
        match self.engine.push(&mut self.links, &options).await {
            Ok(summary) => {
                log_summary("push", &summary);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!("Push of {} failed: {}", asset_id, err);
                Ok(())
            }
        }
    }

    /// Refresh the watch set, then pull every link.
    async fn sweep(&mut self, watches: &WatchSet) -> Result<()> {
        self.links.reload();
        let entries: Vec<LinkEntry> = self.links.entries().into_iter().map(|(_, e)| e).collect();
        watches.rewatch(&entries);

        let outcome = self
            .engine
            .pull(&mut self.links, &PullOptions::default(), watches)
            .await;
        match outcome {
            Ok(summary) => log_summary("pull", &summary),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!("Pull sweep failed: {}", err),
        }
        Ok(())
    }
}

fn log_summary(kind: &str, summary: &RunSummary) {
    let changed = summary.pushed() + summary.pulled();
    if changed > 0 || summary.conflicts() > 0 || summary.has_failures() {
        info!(
            "{}: {} synced, {} conflicts, {} failed",
            kind,
            changed,
            summary.conflicts(),
            summary.failed()
        );
    } else {
        debug!("{}: nothing to do", kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use crate::links::{LinkRegistry, LinkScope};
    use crate::sync::testing::FakeRemote;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, Instant};

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_daemon_pushes_edits_and_pulls_without_echo() {
        let home = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let registry = LinkRegistry::new(home.path());
        let path = work.path().join("SKILL.md");
        std::fs::write(&path, "v1").unwrap();

        let mut links = LinkSet::load(registry.clone(), work.path());
        let mut entry = LinkEntry::new("a1", "a1-slug", path.clone());
        entry.last_hash = content_hash("v1");
        entry.last_synced_version = "1.0.0".into();
        links.link(LinkScope::Global, entry);
        links.save().unwrap();

        let remote = Arc::new(FakeRemote::default());
        remote.add("a1", "1.0.0", "v1");

        let daemon = Daemon::new(
            SyncEngine::new(Arc::clone(&remote), "m1"),
            LinkSet::load(registry.clone(), work.path()),
            DaemonOptions {
                poll_interval: Duration::from_millis(200),
                debounce: Duration::from_millis(50),
            },
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(daemon.run(async {
            stop_rx.await.ok();
        }));

        sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "v2").unwrap();
        assert!(eventually(|| remote.content("a1") == "v2").await);
        assert_eq!(remote.push_count(), 1);

        remote.publish("a1", "1.0.9", "from elsewhere");
        assert!(
            eventually(|| std::fs::read_to_string(&path).unwrap_or_default() == "from elsewhere")
                .await
        );

        // The pulled write must not come back as a push
        sleep(Duration::from_millis(500)).await;
        assert_eq!(remote.push_count(), 1);
        let reloaded = LinkSet::load(registry, work.path());
        assert_eq!(reloaded.find("a1").unwrap().1.last_synced_version, "1.0.9");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rewatch_restores_watch_after_dir_removal() {
        let work = TempDir::new().unwrap();
        let skills = work.path().join("skills");
        let path = skills.join("SKILL.md");
        std::fs::create_dir(&skills).unwrap();
        std::fs::write(&path, "v1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watches = WatchSet {
            watcher: FileWatcher::new().unwrap(),
            events: tx,
            debounce: Duration::from_millis(50),
            assets: Mutex::new(HashMap::new()),
        };
        let entries = vec![LinkEntry::new("a1", "a1-slug", path.clone())];
        watches.rewatch(&entries);
        assert!(watches.watcher.is_watching(&path));

        std::fs::remove_dir_all(&skills).unwrap();
        assert!(eventually(|| !watches.watcher.is_watching(&path)).await);

        // Still gone: nothing to watch yet
        watches.rewatch(&entries);
        assert!(!watches.watcher.is_watching(&path));

        std::fs::create_dir(&skills).unwrap();
        std::fs::write(&path, "edited while unwatched").unwrap();
        while rx.try_recv().is_ok() {}

        watches.rewatch(&entries);
        assert!(watches.watcher.is_watching(&path));
        assert_eq!(
            rx.try_recv().unwrap(),
            DaemonEvent::LocalChange {
                asset_id: "a1".into()
            }
        );
    }
}
