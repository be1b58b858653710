//! Remote poller
//!
//! Fires a callback on a fixed period so the daemon checks the version
//! authority for new versions. The first tick happens one full interval
//! after `start`. Failed or panicking ticks are logged and swallowed.

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
pub struct RemotePoller {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemotePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking. A running tick stream is replaced, never duplicated.
    pub fn start<F, Fut, E>(&self, interval: Duration, on_poll: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let mut slot = self.task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                debug!("Poll tick");
                match AssertUnwindSafe(on_poll()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("Poll failed: {}", err),
                    Err(_) => warn!("Poll callback panicked"),
                }
            }
        }));
        debug!("Poller started ({:?})", interval);
    }

    /// Cancel the tick stream. Safe to call repeatedly.
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                debug!("Poller stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RemotePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_millis(80);

    fn counting(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::Ready<Result<(), String>> + Send + Sync + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_fires_repeatedly_not_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let poller = RemotePoller::new();
        poller.start(INTERVAL, counting(&count));
        assert!(poller.is_running());

        sleep(INTERVAL / 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(INTERVAL * 2).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        poller.stop();
    }

    #[tokio::test]
    async fn test_stop_prevents_further_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let poller = RemotePoller::new();
        poller.start(INTERVAL, counting(&count));
        sleep(INTERVAL + INTERVAL / 2).await;

        assert!(poller.stop());
        assert!(!poller.stop());
        assert!(!poller.is_running());
        let seen = count.load(Ordering::SeqCst);

        sleep(INTERVAL * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_ticking() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let poller = RemotePoller::new();
        poller.start(INTERVAL, move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first tick blows up");
                }
                Err::<(), _>("server unreachable")
            }
        });

        sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        assert!(poller.is_running());
        poller.stop();
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let poller = RemotePoller::new();
        poller.start(INTERVAL, counting(&count));
        poller.start(INTERVAL, counting(&count));

        sleep(INTERVAL * 2 + INTERVAL / 2).await;
        poller.stop();
        // Two overlapping streams would have produced about four ticks
        assert!(count.load(Ordering::SeqCst) <= 2);
    }
}
