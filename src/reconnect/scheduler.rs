// Shared reconnect timer
//
// At most one reconnect task is outstanding per session key. A task that has
// fired removes itself from the table before it runs, so cancelling only ever
// stops tasks that are still waiting.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct ScheduledReconnect {
    id: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

/// Delayed reconnect tasks keyed by session
#[derive(Default)]
pub struct ReconnectScheduler {
    tasks: Mutex<HashMap<String, ScheduledReconnect>>,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless a task is already outstanding for `key`
    ///
    /// Returns false when a task was already scheduled.
    pub fn schedule<F, Fut>(self: &Arc<Self>, key: &str, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(key) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::downgrade(self);
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let fired = scheduler
                .upgrade()
                .map_or(false, |scheduler| scheduler.take_if_current(&owned_key, id));

            if fired {
                trace!("Reconnect task for {} fired", owned_key);
                task().await;
            }
        });

        tasks.insert(key.to_string(), ScheduledReconnect { id, delay, handle });
        debug!("Scheduled reconnect for {} in {:?}", key, delay);
        true
    }

    /// Cancel the outstanding task for `key`
    ///
    /// Returns false when nothing was scheduled.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.lock().remove(key) {
            Some(scheduled) => {
                scheduled.handle.abort();
                debug!("Cancelled reconnect for {}", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding task
    pub fn cancel_all(&self) {
        for (_, scheduled) in self.tasks.lock().drain() {
            scheduled.handle.abort();
        }
    }

    /// Check for an outstanding task
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Delay of the outstanding task
    pub fn scheduled_delay(&self, key: &str) -> Option<Duration> {
        self.tasks.lock().get(key).map(|scheduled| scheduled.delay)
    }

    /// Number of outstanding tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Check whether no task is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_if_current(&self, key: &str, id: u64) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(key) {
            Some(scheduled) if scheduled.id == id => {
                tasks.remove(key);
                true
            }
            _ => false,
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay() {
        let scheduler = Arc::new(ReconnectScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule("a", Duration::from_secs(4), counting_task(&runs)));
        assert_eq!(scheduler.scheduled_delay("a"), Some(Duration::from_secs(4)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_task_per_key() {
        let scheduler = Arc::new(ReconnectScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule("a", Duration::from_secs(1), counting_task(&runs)));
        assert!(!scheduler.schedule("a", Duration::from_secs(1), counting_task(&runs)));
        assert!(scheduler.schedule("b", Duration::from_secs(1), counting_task(&runs)));
        assert_eq!(scheduler.len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_waiting_task() {
        let scheduler = Arc::new(ReconnectScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.cancel("a"));
        scheduler.schedule("a", Duration::from_secs(1), counting_task(&runs));
        assert!(scheduler.cancel("a"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // The key is free again once cancelled
        assert!(scheduler.schedule("a", Duration::from_secs(1), counting_task(&runs)));
    }

    #[tokio::test(start_paused = true)]
    async fn fired_task_is_not_cancelled() {
        let scheduler = Arc::new(ReconnectScheduler::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        scheduler.schedule("a", Duration::from_secs(1), move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        started_rx.await.unwrap();
        assert!(!scheduler.cancel("a"));

        release_tx.send(()).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
