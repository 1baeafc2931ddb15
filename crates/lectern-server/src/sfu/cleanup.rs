//! Deferred eviction scheduling
//!
//! One cancellable task per scheduled eviction, keyed by resource id.
//! Re-scheduling a key replaces its task; touching a resource again cancels
//! its pending eviction instead of waiting for a sweep to notice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct EvictionQueue {
    pending: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, replacing any eviction already
    /// pending for `key`.
    pub async fn schedule<F>(&self, key: Uuid, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pending = self.pending.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister before running: the action may itself cancel this
            // key (producer teardown does), which must not abort it mid-run
            pending.lock().await.remove(&key);
            action.await;
        });

        if let Some(previous) = self.pending.lock().await.insert(key, task) {
            previous.abort();
        }
    }

    /// Cancel a pending eviction. Returns whether one was pending.
    pub async fn cancel(&self, key: Uuid) -> bool {
        match self.pending.lock().await.remove(&key) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, task) in pending.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let queue = EvictionQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        queue
            .schedule(Uuid::new_v4(), Duration::from_secs(30), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let queue = EvictionQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let key = Uuid::new_v4();

        let counter = fired.clone();
        queue
            .schedule(key, Duration::from_secs(30), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(queue.cancel(key).await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!queue.cancel(key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_task() {
        let queue = EvictionQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let key = Uuid::new_v4();

        let first = fired.clone();
        queue
            .schedule(key, Duration::from_secs(10), async move {
                first.fetch_add(10, Ordering::SeqCst);
            })
            .await;

        let second = fired.clone();
        queue
            .schedule(key, Duration::from_secs(20), async move {
                second.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
