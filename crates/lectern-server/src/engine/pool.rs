//! Engine worker pool
//!
//! Owns a fixed set of worker handles and assigns one per new session via
//! round-robin. A crashed worker is removed and replaced; sessions already
//! bound to it are not migrated and stay unavailable until torn down.

use super::{EngineError, MediaEngine, Worker};
use crate::error::SignalError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `size` workers on the engine and start monitoring them
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        size: usize,
    ) -> Result<Arc<Self>, EngineError> {
        let pool = Arc::new(Self {
            engine,
            workers: RwLock::new(Vec::with_capacity(size)),
            cursor: AtomicUsize::new(0),
        });

        for _ in 0..size {
            let worker = pool.engine.create_worker().await?;
            pool.workers.write().await.push(worker.clone());
            pool.clone().monitor(worker);
        }

        tracing::info!("Worker pool started with {} workers", size);
        Ok(pool)
    }

    /// Next worker by round-robin over the configured pool
    pub async fn acquire(&self) -> Result<Arc<dyn Worker>, SignalError> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(SignalError::ResourceExhausted(
                "no media workers available".to_string(),
            ));
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % workers.len();
        Ok(workers[idx].clone())
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn alive_count(&self) -> usize {
        self.workers
            .read()
            .await
            .iter()
            .filter(|w| w.is_alive())
            .count()
    }

    fn monitor(self: Arc<Self>, worker: Arc<dyn Worker>) {
        tokio::spawn(async move {
            worker.died().await;
            self.replace(worker.id()).await;
        });
    }

    /// Drop the dead handle and spawn a replacement. Sessions bound to the
    /// dead worker are left as-is; they become unavailable until closed.
    async fn replace(self: Arc<Self>, dead_id: Uuid) {
        let position = {
            let mut workers = self.workers.write().await;
            match workers.iter().position(|w| w.id() == dead_id) {
                Some(pos) => {
                    workers.remove(pos);
                    pos
                }
                None => return,
            }
        };

        tracing::warn!("Engine worker {} crashed, spawning replacement", dead_id);

        match self.engine.create_worker().await {
            Ok(replacement) => {
                let mut workers = self.workers.write().await;
                let pos = position.min(workers.len());
                workers.insert(pos, replacement.clone());
                drop(workers);
                self.clone().monitor(replacement);
            }
            Err(e) => {
                tracing::error!("Failed to replace crashed worker {}: {}", dead_id, e);
            }
        }
    }
}
