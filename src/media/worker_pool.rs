#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::config::{MediaConfig, WorkerConfig};
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tracing::{debug, error, info};

/// Index of the worker hosting the fewest routers; ties go to the lowest index.
pub fn least_loaded(router_counts: &[usize]) -> Option<usize> {
    router_counts
        .iter()
        .enumerate()
        .min_by_key(|(_, count)| **count)
        .map(|(idx, _)| idx)
}

/// Per-worker router counts.
///
/// Selection and increment happen under one lock so two concurrent
/// acquisitions never both observe the same minimum.
#[derive(Debug)]
pub struct LoadTable {
    router_counts: StdMutex<Vec<usize>>,
}

impl LoadTable {
    pub fn new(num_workers: usize) -> Self {
        Self {
            router_counts: StdMutex::new(vec![0; num_workers]),
        }
    }

    /// Picks the least loaded slot and charges one router to it
    pub fn acquire(&self) -> Option<usize> {
        let mut counts = self.router_counts.lock().unwrap_or_else(|e| e.into_inner());
        let idx = least_loaded(&counts)?;
        counts[idx] += 1;
        Some(idx)
    }

    pub fn release(&self, idx: usize) {
        let mut counts = self.router_counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(idx) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> Vec<usize> {
        self.router_counts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A worker charged with one router. Dropping the lease gives the slot back.
pub struct WorkerLease {
    worker: Worker,
    index: usize,
    loads: Arc<LoadTable>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.loads.release(self.index);
        debug!("Released router slot on worker {} (index {})", self.worker.id(), self.index);
    }
}

/// Fixed pool of mediasoup workers created at start-up
pub struct WorkerPool {
    workers: Vec<Worker>,
    loads: Arc<LoadTable>,
    _worker_manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerPool {
    /// Spawns `num_workers` mediasoup workers.
    ///
    /// # Errors
    /// Returns an error if any worker fails to start; the process should not continue.
    pub async fn new(config: &MediaConfig) -> MediaResult<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating WorkerPool with {} workers", num_workers);

        let worker_manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let worker = Self::create_worker(&config.worker_config, &worker_manager).await?;
            info!("Created worker {} with id: {}", i, worker.id());
            Self::setup_worker_handlers(&worker, i);
            workers.push(worker);
        }

        Ok(Self {
            workers,
            loads: Arc::new(LoadTable::new(num_workers)),
            _worker_manager: worker_manager,
        })
    }

    async fn create_worker(
        config: &WorkerConfig,
        manager: &mediasoup::worker_manager::WorkerManager,
    ) -> MediaResult<Worker> {
        manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::Worker(format!("Failed to create worker: {e}")))
    }

    fn setup_worker_handlers(worker: &Worker, worker_index: usize) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, worker_index, reason);
            })
            .detach();
    }

    /// Hands out the worker currently hosting the fewest routers
    pub fn acquire_worker(&self) -> MediaResult<WorkerLease> {
        let index = self
            .loads
            .acquire()
            .ok_or_else(|| MediaError::Worker("No workers available".to_string()))?;
        let worker = self.workers[index].clone();

        debug!("Selected worker {} (index {})", worker.id(), index);
        Ok(WorkerLease {
            worker,
            index,
            loads: self.loads.clone(),
        })
    }

    /// Current router count per worker, in pool order
    pub fn load_distribution(&self) -> Vec<usize> {
        self.loads.snapshot()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
