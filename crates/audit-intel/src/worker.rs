//! Bounded worker pool for ingestion jobs.
//!
//! Each job is keyed by the id of the document it ingests. Admission is
//! bounded by `queue_capacity` (running + waiting jobs); execution by a
//! semaphore with `workers` permits. Every job has:
//!
//! - a [`CancelToken`] the job polls between steps,
//! - an observable terminal state that [`WorkerPool::wait`] resolves to.
//!
//! Admission is split in two steps so a caller can reserve a [`Slot`],
//! persist the pending document, and only then [`launch`](Slot::launch) the
//! job. Dropping an unlaunched slot gives the capacity back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use audit_intel_core::models::DocumentState;
use audit_intel_core::{Error, Result};

/// Cooperative cancellation signal handed to a job.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender freezes the value at `false`.
        drop(tx);
        Self { rx }
    }

    #[cfg(test)]
    pub(crate) fn already_cancelled() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled("ingestion cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

struct Job {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<Option<DocumentState>>,
}

struct Inner {
    permits: Arc<Semaphore>,
    capacity: usize,
    admitted: AtomicUsize,
    running: AtomicUsize,
    jobs: Mutex<HashMap<String, Job>>,
}

/// Running and waiting job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub running: usize,
    pub queued: usize,
    pub capacity: usize,
}

/// Bounded pool running ingestion jobs on the tokio runtime.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(workers.max(1))),
                capacity: queue_capacity.max(1),
                admitted: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reserve capacity for one job, or fail with [`Error::Overloaded`].
    pub fn try_reserve(&self) -> Result<Slot> {
        let capacity = self.inner.capacity;
        self.inner
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| Error::Overloaded(capacity))?;
        Ok(Slot {
            inner: Some(Arc::clone(&self.inner)),
        })
    }

    /// Request cancellation. Returns `false` if no job runs for `id`.
    pub fn cancel(&self, id: &str) -> bool {
        let jobs = self.inner.jobs.lock().unwrap();
        match jobs.get(id) {
            Some(job) => {
                job.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Wait for the job of `id` to finish. Returns `None` if there is no job.
    pub async fn wait(&self, id: &str) -> Option<DocumentState> {
        let mut done = {
            let jobs = self.inner.jobs.lock().unwrap();
            jobs.get(id)?.done.clone()
        };
        let finished = done.wait_for(|state| state.is_some()).await.map(|s| *s).ok();
        finished.flatten().or_else(|| *done.borrow())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.jobs.lock().unwrap().contains_key(id)
    }

    pub fn stats(&self) -> PoolStats {
        let admitted = self.inner.admitted.load(Ordering::SeqCst);
        let running = self.inner.running.load(Ordering::SeqCst);
        PoolStats {
            running,
            queued: admitted.saturating_sub(running),
            capacity: self.inner.capacity,
        }
    }
}

/// Reserved capacity for one job.
pub struct Slot {
    inner: Option<Arc<Inner>>,
}

impl Slot {
    /// Start the job for `id`. `job` receives the cancellation token and
    /// resolves to the document's terminal state.
    pub fn launch<F, Fut>(mut self, id: &str, job: F)
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = DocumentState> + Send + 'static,
    {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        inner.jobs.lock().unwrap().insert(
            id.to_string(),
            Job {
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        let id = id.to_string();
        let token = CancelToken { rx: cancel_rx };
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
                _ = token.cancelled() => None,
            };
            inner.running.fetch_add(1, Ordering::SeqCst);
            debug!(document.id = %id, "ingestion job started");

            let state = job(token).await;

            drop(permit);
            inner.running.fetch_sub(1, Ordering::SeqCst);
            inner.admitted.fetch_sub(1, Ordering::SeqCst);
            inner.jobs.lock().unwrap().remove(&id);
            done_tx.send_replace(Some(state));
            debug!(document.id = %id, state = %state, "ingestion job finished");
        });
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.admitted.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
