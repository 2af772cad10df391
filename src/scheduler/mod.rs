//! Bounded task scheduler.
//!
//! A fixed set of persistent workers drains a bounded FIFO queue. The
//! pool limits how much execution happens at once; admission control at
//! the HTTP boundary limits how much work is allowed in. Submitting only
//! waits for queue space, never for the task itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors from the worker pool.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("deadline elapsed before the task could be queued")]
    DeadlineElapsed,

    #[error("task {0} panicked or was abandoned")]
    TaskPanicked(String),
}

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A unit of work for the pool.
pub struct Task {
    id: String,
    future: TaskFuture,
}

impl Task {
    pub fn new<F>(id: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            future: Box::pin(future),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Fixed-size pool of workers fed by a bounded queue.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_capacity: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start `workers` workers over a queue holding `queue_capacity` tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Task>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|n| tokio::spawn(worker_loop(n, Arc::clone(&rx), Arc::clone(&active))))
            .collect();

        let (shutdown, _) = watch::channel(false);
        tracing::debug!(workers, queue_capacity, "worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            shutdown,
            workers: Mutex::new(handles),
            worker_count: workers,
            queue_capacity,
            active,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Task>, PoolError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::ShuttingDown)
    }

    /// Queue `task`, waiting only for queue space.
    pub async fn submit(&self, task: Task) -> Result<(), PoolError> {
        let sender = self.sender()?;
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            sent = sender.send(task) => sent.map_err(|_| PoolError::ShuttingDown),
            _ = shutdown.wait_for(|stopping| *stopping) => Err(PoolError::ShuttingDown),
        }
    }

    /// Like [`submit`](Self::submit) but gives up once `deadline` passes.
    pub async fn submit_with_deadline(&self, task: Task, deadline: Instant) -> Result<(), PoolError> {
        tokio::time::timeout_at(deadline, self.submit(task))
            .await
            .map_err(|_| PoolError::DeadlineElapsed)?
    }

    /// Run `future` on the pool and wait for its output.
    ///
    /// Dropping the returned future abandons the work: a queued task is
    /// skipped and a running one is dropped at its next suspension point.
    pub async fn run<F, T>(&self, id: impl Into<String>, future: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = id.into();
        let (mut tx, rx) = oneshot::channel();
        let task_id = id.clone();
        let task = Task::new(id.clone(), async move {
            let output = tokio::select! {
                output = future => Some(output),
                _ = tx.closed() => None,
            };
            match output {
                Some(output) => {
                    let _ = tx.send(output);
                }
                None => tracing::debug!(task = %task_id, "submitter went away, abandoning task"),
            }
            Ok(())
        });

        self.submit(task).await?;
        rx.await.map_err(|_| PoolError::TaskPanicked(id))
    }

    /// Stop accepting tasks, drain the queue and wait for every worker.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("worker exited abnormally: {e}");
            }
        }
        tracing::debug!("worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Workers currently executing a task.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        match &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    active: Arc<AtomicUsize>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(Task { id, future }) = next else {
            break;
        };

        active.fetch_add(1, Ordering::Relaxed);
        // Each task runs in its own tokio task so a panic stays local.
        match tokio::spawn(future).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(worker, task = %id, "task failed: {e:#}"),
            Err(e) => tracing::warn!(worker, task = %id, "task panicked: {e}"),
        }
        active.fetch_sub(1, Ordering::Relaxed);
    }
    tracing::trace!(worker, "worker exiting");
}
