//! Worker Pool & Task Groups
//!
//! [`TaskManager`] owns a fixed set of worker threads fed from a `flume`
//! channel. Every submission returns a [`Task`], a future resolved through a
//! `futures` oneshot channel, so callers can either block with
//! [`Task::wait`] or compose the result with other futures.
//!
//! [`TaskGroup`] batches heterogeneous jobs: run them in order on the
//! caller's thread, or fan them out to the pool and await a single
//! [`TaskFuture`].

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;

use crate::errors::{LoaderError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskManager {
    sender: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskManager {
    /// Spawns `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = flume::unbounded::<Job>();

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("myth-loader-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(worker);
        }

        log::debug!("TaskManager started with {num_threads} workers");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Pool sized to the number of available CPU cores.
    pub fn with_default_threads() -> Result<Self> {
        Self::new(default_thread_count())
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Runs `f` on a worker. A panic inside `f` resolves the task with
    /// [`LoaderError::TaskJoin`].
    pub fn submit<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|_| Err(LoaderError::TaskJoin("worker task panicked".into())));
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });

        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    log::error!("TaskManager: all workers have exited, task dropped");
                }
            }
            None => log::error!("TaskManager: submit after shutdown, task dropped"),
        }

        Task { rx }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain and exit.
        self.sender.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("TaskManager: worker thread panicked during shutdown");
            }
        }
    }
}

#[must_use]
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Result of a single pool submission.
#[must_use = "a task does nothing observable unless awaited"]
pub struct Task<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Task<T> {
    /// Blocks the current thread until the task completes.
    pub fn wait(self) -> Result<T> {
        pollster::block_on(self)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(canceled)) => Poll::Ready(Err(canceled.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Completion of a whole [`TaskGroup`].
#[must_use = "a task future does nothing observable unless awaited"]
pub struct TaskFuture {
    inner: BoxFuture<'static, Result<()>>,
}

impl TaskFuture {
    /// An already-completed future.
    pub fn ready(result: Result<()>) -> Self {
        Self {
            inner: Box::pin(futures::future::ready(result)),
        }
    }

    /// Blocks until every task in the group has finished, or one failed.
    pub fn wait(self) -> Result<()> {
        pollster::block_on(self)
    }
}

impl Future for TaskFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

type GroupJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
pub struct TaskGroup {
    tasks: Vec<GroupJob>,
}

impl TaskGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task<F>(&mut self, f: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.tasks.push(Box::new(f));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task in insertion order on the calling thread, stopping
    /// at the first error.
    pub fn run_inline(self) -> Result<()> {
        for task in self.tasks {
            task()?;
        }
        Ok(())
    }

    /// Fans the tasks out to the pool. The returned future resolves once all
    /// of them succeed, or with the first error observed.
    pub fn submit(self, manager: &TaskManager) -> TaskFuture {
        if self.tasks.is_empty() {
            return TaskFuture::ready(Ok(()));
        }
        let tasks: Vec<Task<()>> = self.tasks.into_iter().map(|t| manager.submit(t)).collect();
        TaskFuture {
            inner: Box::pin(futures::future::try_join_all(tasks).map(|r| r.map(|_| ()))),
        }
    }
}
