use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
    thread::{self, JoinHandle},
};

use crate::{
    Error,
    config::{
        self, ConfigError, DEFAULT_THREAD_NAME, THREAD_NAME_VAR, WORKER_THREADS_VAR,
    },
};

use super::{Continuation, Scheduler, SchedulerRef, Spawner};

/// Configuration of a [`ThreadpoolScheduler`].
#[derive(Debug, Clone, Default)]
pub struct Builder {
    pub worker_threads: Option<usize>,
    pub thread_name: Option<String>,
}

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: None,
        }
    }

    /// Reads the worker count and thread name prefix from
    /// `SWITCHY_JOBS_WORKER_THREADS` and `SWITCHY_JOBS_THREAD_NAME`.
    ///
    /// # Errors
    ///
    /// * If `SWITCHY_JOBS_WORKER_THREADS` is set but is not a valid `usize`
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            worker_threads: Some(config::default_env_usize(
                WORKER_THREADS_VAR,
                config::default_worker_threads(),
            )?),
            thread_name: Some(config::default_env(THREAD_NAME_VAR, DEFAULT_THREAD_NAME)),
        })
    }

    pub fn worker_threads<T: Into<Option<usize>>>(&mut self, worker_threads: T) -> &mut Self {
        self.worker_threads = worker_threads.into();
        self
    }

    pub fn thread_name(&mut self, thread_name: impl Into<String>) -> &mut Self {
        self.thread_name = Some(thread_name.into());
        self
    }

    /// Spawns the worker threads.
    ///
    /// # Errors
    ///
    /// * [`Error::NoWorkers`] if the worker count is zero
    /// * [`Error::IO`] if a worker thread fails to spawn
    pub fn build(&self) -> Result<ThreadpoolScheduler, Error> {
        let worker_threads = self
            .worker_threads
            .unwrap_or_else(config::default_worker_threads);
        if worker_threads == 0 {
            return Err(Error::NoWorkers);
        }
        let thread_name = self.thread_name.as_deref().unwrap_or(DEFAULT_THREAD_NAME);

        let (sender, receiver) = flume::unbounded();
        let scheduler = ThreadpoolScheduler {
            queue: Arc::new(Queue {
                sender: RwLock::new(Some(sender)),
            }),
            workers: Mutex::new(Vec::with_capacity(worker_threads)),
        };

        for index in 0..worker_threads {
            let receiver = receiver.clone();
            // On failure `scheduler` drops here and joins the workers
            // spawned so far.
            let worker = thread::Builder::new()
                .name(format!("{thread_name}-{index}"))
                .spawn(move || work(&receiver))?;
            scheduler
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker);
        }

        log::debug!("build: started {worker_threads} workers named {thread_name}-*");

        Ok(scheduler)
    }
}

fn work(receiver: &flume::Receiver<Continuation>) {
    log::trace!("worker started");

    while let Ok(continuation) = receiver.recv() {
        continuation.resume();
    }

    log::trace!("worker stopped");
}

/// The channel end jobs bound to the pool resume through.
struct Queue {
    sender: RwLock<Option<flume::Sender<Continuation>>>,
}

impl Scheduler for Queue {
    fn resume(&self, continuation: Continuation) {
        let rejected = {
            let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
            match sender.as_ref() {
                Some(sender) => sender.send(continuation).err().map(flume::SendError::into_inner),
                None => Some(continuation),
            }
        };

        if let Some(continuation) = rejected {
            log::debug!(
                "resume: pool is shut down, resuming job={} inline",
                continuation.id()
            );
            continuation.resume();
        }
    }
}

/// Resumes jobs on a fixed set of worker threads fed by one shared channel.
///
/// Dropping the scheduler shuts it down: the channel is closed, the workers
/// drain what was already queued and are joined. Jobs woken after shutdown
/// resume inline on the waking thread.
pub struct ThreadpoolScheduler {
    queue: Arc<Queue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadpoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadpoolScheduler")
            .field("worker_count", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl ThreadpoolScheduler {
    /// Starts a pool of `worker_threads` workers with the default thread
    /// name.
    ///
    /// # Errors
    ///
    /// * [`Error::NoWorkers`] if `worker_threads` is zero
    /// * [`Error::IO`] if a worker thread fails to spawn
    pub fn new(worker_threads: usize) -> Result<Self, Error> {
        Builder::new().worker_threads(worker_threads).build()
    }

    /// Number of workers still attached to the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Closes the queue and joins every worker once it has drained.
    ///
    /// Idempotent. A worker calling this on its own pool is not joined.
    pub fn shutdown(&self) {
        let sender = self
            .queue
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }

        log::debug!("shutdown: joining {} workers", workers.len());

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("shutdown: worker panicked");
            }
        }
    }
}

impl Scheduler for ThreadpoolScheduler {
    fn resume(&self, continuation: Continuation) {
        self.queue.resume(continuation);
    }
}

impl Spawner for ThreadpoolScheduler {
    fn handle(&self) -> SchedulerRef {
        self.queue.clone()
    }
}

impl Drop for ThreadpoolScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Fence;

    #[test_log::test]
    fn zero_workers_is_rejected() {
        assert!(matches!(ThreadpoolScheduler::new(0), Err(Error::NoWorkers)));
    }

    #[test_log::test]
    fn jobs_run_on_named_workers() {
        let scheduler = Builder::new()
            .worker_threads(2)
            .thread_name("pool-test")
            .build()
            .unwrap();
        assert_eq!(scheduler.worker_count(), 2);

        let name = scheduler
            .enqueue_future(|| thread::current().name().map(ToString::to_string))
            .get()
            .unwrap();

        assert!(name.is_some_and(|name| name.starts_with("pool-test-")));
    }

    #[test_log::test]
    fn every_enqueued_job_runs_before_shutdown_returns() {
        let scheduler = ThreadpoolScheduler::new(4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let ran = ran.clone();
            scheduler.enqueue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 100);
        assert_eq!(scheduler.worker_count(), 0);
    }

    #[test_log::test]
    fn job_woken_after_shutdown_resumes_inline() {
        let scheduler = ThreadpoolScheduler::new(1).unwrap();
        let fence = Arc::new(Fence::new(0));
        let resumed_on = Arc::new(std::sync::Mutex::new(None));

        {
            let fence = fence.clone();
            let resumed_on = resumed_on.clone();
            scheduler.enqueue(async move {
                fence.wait(1).await;
                *resumed_on.lock().unwrap() = Some(thread::current().id());
            });
        }
        drop(scheduler);

        fence.signal(1);

        assert_eq!(*resumed_on.lock().unwrap(), Some(thread::current().id()));
    }

    #[test_log::test]
    fn builder_from_env_uses_defaults_when_unset() {
        let builder = Builder::from_env().unwrap();

        assert!(builder.worker_threads.is_some_and(|count| count >= 1));
        assert!(builder.thread_name.is_some());
    }
}
