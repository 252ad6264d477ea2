//! Resumption policies.
//!
//! A [`Scheduler`] decides which thread resumes a job once it becomes
//! runnable. Jobs carry their scheduler explicitly, and every primitive in
//! this crate resumes a waiter simply by waking it, so the policy is invisible
//! to the primitives themselves.

use std::sync::Arc;

use crate::{
    future::Future,
    job::{self, IntoJob},
    task::Task,
};

pub use crate::job::Continuation;

pub mod immediate;
#[cfg(feature = "threadpool")]
pub mod threadpool;

pub use immediate::ImmediateScheduler;
#[cfg(feature = "threadpool")]
pub use threadpool::{Builder, ThreadpoolScheduler};

/// Shared handle to a scheduler, as carried by every bound job.
pub type SchedulerRef = Arc<dyn Scheduler>;

pub trait Scheduler: Send + Sync + 'static {
    /// Resumes a runnable job according to this scheduler's policy.
    fn resume(&self, continuation: Continuation);
}

/// Launches jobs bound to a scheduler.
///
/// A job is either a future or a plain `FnOnce` closure, which runs on the
/// job's first poll.
pub trait Spawner {
    /// Shared handle to the scheduler new jobs are bound to.
    fn handle(&self) -> SchedulerRef;

    /// Starts `job` without any way to observe it.
    ///
    /// A panic inside the job aborts the process.
    fn enqueue<M, J: IntoJob<M>>(&self, job: J) {
        let job = job.into_job();
        job::spawn_detached(
            async move {
                job.await;
            },
            Some(self.handle()),
        );
    }

    /// Wraps `job` in a [`Task`] bound to this scheduler. The task starts
    /// when it is run or awaited.
    fn enqueue_task<M, J: IntoJob<M>>(&self, job: J) -> Task<J::Output> {
        Task::with_scheduler(job.into_job(), Some(self.handle()))
    }

    /// Starts `job` on this scheduler and returns a [`Future`] for its
    /// result.
    fn enqueue_future<M, J: IntoJob<M>>(&self, job: J) -> Future<J::Output>
    where
        J::Output: Sync,
    {
        let future = Future::with_scheduler(job.into_job(), Some(self.handle()));
        future.run();
        future
    }
}

impl Spawner for SchedulerRef {
    fn handle(&self) -> SchedulerRef {
        self.clone()
    }
}

/// Scheduler of the job being polled on this thread, if it is bound to one.
#[must_use]
pub fn current() -> Option<SchedulerRef> {
    job::current_scheduler()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;

    use super::*;

    /// Queues continuations until the test resumes them by hand.
    #[derive(Default)]
    struct Manual {
        queue: Mutex<Vec<Continuation>>,
    }

    impl Manual {
        fn run_all(&self) -> usize {
            let mut resumed = 0;
            loop {
                let next = self.queue.lock().unwrap().pop();
                let Some(continuation) = next else {
                    return resumed;
                };
                continuation.resume();
                resumed += 1;
            }
        }
    }

    impl Scheduler for Manual {
        fn resume(&self, continuation: Continuation) {
            self.queue.lock().unwrap().push(continuation);
        }
    }

    #[test_log::test]
    fn enqueue_hands_the_job_to_the_scheduler() {
        let manual = Arc::new(Manual::default());
        let scheduler: SchedulerRef = manual.clone();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();
            scheduler.enqueue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(manual.run_all(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn enqueue_future_starts_immediately_and_resolves_through_the_scheduler() {
        let manual = Arc::new(Manual::default());
        let scheduler: SchedulerRef = manual.clone();

        let future = scheduler.enqueue_future(|| 42);
        assert!(!future.ready());

        manual.run_all();

        assert!(future.ready());
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test_log::test]
    fn enqueue_task_waits_until_run() {
        let manual = Arc::new(Manual::default());
        let scheduler: SchedulerRef = manual.clone();

        let mut task = scheduler.enqueue_task(async { 1 });
        assert_eq!(manual.run_all(), 0);

        task.run().unwrap();
        assert_eq!(manual.run_all(), 1);
    }

    #[test_log::test]
    fn current_is_the_scheduler_polling_the_job() {
        let manual = Arc::new(Manual::default());
        let scheduler: SchedulerRef = manual.clone();
        let seen = Arc::new(AtomicUsize::new(0));

        {
            let seen = seen.clone();
            let expected = scheduler.clone();
            scheduler.enqueue(move || {
                if current().is_some_and(|current| Arc::ptr_eq(&current, &expected)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        manual.run_all();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(current().is_none());
    }
}
