//! Single-owner, lazily started computations.
//!
//! A [`Task`] does nothing until it is run or joined, and it can be consumed
//! exactly once: either launched without an observer ([`Task::run`]) or
//! awaited by a single continuation ([`Task::join`]). Every further use
//! reports a [`TaskError`].

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{FutureExt as _, channel::oneshot, future::BoxFuture};

use crate::{
    job,
    scheduler::{SchedulerRef, Spawner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Cannot schedule a detached task")]
    ScheduleDetached,
    #[error("Cannot run a detached task")]
    RunDetached,
    #[error("Cannot await a detached task")]
    AwaitDetached,
}

enum TaskState<T> {
    Owned {
        body: BoxFuture<'static, T>,
        scheduler: Option<SchedulerRef>,
    },
    Done(T),
    Detached,
}

/// A lazily started computation with a single owner and at most one
/// continuation.
///
/// # Panics
///
/// Dropping a task that was never run nor joined panics.
pub struct Task<T> {
    state: TaskState<T>,
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            TaskState::Owned { scheduler, .. } => {
                if scheduler.is_some() {
                    "scheduled"
                } else {
                    "created"
                }
            }
            TaskState::Done(_) => "done",
            TaskState::Detached => "detached",
        };

        f.debug_struct("Task").field("state", &state).finish()
    }
}

impl<T: Send + 'static> Task<T> {
    pub fn new(future: impl Future<Output = T> + Send + 'static) -> Self {
        Self::with_scheduler(future, None)
    }

    pub(crate) fn with_scheduler(
        future: impl Future<Output = T> + Send + 'static,
        scheduler: Option<SchedulerRef>,
    ) -> Self {
        Self {
            state: TaskState::Owned {
                body: Box::pin(future),
                scheduler,
            },
        }
    }

    /// Binds the task to `scheduler`: it will start, and resume after every
    /// suspension, through that scheduler.
    ///
    /// # Errors
    ///
    /// * [`TaskError::ScheduleDetached`] if the task was already run or joined
    pub fn schedule(&mut self, scheduler: &impl Spawner) -> Result<(), TaskError> {
        match &mut self.state {
            TaskState::Owned { scheduler: bound, .. } => {
                *bound = Some(scheduler.handle());
                Ok(())
            }
            TaskState::Done(_) | TaskState::Detached => Err(TaskError::ScheduleDetached),
        }
    }

    /// Launches the task without a continuation.
    ///
    /// A scheduled task is handed to its scheduler. An unscheduled one is
    /// polled on the calling thread, and if it completes right away its value
    /// stays in the task for a later [`Task::join`].
    ///
    /// A panic inside a task that nobody joins aborts the process.
    ///
    /// # Errors
    ///
    /// * [`TaskError::RunDetached`] if the task was already run or joined
    pub fn run(&mut self) -> Result<(), TaskError> {
        let (body, scheduler) = match std::mem::replace(&mut self.state, TaskState::Detached) {
            TaskState::Owned { body, scheduler } => (body, scheduler),
            other => {
                self.state = other;
                return Err(TaskError::RunDetached);
            }
        };

        let (tx, mut rx) = oneshot::channel();
        if scheduler.is_some() {
            drop(rx);
            job::spawn(complete(body, tx), scheduler);
            return Ok(());
        }

        job::spawn(complete(body, tx), None);
        // Anything sent after this point has no observer.
        rx.close();
        match rx.try_recv() {
            Ok(Some(Ok(value))) => {
                log::trace!("run: task completed inline");
                self.state = TaskState::Done(value);
            }
            Ok(Some(Err(panic))) => job::unobserved_panic(panic.as_ref()),
            Ok(None) | Err(oneshot::Canceled) => {}
        }

        Ok(())
    }

    /// Registers the caller as the task's continuation.
    ///
    /// The returned [`Join`] starts the task on its first poll and resolves
    /// to the task's value. A panic inside the task resumes in the caller's
    /// poll.
    ///
    /// # Errors
    ///
    /// * [`TaskError::AwaitDetached`] if the task was already joined, or was
    ///   run without completing inline
    pub fn join(&mut self) -> Result<Join<T>, TaskError> {
        let state = match std::mem::replace(&mut self.state, TaskState::Detached) {
            TaskState::Owned { body, scheduler } => JoinState::Unstarted { body, scheduler },
            TaskState::Done(value) => JoinState::Ready(value),
            TaskState::Detached => return Err(TaskError::AwaitDetached),
        };

        Ok(Join { state })
    }
}

impl<T> Task<T> {
    /// `true` once the task has completed and joining it will not suspend.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, TaskState::Done(_))
    }

    #[must_use]
    pub const fn is_detached(&self) -> bool {
        matches!(self.state, TaskState::Detached)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if matches!(self.state, TaskState::Owned { .. }) && !std::thread::panicking() {
            panic!("task dropped without being run or awaited");
        }
    }
}

type Outcome<T> = std::thread::Result<T>;

async fn complete<T>(body: BoxFuture<'static, T>, tx: oneshot::Sender<Outcome<T>>) {
    let outcome = AssertUnwindSafe(body).catch_unwind().await;
    if let Err(Err(panic)) = tx.send(outcome) {
        job::unobserved_panic(panic.as_ref());
    }
}

enum JoinState<T> {
    Ready(T),
    Unstarted {
        body: BoxFuture<'static, T>,
        scheduler: Option<SchedulerRef>,
    },
    Running(oneshot::Receiver<Outcome<T>>),
    Finished,
}

/// Awaitable returned by [`Task::join`].
#[must_use = "dropping a join without polling it drops an unstarted task"]
pub struct Join<T> {
    state: JoinState<T>,
}

// The value is only ever moved out, never pinned.
impl<T> Unpin for Join<T> {}

impl<T> fmt::Debug for Join<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            JoinState::Ready(_) => "ready",
            JoinState::Unstarted { .. } => "unstarted",
            JoinState::Running(_) => "running",
            JoinState::Finished => "finished",
        };

        f.debug_struct("Join").field("state", &state).finish()
    }
}

impl<T: Send + 'static> Future for Join<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;

        let mut rx = match std::mem::replace(&mut this.state, JoinState::Finished) {
            JoinState::Ready(value) => return Poll::Ready(value),
            JoinState::Unstarted { body, scheduler } => {
                let (tx, rx) = oneshot::channel();
                job::spawn(complete(body, tx), scheduler);
                rx
            }
            JoinState::Running(rx) => rx,
            JoinState::Finished => panic!("join polled after completion"),
        };

        match Pin::new(&mut rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(value),
            Poll::Ready(Ok(Err(panic))) => std::panic::resume_unwind(panic),
            Poll::Ready(Err(oneshot::Canceled)) => {
                panic!("task was dropped before it completed")
            }
            Poll::Pending => {
                this.state = JoinState::Running(rx);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Join<T> {
    fn drop(&mut self) {
        match &mut self.state {
            JoinState::Unstarted { .. } => {
                if !std::thread::panicking() {
                    panic!("task dropped without being run or awaited");
                }
            }
            JoinState::Running(rx) => {
                rx.close();
                if let Ok(Some(Err(panic))) = rx.try_recv() {
                    job::unobserved_panic(panic.as_ref());
                }
            }
            JoinState::Ready(_) | JoinState::Finished => {}
        }
    }
}
