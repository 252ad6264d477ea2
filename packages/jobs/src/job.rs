//! Jobs: boxed futures bound to the scheduler that resumes them.
//!
//! A job's waker never polls the job itself. It hands a [`Continuation`] to
//! the job's scheduler (or polls inline when the job is unbound), so every
//! primitive in this crate resumes its waiters through the right policy just
//! by waking them.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc, LazyLock, Mutex, PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    task::{Context, Poll, Wake, Waker},
};

use futures::FutureExt as _;
use scoped_tls::scoped_thread_local;

use crate::scheduler::SchedulerRef;

static JOB_ID: LazyLock<AtomicU64> = LazyLock::new(|| AtomicU64::new(1));

scoped_thread_local! {
    static CURRENT: Option<SchedulerRef>
}

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(crate) struct Job {
    id: u64,
    scheduler: Option<SchedulerRef>,
    state: AtomicU8,
    future: Mutex<Option<BoxedJob>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("scheduled", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

impl Job {
    fn new(
        future: impl Future<Output = ()> + Send + 'static,
        scheduler: Option<SchedulerRef>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: JOB_ID.fetch_add(1, Ordering::SeqCst),
            scheduler,
            state: AtomicU8::new(SCHEDULED),
            future: Mutex::new(Some(Box::pin(future))),
        })
    }

    /// Hands the job to its scheduler, or polls it right here when unbound.
    fn dispatch(self: Arc<Self>) {
        match self.scheduler.clone() {
            Some(scheduler) => scheduler.resume(Continuation { job: self }),
            None => self.run(),
        }
    }

    fn run(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            let poll = CURRENT.set(&self.scheduler, || {
                let mut future = self.future.lock().unwrap_or_else(PoisonError::into_inner);
                let poll = future
                    .as_mut()
                    .map_or(Poll::Ready(()), |future| future.as_mut().poll(&mut cx));
                if poll.is_ready() {
                    future.take();
                }
                poll
            });

            if poll.is_ready() {
                self.state.store(COMPLETE, Ordering::Release);
                log::trace!("job {} complete", self.id);
                return;
            }

            // Woken while running: poll again on this thread instead of
            // handing the job to a second one.
            if self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            self.state.store(RUNNING, Ordering::Release);
        }
    }

    fn schedule(self: Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);

        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };

            match self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next == SCHEDULED {
                        self.dispatch();
                    }
                    return;
                }
                Err(current) => state = current,
            }
        }
    }
}

impl Wake for Job {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().schedule();
    }
}

/// Resumption handle of a suspended job.
///
/// A [`crate::Scheduler`] receives one of these every time a job it owns
/// becomes runnable, and decides where [`Continuation::resume`] is called.
pub struct Continuation {
    job: Arc<Job>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("job", &self.job)
            .finish()
    }
}

impl Continuation {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.job.id
    }

    /// Polls the job on the calling thread until it completes or suspends.
    pub fn resume(self) {
        self.job.run();
    }
}

/// Creates a job bound to `scheduler` and starts it.
pub(crate) fn spawn(
    future: impl Future<Output = ()> + Send + 'static,
    scheduler: Option<SchedulerRef>,
) {
    let job = Job::new(future, scheduler);
    log::trace!("spawn job={}", job.id);
    job.dispatch();
}

/// Starts a job nobody will observe. A panic inside it has nowhere to go and
/// aborts the process.
pub(crate) fn spawn_detached(
    future: impl Future<Output = ()> + Send + 'static,
    scheduler: Option<SchedulerRef>,
) {
    spawn(
        async move {
            if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
                unobserved_panic(panic.as_ref());
            }
        },
        scheduler,
    );
}

pub(crate) fn unobserved_panic(payload: &(dyn Any + Send)) -> ! {
    log::error!(
        "job panicked with no awaiter, aborting: {}",
        panic_message(payload)
    );
    std::process::abort()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "Box<dyn Any>".to_string())
        },
        |message| (*message).to_string(),
    )
}

/// Scheduler of the job being polled on this thread, if any.
pub(crate) fn current_scheduler() -> Option<SchedulerRef> {
    if CURRENT.is_set() {
        CURRENT.with(Clone::clone)
    } else {
        None
    }
}

/// Something that can run as a job: a future, or a plain closure that runs on
/// the job's first poll.
///
/// The `Marker` parameter only keeps the two blanket implementations apart
/// and is always inferred.
pub trait IntoJob<Marker>: Send + 'static {
    type Output: Send + 'static;
    type Future: Future<Output = Self::Output> + Send + 'static;

    fn into_job(self) -> Self::Future;
}

#[doc(hidden)]
#[derive(Debug)]
pub struct AsyncJob;

#[doc(hidden)]
#[derive(Debug)]
pub struct CallJob;

impl<F> IntoJob<AsyncJob> for F
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    type Output = F::Output;
    type Future = F;

    fn into_job(self) -> Self::Future {
        self
    }
}

impl<F, R> IntoJob<CallJob> for F
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    type Output = R;
    type Future = Call<F>;

    fn into_job(self) -> Self::Future {
        Call { func: Some(self) }
    }
}

/// Future that calls a closure on its first poll.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Call<F> {
    func: Option<F>,
}

impl<F> fmt::Debug for Call<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("called", &self.func.is_none())
            .finish()
    }
}

// `func` is moved out, never pinned.
impl<F> Unpin for Call<F> {}

impl<F, R> Future for Call<F>
where
    F: FnOnce() -> R,
{
    type Output = R;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<R> {
        let Some(func) = self.func.take() else {
            panic!("call polled after completion");
        };
        Poll::Ready(func())
    }
}
