//! Reference-counted results that both jobs and plain threads can wait on.
//!
//! A [`Future`] owns a lazily started producer, or is fed by a [`Promise`].
//! Either way the value lands in a shared state whose [`Fence`] is signalled
//! with `1` once it is stored, which releases every awaiter and every thread
//! blocked in [`Future::wait`].

use std::{
    error::Error as StdError,
    fmt,
    future::IntoFuture,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
};

use futures::{FutureExt as _, future::BoxFuture};

use crate::{
    Fence, job,
    scheduler::{SchedulerRef, Spawner},
};

/// Why a [`Future`] holds no value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job panicked: {0}")]
    Panicked(String),
    #[error("Job failed: {0}")]
    Failed(Arc<dyn StdError + Send + Sync>),
    #[error("Promise dropped without a value")]
    BrokenPromise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    #[error("Future already retrieved from this promise")]
    AlreadyRetrieved,
    #[error("Future already started")]
    AlreadyStarted,
}

struct Producer {
    body: BoxFuture<'static, ()>,
    scheduler: Option<SchedulerRef>,
}

struct SharedState<T> {
    fence: Fence,
    outcome: Mutex<Option<Result<T, JobError>>>,
    shared: OnceLock<Result<T, JobError>>,
    started: AtomicBool,
    producer: Mutex<Option<Producer>>,
}

impl<T> SharedState<T> {
    fn new(started: bool) -> Arc<Self> {
        Arc::new(Self {
            fence: Fence::new(0),
            outcome: Mutex::new(None),
            shared: OnceLock::new(),
            started: AtomicBool::new(started),
            producer: Mutex::new(None),
        })
    }

    fn fulfil(&self, outcome: Result<T, JobError>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.fence.signal(1);
    }

    /// Launches the producer if nobody has yet.
    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Producer { body, scheduler }) = producer {
            job::spawn(body, scheduler);
        }
    }

    /// Drops a producer that never started, breaking the cycle between this
    /// state and the promise captured by the producer. Returns `false` if the
    /// producer had already started.
    fn abandon(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(producer);

        true
    }

    fn bind(&self, scheduler: SchedulerRef) -> Result<(), FutureError> {
        // The producer leaves the slot when it starts.
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        let producer = producer.as_mut().ok_or(FutureError::AlreadyStarted)?;
        producer.scheduler = Some(scheduler);

        Ok(())
    }

    fn ready(&self) -> bool {
        self.fence.try_wait(1)
    }

    fn wait(&self) {
        self.start();
        self.fence.wait_explicit(1);
    }

    fn take(&self) -> Result<T, JobError> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(Err(JobError::BrokenPromise))
    }

    fn shared(&self) -> &Result<T, JobError> {
        self.shared.get_or_init(|| self.take())
    }
}

/// Producer side of a [`Future`] that is completed by hand.
///
/// Dropping a promise without setting it completes its future with
/// [`JobError::BrokenPromise`].
pub struct Promise<T> {
    state: Option<Arc<SharedState<T>>>,
    retrieved: bool,
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("retrieved", &self.retrieved)
            .finish_non_exhaustive()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Some(SharedState::new(true)),
            retrieved: false,
        }
    }

    /// The future this promise completes.
    ///
    /// # Errors
    ///
    /// * [`FutureError::AlreadyRetrieved`] on every call after the first
    pub fn future(&mut self) -> Result<Future<T>, FutureError> {
        if self.retrieved {
            return Err(FutureError::AlreadyRetrieved);
        }
        let Some(state) = self.state.clone() else {
            return Err(FutureError::AlreadyRetrieved);
        };
        self.retrieved = true;

        Ok(Future {
            state,
            armed: false,
        })
    }

    pub fn set_value(mut self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_error(mut self, error: impl StdError + Send + Sync + 'static) {
        self.complete(Err(JobError::Failed(Arc::new(error))));
    }

    fn complete(&mut self, outcome: Result<T, JobError>) {
        if let Some(state) = self.state.take() {
            state.fulfil(outcome);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.state.is_some() {
            log::debug!("promise dropped without a value");
            self.complete(Err(JobError::BrokenPromise));
        }
    }
}

/// Owner of a single result, awaitable from a job or waitable from a thread.
///
/// # Panics
///
/// Dropping a future whose producer was never started panics: a future
/// created with [`Future::new`] must be run, waited on or awaited.
pub struct Future<T> {
    state: Arc<SharedState<T>>,
    armed: bool,
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.state.ready())
            .field("started", &self.state.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Wraps `future` as a lazily started producer. Nothing runs until the
    /// future is run, waited on or awaited.
    pub fn new(future: impl std::future::Future<Output = T> + Send + 'static) -> Self {
        Self::with_scheduler(future, None)
    }

    pub(crate) fn with_scheduler(
        future: impl std::future::Future<Output = T> + Send + 'static,
        scheduler: Option<SchedulerRef>,
    ) -> Self {
        let state = SharedState::new(false);

        let mut promise = Promise {
            state: Some(state.clone()),
            retrieved: true,
        };
        let body = async move {
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|panic| JobError::Panicked(job::panic_message(panic.as_ref())));
            promise.complete(outcome);
        };

        *state.producer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Producer {
            body: Box::pin(body),
            scheduler,
        });

        Self { state, armed: true }
    }
}

impl<T> Future<T> {
    /// Binds the producer to `scheduler`.
    ///
    /// # Errors
    ///
    /// * [`FutureError::AlreadyStarted`] if the producer already runs
    pub fn schedule(&self, scheduler: &impl Spawner) -> Result<(), FutureError> {
        self.state.bind(scheduler.handle())
    }

    /// Starts the producer. Does nothing if it already started.
    pub fn run(&self) {
        self.state.start();
    }

    /// `true` once the result is stored.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.state.ready()
    }

    /// Starts the producer if needed and blocks the calling thread until the
    /// result is stored.
    pub fn wait(&self) {
        self.state.wait();
    }

    /// Blocks until the result is stored and takes it.
    ///
    /// # Errors
    ///
    /// * [`JobError::Panicked`] if the producer panicked
    /// * [`JobError::Failed`] if the promise was given an error
    /// * [`JobError::BrokenPromise`] if the promise was dropped unset
    pub fn get(self) -> Result<T, JobError> {
        self.state.wait();
        self.state.take()
    }

    /// Converts into a [`SharedFuture`] that any number of owners can read.
    ///
    /// The producer-must-start rule moves to the last [`SharedFuture`] handle.
    #[must_use]
    pub fn share(mut self) -> SharedFuture<T> {
        let armed = std::mem::replace(&mut self.armed, false);
        SharedFuture {
            handle: Arc::new(SharedHandle {
                state: self.state.clone(),
                armed,
            }),
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if self.armed {
            abandon_or_panic(&self.state);
        }
    }
}

fn abandon_or_panic<T>(state: &SharedState<T>) {
    if state.abandon() && !std::thread::panicking() {
        panic!("future dropped without its producer being started");
    }
}

/// Awaitable for [`Future`], resolving to its result.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FutureAwait<T> {
    future: Future<T>,
    slot: Option<u32>,
    done: bool,
}

impl<T> fmt::Debug for FutureAwait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureAwait")
            .field("future", &self.future)
            .finish_non_exhaustive()
    }
}

impl<T> IntoFuture for Future<T> {
    type Output = Result<T, JobError>;
    type IntoFuture = FutureAwait<T>;

    fn into_future(self) -> Self::IntoFuture {
        FutureAwait {
            future: self,
            slot: None,
            done: false,
        }
    }
}

impl<T> std::future::Future for FutureAwait<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        assert!(!this.done, "future awaitable polled after completion");
        let state = &this.future.state;

        state.start();
        ready!(state.fence.poll_wait(&mut this.slot, 1, cx));
        this.done = true;

        Poll::Ready(state.take())
    }
}

impl<T> Drop for FutureAwait<T> {
    fn drop(&mut self) {
        self.future.state.fence.cancel_wait(&mut self.slot);
    }
}

/// Dropped together with the last [`SharedFuture`] clone.
struct SharedHandle<T> {
    state: Arc<SharedState<T>>,
    armed: bool,
}

impl<T> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        if self.armed {
            abandon_or_panic(&self.state);
        }
    }
}

/// Clonable handle to a result that every owner reads by reference.
///
/// # Panics
///
/// Dropping the last handle to a future whose producer was never started
/// panics, as dropping the [`Future`] itself would.
pub struct SharedFuture<T> {
    handle: Arc<SharedHandle<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("ready", &self.state().ready())
            .finish_non_exhaustive()
    }
}

impl<T> SharedFuture<T> {
    fn state(&self) -> &SharedState<T> {
        &self.handle.state
    }

    /// # Errors
    ///
    /// * [`FutureError::AlreadyStarted`] if the producer already runs
    pub fn schedule(&self, scheduler: &impl Spawner) -> Result<(), FutureError> {
        self.state().bind(scheduler.handle())
    }

    pub fn run(&self) {
        self.state().start();
    }

    #[must_use]
    pub fn ready(&self) -> bool {
        self.state().ready()
    }

    pub fn wait(&self) {
        self.state().wait();
    }

    /// Blocks until the result is stored and borrows it.
    ///
    /// # Errors
    ///
    /// * [`JobError::Panicked`] if the producer panicked
    /// * [`JobError::Failed`] if the promise was given an error
    /// * [`JobError::BrokenPromise`] if the promise was dropped unset
    pub fn get(&self) -> Result<&T, JobError> {
        self.state().wait();
        self.state().shared().as_ref().map_err(Clone::clone)
    }
}

/// Awaitable for `&SharedFuture`, resolving to a borrow of its result.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct SharedFutureAwait<'a, T> {
    future: &'a SharedFuture<T>,
    slot: Option<u32>,
}

impl<T> fmt::Debug for SharedFutureAwait<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFutureAwait")
            .field("future", self.future)
            .finish_non_exhaustive()
    }
}

impl<'a, T> IntoFuture for &'a SharedFuture<T> {
    type Output = Result<&'a T, JobError>;
    type IntoFuture = SharedFutureAwait<'a, T>;

    fn into_future(self) -> Self::IntoFuture {
        SharedFutureAwait {
            future: self,
            slot: None,
        }
    }
}

impl<'a, T> std::future::Future for SharedFutureAwait<'a, T> {
    type Output = Result<&'a T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let state: &'a SharedState<T> = this.future.state();

        state.start();
        state
            .fence
            .poll_wait(&mut this.slot, 1, cx)
            .map(|()| state.shared().as_ref().map_err(Clone::clone))
    }
}

impl<T> Drop for SharedFutureAwait<'_, T> {
    fn drop(&mut self) {
        self.future.state().fence.cancel_wait(&mut self.slot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::executor::block_on;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{Continuation, ImmediateScheduler, Scheduler};

    #[derive(Default)]
    struct Counting {
        resumed: AtomicUsize,
    }

    impl Scheduler for Counting {
        fn resume(&self, continuation: Continuation) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
            continuation.resume();
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test_log::test]
    fn future_is_lazy_until_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let future = {
            let runs = runs.clone();
            Future::new(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                3
            })
        };
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!future.ready());

        future.run();
        future.run();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(future.ready());
        assert_eq!(future.get().unwrap(), 3);
    }

    #[test_log::test]
    fn get_starts_the_producer() {
        assert_eq!(Future::new(async { "lazy" }).get().unwrap(), "lazy");
    }

    #[test_log::test]
    fn schedule_after_start_is_rejected() {
        let future = Future::new(async {});
        future.run();

        assert_eq!(
            future.schedule(&ImmediateScheduler::new()).unwrap_err(),
            FutureError::AlreadyStarted
        );
    }

    #[test_log::test]
    fn awaiting_a_future_yields_its_result() {
        let future = Future::new(async { 11 });

        assert_eq!(block_on(future.into_future()).unwrap(), 11);
    }

    #[test_log::test]
    fn panicking_producer_reports_the_panic() {
        let future = Future::new(async {
            if true {
                panic!("producer exploded");
            }
            0_u8
        });

        let error = future.get().unwrap_err();

        assert!(matches!(error, JobError::Panicked(message) if message == "producer exploded"));
    }

    #[test_log::test]
    fn promise_feeds_its_future_across_threads() {
        let mut promise = Promise::new();
        let future = promise.future().unwrap();
        assert_eq!(
            promise.future().unwrap_err(),
            FutureError::AlreadyRetrieved
        );

        let setter = std::thread::spawn(move || promise.set_value(String::from("hello")));

        assert_eq!(future.get().unwrap(), "hello");
        setter.join().unwrap();
    }

    #[test_log::test]
    fn promise_error_and_broken_promise() {
        let mut failing = Promise::<u8>::new();
        let failed = failing.future().unwrap();
        failing.set_error(DiskOnFire);
        assert!(matches!(failed.get(), Err(JobError::Failed(error)) if error.to_string() == "disk on fire"));

        let mut broken = Promise::<u8>::new();
        let abandoned = broken.future().unwrap();
        drop(broken);
        assert!(matches!(abandoned.get(), Err(JobError::BrokenPromise)));
    }

    #[test_log::test]
    fn shared_future_is_read_by_every_clone() {
        let shared = Future::new(async { vec![1, 2, 3] }).share();
        let other = shared.clone();

        assert_eq!(other.get().unwrap(), &vec![1, 2, 3]);
        assert_eq!(shared.get().unwrap(), &vec![1, 2, 3]);
        assert_eq!(block_on((&shared).into_future()).unwrap(), &vec![1, 2, 3]);
    }

    #[test_log::test]
    fn shared_future_awaiters_are_released_together() {
        let mut promise = Promise::new();
        let shared = promise.future().unwrap().share();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first = (&shared).into_future();
        let mut second = (&shared).into_future();
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());

        promise.set_value(9);

        assert!(matches!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(Ok(&9))));
        assert!(matches!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(Ok(&9))));
    }

    #[test_log::test]
    #[should_panic(expected = "future dropped without its producer being started")]
    fn dropping_an_unstarted_future_panics() {
        drop(Future::new(async { 1 }));
    }

    #[test_log::test]
    fn schedule_before_start_binds_the_producer() {
        let counting = Arc::new(Counting::default());
        let scheduler: SchedulerRef = counting.clone();
        let future = Future::new(async { 4 });

        future.schedule(&scheduler).unwrap();

        assert_eq!(future.get().unwrap(), 4);
        assert_eq!(counting.resumed.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn promise_backed_future_cannot_be_scheduled() {
        let mut promise = Promise::<u8>::new();
        let future = promise.future().unwrap();

        assert_eq!(
            future.schedule(&ImmediateScheduler::new()).unwrap_err(),
            FutureError::AlreadyStarted
        );
        promise.set_value(1);
    }

    #[test_log::test]
    #[should_panic(expected = "future awaitable polled after completion")]
    fn polling_a_completed_future_awaitable_panics() {
        let mut awaitable = Future::new(async { 2 }).into_future();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(Pin::new(&mut awaitable).poll(&mut cx), Poll::Ready(Ok(2))));

        let _ = Pin::new(&mut awaitable).poll(&mut cx);
    }

    #[test_log::test]
    fn last_unstarted_shared_handle_releases_the_producer() {
        let captured = Arc::new(());
        let watch = Arc::downgrade(&captured);
        let shared = Future::new(async move {
            let _captured = &captured;
            1
        })
        .share();
        let other = shared.clone();

        drop(shared);
        assert!(watch.upgrade().is_some());

        let dropped = std::panic::catch_unwind(AssertUnwindSafe(|| drop(other)));

        assert!(dropped.is_err());
        assert!(watch.upgrade().is_none());
    }

    #[test_log::test]
    fn started_shared_future_drops_quietly() {
        let shared = Future::new(async { 1 }).share();
        shared.run();

        drop(shared.clone());
        drop(shared);
    }

    #[test_log::test]
    fn racing_observers_start_the_producer_once() {
        const OBSERVERS: usize = 8;

        for _ in 0..50 {
            let runs = Arc::new(AtomicUsize::new(0));
            let shared = {
                let runs = runs.clone();
                Future::new(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    7
                })
                .share()
            };
            let barrier = Arc::new(Barrier::new(OBSERVERS));

            let observers = (0..OBSERVERS)
                .map(|observer| {
                    let shared = shared.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        match observer % 3 {
                            0 => shared.wait(),
                            1 => assert_eq!(shared.get().unwrap(), &7),
                            _ => assert_eq!(block_on((&shared).into_future()).unwrap(), &7),
                        }
                    })
                })
                .collect::<Vec<_>>();
            for observer in observers {
                observer.join().unwrap();
            }

            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert_eq!(shared.get().unwrap(), &7);
        }
    }
}
