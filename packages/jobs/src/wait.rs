//! Combinators over several awaitables.

use std::{
    fmt,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
};

use futures::{FutureExt as _, future::BoxFuture};
use pin_project_lite::pin_project;

use crate::{Fence, job};

const NO_WINNER: usize = usize::MAX;

struct Race {
    winner: AtomicUsize,
    fence: Fence,
}

impl fmt::Debug for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Race")
            .field("winner", &self.winner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// Records its index as the winner of `race` once `future` completes.
    struct Signal<F> {
        #[pin]
        future: F,
        index: usize,
        race: Arc<Race>,
    }
}

impl<F: Future> Future for Signal<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        ready!(this.future.poll(cx));

        if this
            .race
            .winner
            .compare_exchange(NO_WINNER, *this.index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::trace!("wait_any: index {} finished first", this.index);
            this.race.fence.signal(1);
        }

        Poll::Ready(())
    }
}

/// Waits for the first of `awaitables` to complete and returns its index, or
/// `None` when there is nothing to wait for.
///
/// Every awaitable is driven by its own job on the current scheduler (inline
/// when the caller is not bound to one). The ones that lose the race keep
/// running to completion and their outputs are discarded. A panic inside one
/// of them aborts the process.
pub async fn wait_any<I>(awaitables: I) -> Option<usize>
where
    I: IntoIterator,
    I::Item: IntoFuture,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    let race = Arc::new(Race {
        winner: AtomicUsize::new(NO_WINNER),
        fence: Fence::new(0),
    });
    let scheduler = job::current_scheduler();

    let mut launched = 0_usize;
    for (index, awaitable) in awaitables.into_iter().enumerate() {
        job::spawn_detached(
            Signal {
                future: awaitable.into_future(),
                index,
                race: race.clone(),
            },
            scheduler.clone(),
        );
        launched += 1;
    }

    if launched == 0 {
        return None;
    }

    race.fence.wait(1).await;

    Some(race.winner.load(Ordering::Acquire))
}

/// Awaits every awaitable in turn and collects the outputs in order.
///
/// This composes waiting only: awaitables that were not already started
/// elsewhere run one after the other.
pub async fn wait_all<I>(awaitables: I) -> Vec<<I::Item as IntoFuture>::Output>
where
    I: IntoIterator,
    I::Item: IntoFuture,
{
    let awaitables = awaitables.into_iter();
    let mut outputs = Vec::with_capacity(awaitables.size_hint().0);

    for awaitable in awaitables {
        outputs.push(awaitable.await);
    }

    outputs
}

/// Erases an awaitable's output so awaitables of different types can race in
/// [`wait_any!`](crate::wait_any!).
#[doc(hidden)]
pub fn erase<A>(awaitable: A) -> BoxFuture<'static, ()>
where
    A: IntoFuture,
    A::IntoFuture: Send + 'static,
    A::Output: 'static,
{
    Box::pin(awaitable.into_future().map(drop))
}

/// Awaits each of a fixed set of awaitables in turn and yields a tuple of
/// their outputs.
///
/// ```
/// # futures::executor::block_on(async {
/// let (number, text) = switchy_jobs::wait_all!(async { 1 }, async { "two" }).await;
/// assert_eq!((number, text), (1, "two"));
/// # });
/// ```
#[macro_export]
macro_rules! wait_all {
    ($($awaitable:expr),+ $(,)?) => {
        async move { ($(($awaitable).await,)+) }
    };
}

/// Races a fixed set of awaitables of any output type and yields the index of
/// the first to finish. See [`wait_any`](crate::wait_any()).
#[macro_export]
macro_rules! wait_any {
    ($($awaitable:expr),+ $(,)?) => {
        $crate::wait_any([$($crate::wait::erase($awaitable)),+])
    };
}
