//! Monotonic counter that parks waiters until it reaches their target value.
//!
//! The fence is the foundation of the result-carrying types in this crate: a
//! [`crate::Future`] signals its fence with `1` once the value is stored, and
//! every awaiter or blocked thread is released by that signal.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use crate::{
    node::{self, GRANTED, NIL, WAITING, WaitNode},
    spin::SpinLock,
};

/// A monotonically increasing `u64` with an intrusive list of parked waiters.
///
/// The value and the list are protected by one spin lock; the value is
/// mirrored in an atomic so [`Fence::try_wait`] never takes the lock.
pub struct Fence {
    value: AtomicU64,
    waiters: SpinLock<u32>,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Fence {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
            waiters: SpinLock::new(NIL),
        }
    }

    /// Current value of the fence.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Raises the fence to `value` and releases every waiter whose target is
    /// now reached.
    ///
    /// A `value` below the current one is ignored: the fence never moves
    /// backwards. Wakers are invoked after the lock is released.
    pub fn signal(&self, value: u64) {
        let mut released = vec![];

        {
            let mut head = self.waiters.lock();
            let current = self.value.load(Ordering::Relaxed);
            if current > value {
                log::trace!("signal: ignoring value={value} below current={current}");
                return;
            }
            self.value.store(value, Ordering::Release);

            let mut previous = NIL;
            let mut index = *head;
            while index != NIL {
                let waiter = node::node(index);
                let next = waiter.next.load(Ordering::Relaxed);

                if waiter.target.load(Ordering::Relaxed) <= value {
                    if previous == NIL {
                        *head = next;
                    } else {
                        node::node(previous).next.store(next, Ordering::Relaxed);
                    }
                    waiter.next.store(NIL, Ordering::Relaxed);

                    let mut waker = waiter.waker.lock();
                    waiter.state.store(GRANTED, Ordering::Release);
                    if let Some(waker) = waker.take() {
                        released.push(waker);
                    }
                } else {
                    previous = index;
                }

                index = next;
            }
        }

        log::trace!("signal: value={value} released={}", released.len());

        for waker in released {
            waker.wake();
        }
    }

    /// Returns an awaitable that completes once the fence reaches `value`.
    #[must_use]
    pub const fn wait(&self, value: u64) -> FenceWait<'_> {
        FenceWait {
            fence: self,
            target: value,
            slot: None,
        }
    }

    /// Non-suspending check: has the fence reached `value`?
    #[must_use]
    pub fn try_wait(&self, value: u64) -> bool {
        self.value() >= value
    }

    /// Blocks the calling thread until the fence reaches `value`.
    pub fn wait_explicit(&self, value: u64) {
        if self.try_wait(value) {
            return;
        }

        log::trace!("wait_explicit: blocking until value={value}");
        crate::blocking::block_on(self.wait(value));
    }

    /// Polls a wait on this fence. `slot` holds the waiter's node between
    /// polls and is cleared once the wait completes.
    pub(crate) fn poll_wait(
        &self,
        slot: &mut Option<u32>,
        target: u64,
        cx: &Context<'_>,
    ) -> Poll<()> {
        if let Some(index) = *slot {
            WaitNode::register(&mut node::node(index).waker.lock(), cx.waker());
        }

        if self.try_wait(target) {
            self.cancel_wait(slot);
            return Poll::Ready(());
        }

        if slot.is_some() {
            return Poll::Pending;
        }

        let mut head = self.waiters.lock();
        if self.value.load(Ordering::Relaxed) >= target {
            return Poll::Ready(());
        }

        let index = node::alloc();
        let waiter = node::node(index);
        waiter.target.store(target, Ordering::Relaxed);
        waiter.state.store(WAITING, Ordering::Relaxed);
        WaitNode::register(&mut waiter.waker.lock(), cx.waker());
        waiter.next.store(*head, Ordering::Relaxed);
        *head = index;
        drop(head);

        *slot = Some(index);

        Poll::Pending
    }

    /// Unlinks (if still linked) and frees the waiter node held in `slot`.
    pub(crate) fn cancel_wait(&self, slot: &mut Option<u32>) {
        let Some(index) = slot.take() else {
            return;
        };

        {
            let mut head = self.waiters.lock();
            if node::node(index).state.load(Ordering::Relaxed) == WAITING {
                let next = node::node(index).next.load(Ordering::Relaxed);
                if *head == index {
                    *head = next;
                } else {
                    let mut previous = *head;
                    while previous != NIL {
                        let current = node::node(previous);
                        let following = current.next.load(Ordering::Relaxed);
                        if following == index {
                            current.next.store(next, Ordering::Relaxed);
                            break;
                        }
                        previous = following;
                    }
                }
            }
        }

        node::free(index);
    }
}

/// Awaitable returned by [`Fence::wait`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FenceWait<'a> {
    fence: &'a Fence,
    target: u64,
    slot: Option<u32>,
}

impl fmt::Debug for FenceWait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceWait")
            .field("fence", &self.fence)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Future for FenceWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        this.fence.poll_wait(&mut this.slot, this.target, cx)
    }
}

impl Drop for FenceWait<'_> {
    fn drop(&mut self) {
        self.fence.cancel_wait(&mut self.slot);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        task::{Context, Poll},
        time::Duration,
    };

    use futures::task::{ArcWake, noop_waker};
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct CountingWaker {
        wakes: AtomicUsize,
    }

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test_log::test]
    fn signal_never_decreases_value() {
        let fence = Fence::new(0);

        fence.signal(5);
        fence.signal(3);

        assert_eq!(fence.value(), 5);
        assert!(fence.try_wait(5));
        assert!(!fence.try_wait(6));
    }

    #[test_log::test]
    fn wait_on_reached_value_is_immediately_ready() {
        let fence = Fence::new(4);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = fence.wait(4);

        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
    }

    #[test_log::test]
    fn signal_releases_only_satisfied_waiters() {
        let fence = Fence::new(0);
        let counter = Arc::new(CountingWaker::default());
        let waker = futures::task::waker(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let mut low = fence.wait(2);
        let mut high = fence.wait(4);
        assert_eq!(Pin::new(&mut low).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut high).poll(&mut cx), Poll::Pending);

        fence.signal(3);

        assert_eq!(counter.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut low).poll(&mut cx), Poll::Ready(()));
        assert_eq!(Pin::new(&mut high).poll(&mut cx), Poll::Pending);

        fence.signal(4);

        assert_eq!(counter.wakes.load(Ordering::SeqCst), 2);
        assert_eq!(Pin::new(&mut high).poll(&mut cx), Poll::Ready(()));
    }

    #[test_log::test]
    fn equal_signal_keeps_value_and_releases_nothing_new() {
        let fence = Fence::new(2);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = fence.wait(3);
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);

        fence.signal(2);

        assert_eq!(fence.value(), 2);
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);
    }

    #[test_log::test]
    fn dropped_waiter_is_unlinked() {
        let fence = Fence::new(0);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first = fence.wait(1);
        let mut second = fence.wait(1);
        let mut third = fence.wait(1);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut third).poll(&mut cx), Poll::Pending);

        drop(second);
        fence.signal(1);

        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(()));
        assert_eq!(Pin::new(&mut third).poll(&mut cx), Poll::Ready(()));
        assert_eq!(*fence.waiters.lock(), NIL);
    }

    #[test_log::test]
    fn wait_explicit_is_released_by_another_thread() {
        let fence = Arc::new(Fence::new(0));

        let signaller = {
            let fence = fence.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                fence.signal(1);
            })
        };

        fence.wait_explicit(1);

        assert_eq!(fence.value(), 1);
        signaller.join().unwrap();
    }

    #[test_log::test]
    fn many_threads_wait_for_one_signal() {
        let fence = Arc::new(Fence::new(0));

        let waiters = (0..8_u64)
            .map(|target| {
                let fence = fence.clone();
                std::thread::spawn(move || {
                    fence.wait_explicit(target % 3 + 1);
                })
            })
            .collect::<Vec<_>>();

        fence.signal(3);

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
