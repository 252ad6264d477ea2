//! Wait/notify on top of [`Mutex`].
//!
//! A waiter parks on a lock-free stack of arena nodes and then releases its
//! mutex. Notifying a waiter acquires the waiter's mutex on its behalf: the
//! waiter becomes holder directly when the mutex is free, otherwise its node
//! moves into the mutex's own queue and a later unlock resumes it. A resumed
//! waiter therefore always owns its mutex.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
    task::{Context, Poll},
};

use crate::{
    mutex::{RawMutex, UniqueLock},
    node::{self, ABANDONED, CLAIMED, GRANTED, NIL, PARKED, WAITING, WaitNode},
};

pub struct ConditionVariable {
    head: AtomicU32,
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiting", &(self.head.load(Ordering::Relaxed) != NIL))
            .finish()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
        }
    }

    /// Releases `lock` and suspends until notified. The lock is owned again
    /// when the awaitable completes.
    ///
    /// # Panics
    ///
    /// * If `lock` does not own its mutex when first polled
    pub const fn wait<'a, 'm, T>(
        &'a self,
        lock: &'a mut UniqueLock<'m, T>,
    ) -> Wait<'a, 'm, T, fn(&mut T) -> bool> {
        Wait {
            condvar: self,
            lock,
            predicate: None,
            slot: None,
            state: WaitState::Created,
        }
    }

    /// Like [`ConditionVariable::wait`], but completes immediately without
    /// releasing the lock if `predicate` already holds for the protected
    /// value. Otherwise it suspends exactly once: re-checking after a wakeup
    /// is the caller's job.
    ///
    /// # Panics
    ///
    /// * If `lock` does not own its mutex when first polled
    pub const fn wait_until<'a, 'm, T, P>(
        &'a self,
        lock: &'a mut UniqueLock<'m, T>,
        predicate: P,
    ) -> Wait<'a, 'm, T, P>
    where
        P: FnMut(&mut T) -> bool,
    {
        Wait {
            condvar: self,
            lock,
            predicate: Some(predicate),
            slot: None,
            state: WaitState::Created,
        }
    }

    /// Blocking [`ConditionVariable::wait`] for plain threads.
    ///
    /// # Panics
    ///
    /// * If `lock` does not own its mutex
    pub fn wait_explicit<T>(&self, lock: &mut UniqueLock<'_, T>) {
        crate::blocking::block_on(self.wait(lock));
    }

    /// Wakes the oldest waiter, if any.
    pub fn notify_one(&self) {
        loop {
            let list = self.head.swap(NIL, Ordering::AcqRel);
            if list == NIL {
                return;
            }

            let mut before_last = NIL;
            let mut last = list;
            loop {
                let next = node::node(last).next.load(Ordering::Acquire);
                if next == NIL {
                    break;
                }
                before_last = last;
                last = next;
            }

            if before_last != NIL {
                let remainder = node::node(before_last);
                let mut head = self.head.load(Ordering::Acquire);
                loop {
                    remainder.next.store(head, Ordering::Relaxed);
                    match self.head.compare_exchange_weak(
                        head,
                        list,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(current) => head = current,
                    }
                }
            }

            if awake(last) {
                return;
            }
        }
    }

    /// Wakes every waiter, oldest first.
    pub fn notify_all(&self) {
        let mut index = self.head.swap(NIL, Ordering::AcqRel);
        let mut detached = vec![];

        while index != NIL {
            detached.push(index);
            index = node::node(index).next.load(Ordering::Acquire);
        }

        log::trace!("notify_all: waking {} waiter(s)", detached.len());

        for index in detached.into_iter().rev() {
            awake(index);
        }
    }

    fn park(&self, index: u32) {
        let waiter = node::node(index);
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            waiter.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl Drop for ConditionVariable {
    fn drop(&mut self) {
        // Anything still parked belongs to a dropped awaitable.
        let mut index = *self.head.get_mut();
        while index != NIL {
            let next = node::node(index).next.load(Ordering::Acquire);
            node::free(index);
            index = next;
        }
    }
}

/// Claims a detached node and acquires its mutex on its behalf. Returns
/// `false` (and frees the node) if its awaitable was dropped.
fn awake(index: u32) -> bool {
    let waiter = node::node(index);

    let abandoned = {
        let _guard = waiter.waker.lock();
        let abandoned = waiter.state.load(Ordering::Acquire) == ABANDONED;
        if !abandoned {
            waiter.state.store(CLAIMED, Ordering::Release);
        }
        abandoned
    };

    if abandoned {
        node::free(index);
        return false;
    }

    let mutex = waiter.mutex.load(Ordering::Acquire);
    // SAFETY: the pointer was taken from the `&Mutex` borrowed by the waiting
    // awaitable. While the node is `CLAIMED` that awaitable cannot finish
    // dropping (it spins until the claim settles), so the mutex is alive.
    let mutex = unsafe { &*mutex };
    mutex.enqueue_claimed(index);

    true
}

enum WaitState {
    Created,
    Parked,
    Done,
}

/// Awaitable returned by [`ConditionVariable::wait`] and
/// [`ConditionVariable::wait_until`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait<'a, 'm, T, P> {
    condvar: &'a ConditionVariable,
    lock: &'a mut UniqueLock<'m, T>,
    predicate: Option<P>,
    slot: Option<u32>,
    state: WaitState,
}

// The predicate is never pinned.
impl<T, P> Unpin for Wait<'_, '_, T, P> {}

impl<T, P> fmt::Debug for Wait<'_, '_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("condvar", &self.condvar)
            .field("lock", &self.lock)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl<T, P> Future for Wait<'_, '_, T, P>
where
    P: FnMut(&mut T) -> bool,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;

        match this.state {
            WaitState::Created => {
                assert!(
                    this.lock.owns_lock(),
                    "condition variable wait requires a locked unique lock"
                );

                if let Some(predicate) = this.predicate.as_mut()
                    && predicate(&mut **this.lock)
                {
                    this.state = WaitState::Done;
                    return Poll::Ready(());
                }

                let index = node::alloc();
                let waiter = node::node(index);
                waiter.state.store(PARKED, Ordering::Relaxed);
                waiter.mutex.store(
                    std::ptr::from_ref::<RawMutex>(this.lock.mutex().raw()).cast_mut(),
                    Ordering::Relaxed,
                );
                WaitNode::register(&mut waiter.waker.lock(), cx.waker());

                this.slot = Some(index);
                this.state = WaitState::Parked;
                this.condvar.park(index);

                log::trace!("wait: parked waiter={index}, releasing mutex");
                this.lock.unlock();

                Poll::Pending
            }
            WaitState::Parked => {
                let Some(index) = this.slot else {
                    unreachable!("parked wait without a node");
                };
                let waiter = node::node(index);
                let mut waker = waiter.waker.lock();
                if waiter.state.load(Ordering::Acquire) == GRANTED {
                    drop(waker);
                    this.slot = None;
                    this.state = WaitState::Done;
                    this.lock.set_owned(true);
                    return Poll::Ready(());
                }
                WaitNode::register(&mut waker, cx.waker());
                Poll::Pending
            }
            WaitState::Done => panic!("condition variable wait polled after completion"),
        }
    }
}

impl<T, P> Drop for Wait<'_, '_, T, P> {
    fn drop(&mut self) {
        let Some(index) = self.slot.take() else {
            return;
        };
        let waiter = node::node(index);

        loop {
            let mut waker = waiter.waker.lock();
            match waiter.state.load(Ordering::Acquire) {
                PARKED | WAITING => {
                    // A notifier (for PARKED) or an unlock (for WAITING) frees
                    // the node once it reaches it.
                    waiter.state.store(ABANDONED, Ordering::Release);
                    let stale = waker.take();
                    drop(waker);
                    drop(stale);
                    return;
                }
                GRANTED => {
                    drop(waker);
                    self.lock.set_owned(true);
                    return;
                }
                CLAIMED => {
                    drop(waker);
                    std::hint::spin_loop();
                }
                state => unreachable!("condition variable waiter in state {state}"),
            }
        }
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

    use futures::task::noop_waker;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mutex::Mutex;

    #[test_log::test]
    fn wait_releases_the_mutex_while_parked() {
        let mutex = Mutex::new(0);
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut wait = condvar.wait(&mut lock);
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);

        assert!(!mutex.is_locked());
        *mutex.try_lock().unwrap() = 7;

        condvar.notify_one();

        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
        drop(wait);

        assert!(lock.owns_lock());
        assert!(mutex.is_locked());
        assert_eq!(*lock, 7);
    }

    #[test_log::test]
    fn notified_waiter_queues_behind_current_holder() {
        let mutex = Mutex::new(());
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut wait = condvar.wait(&mut lock);
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);

        let holder = mutex.try_lock().unwrap();
        condvar.notify_one();

        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);

        drop(holder);

        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
        drop(wait);
        assert!(lock.owns_lock());
    }

    #[test_log::test]
    fn notify_one_wakes_exactly_the_oldest_waiter() {
        let mutex = Mutex::new(());
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut first = condvar.wait(&mut first_lock);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Pending);

        let mut second_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut second = condvar.wait(&mut second_lock);
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);

        condvar.notify_one();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(()));
        drop(first);
        first_lock.unlock();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);

        condvar.notify_one();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(()));
        drop(second);
        assert!(second_lock.owns_lock());
    }

    #[test_log::test]
    fn notify_all_hands_the_mutex_to_each_waiter_in_turn() {
        let mutex = Mutex::new(vec![]);
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut first = condvar.wait(&mut first_lock);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Pending);

        let mut second_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut second = condvar.wait(&mut second_lock);
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);

        condvar.notify_all();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Ready(()));
        drop(first);
        first_lock.push(1);
        first_lock.unlock();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(()));
        drop(second);
        second_lock.push(2);
        drop(second_lock);
        drop(first_lock);

        assert_eq!(mutex.into_inner(), vec![1, 2]);
    }

    #[test_log::test]
    fn satisfied_predicate_completes_without_unlocking() {
        let mutex = Mutex::new(3);
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut wait = condvar.wait_until(&mut lock, |value| *value == 3);

        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
        drop(wait);
        assert!(lock.owns_lock());
    }

    #[test_log::test]
    fn abandoned_waiter_does_not_consume_a_notification() {
        let mutex = Mutex::new(());
        let condvar = ConditionVariable::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut first = condvar.wait(&mut first_lock);
        assert_eq!(Pin::new(&mut first).poll(&mut cx), Poll::Pending);
        drop(first);
        assert!(!first_lock.owns_lock());

        let mut second_lock = UniqueLock::from(mutex.try_lock().unwrap());
        let mut second = condvar.wait(&mut second_lock);
        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Pending);

        condvar.notify_one();

        assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(()));
        drop(second);
        assert!(second_lock.owns_lock());
    }

    #[test_log::test]
    fn notify_without_waiters_is_a_no_op() {
        let condvar = ConditionVariable::new();

        condvar.notify_one();
        condvar.notify_all();
    }

    #[test_log::test]
    fn wait_explicit_is_released_by_notifier_thread() {
        let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let woken = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let state = state.clone();
            let woken = woken.clone();
            std::thread::spawn(move || {
                let (mutex, condvar) = &*state;
                let mut lock = UniqueLock::from(mutex.lock_explicit());
                while !*lock {
                    condvar.wait_explicit(&mut lock);
                }
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        {
            let (mutex, condvar) = &*state;
            *mutex.lock_explicit() = true;
            condvar.notify_all();
        }

        waiter.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }
}
