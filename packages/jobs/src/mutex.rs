//! Async mutual exclusion with FIFO hand-off.
//!
//! Contenders push themselves onto a lock-free stack of arena indices. The
//! stack's oldest entry is always the current holder; unlocking walks to the
//! holder's predecessor (the next-oldest contender), cuts the stack there and
//! hands the lock over directly.

use std::{
    cell::UnsafeCell,
    fmt,
    future::Future,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
    task::{Context, Poll},
};

use crate::node::{self, ABANDONED, CLAIMED, GRANTED, NIL, SENTINEL, WAITING, WaitNode};

/// The untyped lock: a push-stack head plus the index of the current holder.
pub(crate) struct RawMutex {
    head: AtomicU32,
    holder: AtomicU32,
}

impl RawMutex {
    const fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
            holder: AtomicU32::new(NIL),
        }
    }

    fn is_locked(&self) -> bool {
        self.head.load(Ordering::Acquire) != NIL
    }

    fn try_lock(&self) -> bool {
        if self
            .head
            .compare_exchange(NIL, SENTINEL, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.holder.store(SENTINEL, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Polls an acquisition. `slot` holds the contender's node while it is
    /// queued and is cleared once the lock is held.
    fn poll_lock(&self, slot: &mut Option<u32>, cx: &Context<'_>) -> Poll<()> {
        if let Some(index) = *slot {
            let contender = node::node(index);
            let mut waker = contender.waker.lock();
            if contender.state.load(Ordering::Acquire) == GRANTED {
                drop(waker);
                *slot = None;
                return Poll::Ready(());
            }
            WaitNode::register(&mut waker, cx.waker());
            return Poll::Pending;
        }

        let mut index = NIL;
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            if head == NIL {
                match self.head.compare_exchange_weak(
                    NIL,
                    SENTINEL,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.holder.store(SENTINEL, Ordering::Release);
                        if index != NIL {
                            node::free(index);
                        }
                        return Poll::Ready(());
                    }
                    Err(current) => {
                        head = current;
                        continue;
                    }
                }
            }

            if index == NIL {
                index = node::alloc();
                let contender = node::node(index);
                contender.state.store(WAITING, Ordering::Relaxed);
                WaitNode::register(&mut contender.waker.lock(), cx.waker());
            }

            node::node(index).next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        log::trace!("poll_lock: queued contender={index}");
        *slot = Some(index);

        Poll::Pending
    }

    /// Gives up a queued acquisition. A contender that was already granted
    /// the lock releases it again.
    fn abandon(&self, slot: &mut Option<u32>) {
        let Some(index) = slot.take() else {
            return;
        };

        let contender = node::node(index);
        let (granted, stale) = {
            let mut waker = contender.waker.lock();
            if contender.state.load(Ordering::Acquire) == GRANTED {
                (true, None)
            } else {
                contender.state.store(ABANDONED, Ordering::Release);
                (false, waker.take())
            }
        };
        drop(stale);

        if granted {
            self.unlock();
        }
    }

    /// Releases the lock and hands it to the next-oldest contender.
    ///
    /// # Panics
    ///
    /// * If the mutex is not locked
    pub(crate) fn unlock(&self) {
        let mut holder = self.holder.load(Ordering::Acquire);

        loop {
            let head = self.head.load(Ordering::Acquire);
            assert!(head != NIL, "unlock of a mutex that is not locked");

            if head == holder {
                if self
                    .head
                    .compare_exchange(head, NIL, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                release(holder);
                return;
            }

            let mut successor = head;
            loop {
                let next = node::node(successor).next.load(Ordering::Acquire);
                if next == holder {
                    break;
                }
                successor = next;
            }

            node::node(successor).next.store(NIL, Ordering::Relaxed);
            self.holder.store(successor, Ordering::Release);
            release(holder);

            if grant(successor) {
                return;
            }

            log::trace!("unlock: contender={successor} was abandoned, releasing on its behalf");
            holder = successor;
        }
    }

    /// Queues a node taken from a condition variable, or makes it the holder
    /// when the mutex is free. The node must be `CLAIMED`.
    pub(crate) fn enqueue_claimed(&self, index: u32) {
        let contender = node::node(index);
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            contender.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let waker = {
            let mut waker = contender.waker.lock();
            if head == NIL {
                self.holder.store(index, Ordering::Release);
                contender.state.store(GRANTED, Ordering::Release);
                waker.take()
            } else {
                contender.state.store(WAITING, Ordering::Release);
                None
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                *self.head.get_mut() == NIL,
                "mutex dropped while locked or awaited"
            );
        }
    }
}

/// Hands the lock to a queued node. Returns `false` if the node's awaitable
/// was dropped, in which case the caller still owns the lock on its behalf.
fn grant(index: u32) -> bool {
    let contender = node::node(index);

    loop {
        let waker = {
            let mut waker = contender.waker.lock();
            match contender.state.load(Ordering::Acquire) {
                ABANDONED => return false,
                CLAIMED => None,
                _ => {
                    contender.state.store(GRANTED, Ordering::Release);
                    Some(waker.take())
                }
            }
        };

        match waker {
            Some(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                return true;
            }
            None => std::hint::spin_loop(),
        }
    }
}

fn release(holder: u32) {
    if holder != SENTINEL && holder != NIL {
        node::free(holder);
    }
}

/// An async mutual-exclusion lock protecting a `T`.
///
/// Waiters are served in the order they started waiting. The lock may be
/// released from any thread, so a [`LockGuard`] can be held across `.await`
/// points of a job that migrates between worker threads.
///
/// # Panics
///
/// Dropping a mutex that is still locked (for example through a forgotten
/// guard) or that still has waiters panics.
pub struct Mutex<T> {
    raw: RawMutex,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through a guard, and guards are
// exclusive.
unsafe impl<T: Send> Send for Mutex<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.raw.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T> Mutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Returns an awaitable that resolves once the lock is held.
    ///
    /// # Panics
    ///
    /// * If the returned awaitable is dropped without ever being polled
    /// * If the returned awaitable is polled again after it completed
    pub const fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            slot: None,
            state: LockState::Created,
        }
    }

    /// Takes the lock if it is free, without waiting.
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        self.raw.try_lock().then(|| LockGuard::new(self))
    }

    /// Blocks the calling thread until the lock is held.
    pub fn lock_explicit(&self) -> LockGuard<'_, T> {
        self.try_lock()
            .unwrap_or_else(|| crate::blocking::block_on(self.lock()))
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    pub(crate) const fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

enum LockState {
    Created,
    Queued,
    Acquired,
}

/// Awaitable returned by [`Mutex::lock`].
#[must_use = "dropping a lock awaitable without polling it is a contract violation"]
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    slot: Option<u32>,
    state: LockState,
}

impl<T> fmt::Debug for Lock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("mutex", &self.mutex)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = LockGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        assert!(
            !matches!(this.state, LockState::Acquired),
            "lock awaitable polled after completion"
        );

        if this.mutex.raw.poll_lock(&mut this.slot, cx).is_ready() {
            this.state = LockState::Acquired;
            Poll::Ready(LockGuard::new(this.mutex))
        } else {
            this.state = LockState::Queued;
            Poll::Pending
        }
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        match self.state {
            LockState::Created => {
                if !std::thread::panicking() {
                    panic!("lock awaitable dropped without being awaited");
                }
            }
            LockState::Queued => self.mutex.raw.abandon(&mut self.slot),
            LockState::Acquired => {}
        }
    }
}

/// Scoped lock: releases the mutex when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct LockGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> LockGuard<'a, T> {
    const fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: fmt::Debug> fmt::Debug for LockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// A lock handle that can be released and re-acquired, and that a
/// [`crate::ConditionVariable`] waits with.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct UniqueLock<'a, T> {
    mutex: &'a Mutex<T>,
    owns: bool,
    _marker: PhantomData<&'a mut T>,
}

impl<T> fmt::Debug for UniqueLock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueLock")
            .field("mutex", &self.mutex)
            .field("owns", &self.owns)
            .finish()
    }
}

impl<'a, T> From<LockGuard<'a, T>> for UniqueLock<'a, T> {
    fn from(guard: LockGuard<'a, T>) -> Self {
        let mutex = guard.mutex;
        std::mem::forget(guard);

        Self {
            mutex,
            owns: true,
            _marker: PhantomData,
        }
    }
}

impl<'a, T> UniqueLock<'a, T> {
    /// A handle on `mutex` that does not hold it yet.
    pub const fn deferred(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            owns: false,
            _marker: PhantomData,
        }
    }

    /// Returns an awaitable that acquires the mutex through this handle.
    ///
    /// # Panics
    ///
    /// * If this handle already owns the mutex
    /// * If the returned awaitable is dropped without ever being polled
    pub fn lock(&mut self) -> impl Future<Output = ()> + '_ {
        assert!(!self.owns, "unique lock already owns its mutex");
        let lock = self.mutex.lock();

        async move {
            let guard = lock.await;
            std::mem::forget(guard);
            self.owns = true;
        }
    }

    /// Acquires the mutex if it is free.
    ///
    /// # Panics
    ///
    /// * If this handle already owns the mutex
    pub fn try_lock(&mut self) -> bool {
        assert!(!self.owns, "unique lock already owns its mutex");
        self.owns = self.mutex.raw.try_lock();
        self.owns
    }

    /// Releases the mutex, keeping the handle for a later re-lock.
    ///
    /// # Panics
    ///
    /// * If this handle does not own the mutex
    pub fn unlock(&mut self) {
        assert!(self.owns, "unique lock does not own its mutex");
        self.owns = false;
        self.mutex.raw.unlock();
    }

    #[must_use]
    pub const fn owns_lock(&self) -> bool {
        self.owns
    }

    #[must_use]
    pub const fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(crate) const fn set_owned(&mut self, owns: bool) {
        self.owns = owns;
    }
}

impl<T> Deref for UniqueLock<'_, T> {
    type Target = T;

    /// # Panics
    ///
    /// * If this handle does not own the mutex
    fn deref(&self) -> &T {
        assert!(self.owns, "unique lock does not own its mutex");
        // SAFETY: `owns` means this handle holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for UniqueLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        assert!(self.owns, "unique lock does not own its mutex");
        // SAFETY: `owns` means this handle holds the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for UniqueLock<'_, T> {
    fn drop(&mut self) {
        if self.owns {
            self.mutex.raw.unlock();
        }
    }
}
