//! Process-wide arena of waiter nodes.
//!
//! Every parked fence, mutex or condition variable waiter owns one node for as
//! long as it is linked into a wait list. Lists link nodes by `u32` index
//! instead of by pointer. Segments are allocated on first use and never freed,
//! so an index always resolves to a live node; a recycled index is only ever
//! reached through the list it was re-linked into.

use std::{
    ptr,
    sync::{
        OnceLock,
        atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    task::Waker,
};

use crate::{mutex::RawMutex, spin::SpinLock};

/// End of list / empty list.
pub(crate) const NIL: u32 = u32::MAX;

/// Holder tag of a mutex acquired without queueing (try-lock or uncontended
/// lock). It never indexes a node.
pub(crate) const SENTINEL: u32 = u32::MAX - 1;

const SEGMENT_SIZE: usize = 256;
const MAX_SEGMENTS: usize = 4096;
#[allow(clippy::cast_possible_truncation)]
const CAPACITY: u32 = (SEGMENT_SIZE * MAX_SEGMENTS) as u32;

/// Freshly allocated or back on the free list.
pub(crate) const IDLE: u8 = 0;
/// Parked on a fence or queued on a mutex.
pub(crate) const WAITING: u8 = 1;
/// Promoted to mutex holder, or released by a fence signal.
pub(crate) const GRANTED: u8 = 2;
/// The owning awaitable was dropped while the node was still linked.
pub(crate) const ABANDONED: u8 = 3;
/// Parked on a condition variable.
pub(crate) const PARKED: u8 = 4;
/// A notifier is moving the node from a condition variable into its mutex.
pub(crate) const CLAIMED: u8 = 5;

pub(crate) struct WaitNode {
    pub(crate) next: AtomicU32,
    pub(crate) state: AtomicU8,
    pub(crate) target: AtomicU64,
    pub(crate) mutex: AtomicPtr<RawMutex>,
    /// State transitions that hand the node to its owner happen while this
    /// lock is held, so a waker is never lost and never taken from a node that
    /// has already been recycled.
    pub(crate) waker: SpinLock<Option<Waker>>,
    free_next: AtomicU32,
}

impl WaitNode {
    const fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            state: AtomicU8::new(IDLE),
            target: AtomicU64::new(0),
            mutex: AtomicPtr::new(ptr::null_mut()),
            waker: SpinLock::new(None),
            free_next: AtomicU32::new(NIL),
        }
    }

    fn reset(&self) {
        self.next.store(NIL, Ordering::Relaxed);
        self.state.store(IDLE, Ordering::Relaxed);
        self.target.store(0, Ordering::Relaxed);
        self.mutex.store(ptr::null_mut(), Ordering::Relaxed);
        let stale = self.waker.lock().take();
        drop(stale);
    }

    /// Stores `waker` unless an equivalent one is already registered.
    pub(crate) fn register(waker: &mut Option<Waker>, new: &Waker) {
        match waker {
            Some(current) if current.will_wake(new) => {}
            _ => *waker = Some(new.clone()),
        }
    }
}

struct Arena {
    segments: [OnceLock<Box<[WaitNode]>>; MAX_SEGMENTS],
    /// Free-list head: `(tag << 32) | index`. The tag changes on every push and
    /// pop so a stale head never wins a compare-exchange.
    free: AtomicU64,
    fresh: AtomicU32,
}

static ARENA: Arena = Arena {
    segments: [const { OnceLock::new() }; MAX_SEGMENTS],
    free: AtomicU64::new(NIL as u64),
    fresh: AtomicU32::new(0),
};

const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Resolves an index handed out by [`alloc`].
pub(crate) fn node(index: u32) -> &'static WaitNode {
    let index = index as usize;
    let segment = ARENA.segments[index / SEGMENT_SIZE]
        .get_or_init(|| (0..SEGMENT_SIZE).map(|_| WaitNode::new()).collect());

    &segment[index % SEGMENT_SIZE]
}

/// Takes a node out of the arena. The node starts `IDLE` and unlinked.
///
/// # Panics
///
/// * If more than `SEGMENT_SIZE * MAX_SEGMENTS` nodes are in use at once
pub(crate) fn alloc() -> u32 {
    let mut head = ARENA.free.load(Ordering::Acquire);

    loop {
        let (tag, index) = unpack(head);
        if index == NIL {
            break;
        }

        let next = node(index).free_next.load(Ordering::Relaxed);
        match ARENA.free.compare_exchange_weak(
            head,
            pack(tag.wrapping_add(1), next),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return index,
            Err(current) => head = current,
        }
    }

    let index = ARENA.fresh.fetch_add(1, Ordering::Relaxed);
    assert!(
        index < CAPACITY,
        "wait-node arena exhausted ({CAPACITY} simultaneously parked waiters)"
    );

    index
}

/// Returns a node to the arena. The caller must be the node's last user: it is
/// unlinked from every list and no other thread will touch it again.
pub(crate) fn free(index: u32) {
    let released = node(index);
    released.reset();

    let mut head = ARENA.free.load(Ordering::Relaxed);
    loop {
        let (tag, next) = unpack(head);
        released.free_next.store(next, Ordering::Relaxed);

        match ARENA.free.compare_exchange_weak(
            head,
            pack(tag.wrapping_add(1), index),
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(current) => head = current,
        }
    }
}
