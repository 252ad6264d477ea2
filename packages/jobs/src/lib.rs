#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Coroutine-style job system built on Rust futures.
//!
//! Jobs are futures bound to a [`Scheduler`] that decides where they resume.
//! On top of that sit the synchronization primitives ([`Fence`], [`Mutex`],
//! [`ConditionVariable`]), the result types ([`Task`], [`Future`],
//! [`SharedFuture`]) and the [`wait_any()`] / [`wait_all()`] combinators.

mod blocking;
mod node;
mod spin;

pub mod condvar;
pub mod config;
pub mod fence;
pub mod future;
pub mod job;
pub mod mutex;
pub mod scheduler;
pub mod task;
pub mod wait;

pub use condvar::ConditionVariable;
pub use config::ConfigError;
pub use fence::{Fence, FenceWait};
pub use future::{Future, FutureError, JobError, Promise, SharedFuture};
pub use job::IntoJob;
pub use mutex::{LockGuard, Mutex, UniqueLock};
pub use scheduler::{Continuation, ImmediateScheduler, Scheduler, SchedulerRef, Spawner};
#[cfg(feature = "threadpool")]
pub use scheduler::{Builder, ThreadpoolScheduler};
pub use task::{Join, Task, TaskError};
pub use wait::{wait_all, wait_any};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Future(#[from] FutureError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("A thread pool needs at least one worker")]
    NoWorkers,
}
