use std::sync::Arc;

use super::{Continuation, Scheduler, SchedulerRef, Spawner};

/// Resumes every job synchronously on the thread that makes it runnable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl ImmediateScheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Scheduler for ImmediateScheduler {
    fn resume(&self, continuation: Continuation) {
        log::trace!("resume: job={} inline", continuation.id());
        continuation.resume();
    }
}

impl Spawner for ImmediateScheduler {
    fn handle(&self) -> SchedulerRef {
        Arc::new(*self)
    }
}
