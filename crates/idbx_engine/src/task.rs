//! Cooperative task queue.
//!
//! The engine performs all asynchronous work as queued jobs drained by
//! [`Engine::run_until_idle`](crate::Engine::run_until_idle). Jobs may push
//! further jobs while running; the queue is strictly first-in first-out, so
//! a job pushed during another job runs after everything already queued.

use std::cell::RefCell;
use std::collections::VecDeque;

/// A unit of deferred work.
pub(crate) type Job = Box<dyn FnOnce()>;

/// FIFO queue of pending jobs.
///
/// Interior mutability lets jobs enqueue successors while the queue is
/// being drained. Jobs are popped before running, so a running job never
/// holds the queue borrow.
#[derive(Default)]
pub(crate) struct TaskQueue {
    jobs: RefCell<VecDeque<Job>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, job: Job) {
        self.jobs.borrow_mut().push_back(job);
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        self.jobs.borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.jobs.borrow().len()
    }
}
