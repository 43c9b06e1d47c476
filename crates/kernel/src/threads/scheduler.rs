//! Ready-thread scheduling.
//!
//! One FIFO queue per priority level.  Level 0 is the strongest; new
//! threads start at `DEFAULT_PRIORITY`.  `transfer_priority` re-banks an
//! already-ready thread, which is the hook priority donation uses.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};

use super::thread::{Thread, ThreadState};

/// Priority bands, 0 (highest) through `NUM_PRIORITIES - 1`.
pub const NUM_PRIORITIES: usize = 10;
/// Band assigned to threads that do not ask for anything stronger.
pub const DEFAULT_PRIORITY: usize = NUM_PRIORITIES - 1;

pub struct Scheduler {
    queues: spin::Mutex<Vec<VecDeque<Arc<Thread>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queues: spin::Mutex::new((0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect()),
        }
    }

    /// Mark `thread` ready and queue it at its priority band.
    pub fn ready_to_run(&self, thread: Arc<Thread>) {
        debug!(target: "threads", "putting thread \"{}\" on ready list", thread.name());
        thread.set_state(ThreadState::Ready);
        let mut queues = self.queues.lock();
        let priority = thread.priority();
        queues[priority].push_back(thread);
    }

    /// Pop the strongest ready thread, if any.
    pub fn find_next_to_run(&self) -> Option<Arc<Thread>> {
        let mut queues = self.queues.lock();
        queues.iter_mut().find_map(|q| q.pop_front())
    }

    /// Move `thread` to priority band `priority`, re-queueing it if it is
    /// currently ready.  Donation raises a lock holder this way and undoes
    /// it on release.
    pub fn transfer_priority(&self, thread: &Arc<Thread>, priority: usize) {
        assert!(priority < NUM_PRIORITIES);
        let mut queues = self.queues.lock();
        let old = thread.priority();
        let was_queued = if let Some(pos) = queues[old].iter().position(|t| Arc::ptr_eq(t, thread))
        {
            queues[old].remove(pos);
            true
        } else {
            false
        };
        debug!(target: "threads",
            "transferring thread \"{}\" from priority {} to {}", thread.name(), old, priority);
        thread.set_priority(priority);
        if was_queued {
            queues[priority].push_back(Arc::clone(thread));
        }
    }

    /// Log the ready queues (the `Ps` syscall).
    pub fn print(&self, current: &Thread) {
        info!(target: "threads", "running: \"{}\" (priority {})", current.name(), current.priority());
        let queues = self.queues.lock();
        for (priority, queue) in queues.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let names: Vec<&str> = queue.iter().map(|t| t.name()).collect();
            info!(target: "threads", "ready[{priority}]: {}", names.join(", "));
        }
    }
}
