//! Counting semaphore.
//!
//! The one primitive that touches the interrupt gate directly; locks,
//! condition variables and channels are all built above it.  Waiters queue
//! and wake in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;

use crate::kernel::Kernel;
use crate::machine::interrupt::IntLevel;
use crate::threads::thread::{self, Thread, ThreadState};

struct SemaphoreState {
    count: usize,
    queue: VecDeque<Arc<Thread>>,
}

pub struct Semaphore {
    name: String,
    state: spin::Mutex<SemaphoreState>,
}

impl Semaphore {
    pub fn new(name: &str, initial: usize) -> Self {
        Self {
            name: name.to_owned(),
            state: spin::Mutex::new(SemaphoreState {
                count: initial,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait: block while the count is zero, then take one unit.
    pub fn p(&self, k: &Kernel) {
        self.wait(k, false);
    }

    /// `p` for a waiter that has donated its priority to the holder of the
    /// lock built on this semaphore.
    pub fn pp(&self, k: &Kernel) {
        self.wait(k, true);
    }

    fn wait(&self, k: &Kernel, donating: bool) {
        let old_level = k.interrupt.set_level(IntLevel::Off);
        loop {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.count -= 1;
                break;
            }
            let current = k.current_thread();
            if donating || k.config.semaphore_test {
                trace!(target: "threads",
                    "thread \"{}\" waiting on \"{}\"{}",
                    current.name(),
                    self.name,
                    if donating { " (priority donated)" } else { "" });
            }
            current.set_state(ThreadState::Blocked);
            state.queue.push_back(Arc::clone(&current));
            drop(state);
            thread::sleep_current(k);
        }
        k.interrupt.set_level(old_level);
    }

    /// Signal: wake the longest waiter, if any, and return one unit.
    pub fn v(&self, k: &Kernel) {
        let old_level = k.interrupt.set_level(IntLevel::Off);
        let woken = {
            let mut state = self.state.lock();
            state.count += 1;
            state.queue.pop_front()
        };
        if let Some(thread) = woken {
            if k.config.semaphore_test {
                trace!(target: "threads",
                    "semaphore \"{}\" waking thread \"{}\"", self.name, thread.name());
            }
            k.scheduler.ready_to_run(thread);
        }
        k.interrupt.set_level(old_level);
    }
}
