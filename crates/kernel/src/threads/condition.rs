//! Mesa-style condition variables.
//!
//! Bound to one lock at construction.  Each waiter parks on its own
//! zero-valued semaphore so wakeups are strictly FIFO.  A wakeup is a hint,
//! not a guarantee: callers re-test their predicate in a loop.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::threads::lock::Lock;
use crate::threads::semaphore::Semaphore;

pub struct Condition {
    name: String,
    lock: Arc<Lock>,
    waiters: spin::Mutex<VecDeque<Arc<Semaphore>>>,
}

impl Condition {
    pub fn new(name: &str, lock: Arc<Lock>) -> Self {
        Self {
            name: name.to_owned(),
            lock,
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically release the bound lock and block; re-acquire before
    /// returning.  Caller must hold the bound lock.
    pub fn wait(&self, k: &Kernel) {
        assert!(
            self.lock.is_held_by_current_thread(k),
            "wait on \"{}\" without holding its lock",
            self.name
        );
        let waiter = Arc::new(Semaphore::new("condition waiter", 0));
        self.waiters.lock().push_back(Arc::clone(&waiter));
        self.lock.release(k);
        waiter.p(k);
        self.lock.acquire(k);
    }

    /// Wake the longest waiter, if any.
    pub fn signal(&self, k: &Kernel) {
        assert!(
            self.lock.is_held_by_current_thread(k),
            "signal on \"{}\" without holding its lock",
            self.name
        );
        if let Some(waiter) = self.waiters.lock().pop_front() {
            waiter.v(k);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self, k: &Kernel) {
        assert!(
            self.lock.is_held_by_current_thread(k),
            "broadcast on \"{}\" without holding its lock",
            self.name
        );
        let woken: Vec<Arc<Semaphore>> = self.waiters.lock().drain(..).collect();
        for waiter in woken {
            waiter.v(k);
        }
    }
}
