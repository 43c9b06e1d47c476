//! Mutual exclusion with priority donation.
//!
//! A lock is a binary semaphore that remembers its holder.  When a
//! stronger thread has to wait, the holder's priority is raised to the
//! waiter's for the duration of the critical section and restored on
//! release.  Donation is shallow: it reaches the immediate holder only.

use std::sync::Arc;

use log::trace;

use crate::kernel::Kernel;
use crate::threads::semaphore::Semaphore;
use crate::threads::thread::Thread;

pub struct Lock {
    name: String,
    semaphore: Semaphore,
    holder: spin::Mutex<Option<Arc<Thread>>>,
    /// Holder priority saved while a donation is in effect.
    previous_priority: spin::Mutex<Option<usize>>,
}

impl Lock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            semaphore: Semaphore::new(name, 1),
            holder: spin::Mutex::new(None),
            previous_priority: spin::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lock, donating priority to a weaker holder first.
    /// Re-acquiring a held lock is a fatal programming error.
    pub fn acquire(&self, k: &Kernel) {
        assert!(
            !self.is_held_by_current_thread(k),
            "thread already holds lock \"{}\"",
            self.name
        );
        let current = k.current_thread();
        trace!(target: "threads", "thread \"{}\" acquiring lock \"{}\"", current.name(), self.name);

        let donating = {
            let holder = self.holder.lock();
            match holder.as_ref() {
                Some(holder) if current.priority() < holder.priority() => {
                    *self.previous_priority.lock() = Some(holder.priority());
                    k.scheduler.transfer_priority(holder, current.priority());
                    true
                }
                _ => false,
            }
        };
        if donating {
            self.semaphore.pp(k);
        } else {
            self.semaphore.p(k);
        }
        *self.holder.lock() = Some(current);
    }

    /// Drop the lock, undoing any donation.  Releasing a lock the caller
    /// does not hold is a fatal programming error.
    pub fn release(&self, k: &Kernel) {
        assert!(
            self.is_held_by_current_thread(k),
            "release of lock \"{}\" by a thread that does not hold it",
            self.name
        );
        trace!(target: "threads",
            "thread \"{}\" releasing lock \"{}\"", k.current_thread().name(), self.name);
        if let Some(previous) = self.previous_priority.lock().take() {
            let holder = self.holder.lock().clone().unwrap();
            k.scheduler.transfer_priority(&holder, previous);
        }
        *self.holder.lock() = None;
        self.semaphore.v(k);
    }

    pub fn is_held_by_current_thread(&self, k: &Kernel) -> bool {
        self.holder
            .lock()
            .as_ref()
            .is_some_and(|h| h.id() == k.current_thread().id())
    }
}
