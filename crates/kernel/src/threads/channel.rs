//! Single-slot rendezvous channel.
//!
//! `send` delivers its message to exactly one paired `receive`; both sides
//! return only once the hand-off is complete.  Extra senders queue on
//! `receive_cond`, extra receivers on `sender_cond`, and `ready_cond`
//! covers the gap between a receiver registering its slot and the value
//! arriving.

use std::sync::Arc;

use log::trace;

use crate::kernel::Kernel;
use crate::threads::condition::Condition;
use crate::threads::lock::Lock;

struct ChannelState {
    /// A receiver has registered its slot and awaits a value.
    slot_registered: bool,
    value: Option<i32>,
}

pub struct Channel {
    lock: Arc<Lock>,
    sender_cond: Condition,
    receive_cond: Condition,
    ready_cond: Condition,
    state: spin::Mutex<ChannelState>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        let lock = Arc::new(Lock::new(name));
        Self {
            sender_cond: Condition::new("channel senders", Arc::clone(&lock)),
            receive_cond: Condition::new("channel receivers", Arc::clone(&lock)),
            ready_cond: Condition::new("channel ready", Arc::clone(&lock)),
            lock,
            state: spin::Mutex::new(ChannelState {
                slot_registered: false,
                value: None,
            }),
        }
    }

    /// Block until a receiver takes `message`.
    pub fn send(&self, k: &Kernel, message: i32) {
        self.lock.acquire(k);
        trace!(target: "threads",
            "thread \"{}\" sending {}", k.current_thread().name(), message);
        while !self.state.lock().slot_registered {
            self.receive_cond.wait(k);
        }
        {
            let mut state = self.state.lock();
            state.value = Some(message);
            state.slot_registered = false;
        }
        self.ready_cond.signal(k);
        self.lock.release(k);
    }

    /// Block until a sender hands over a message; returns it.
    pub fn receive(&self, k: &Kernel) -> i32 {
        self.lock.acquire(k);
        trace!(target: "threads",
            "thread \"{}\" waiting to receive", k.current_thread().name());
        while self.state.lock().slot_registered {
            self.sender_cond.wait(k);
        }
        self.state.lock().slot_registered = true;
        self.receive_cond.signal(k);
        while self.state.lock().value.is_none() {
            self.ready_cond.wait(k);
        }
        let message = self.state.lock().value.take().unwrap();
        self.sender_cond.signal(k);
        trace!(target: "threads",
            "thread \"{}\" received {}", k.current_thread().name(), message);
        self.lock.release(k);
        message
    }
}
