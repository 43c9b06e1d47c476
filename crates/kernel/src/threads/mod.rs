//! Thread and synchronization core.
//!
//! Cooperative kernel threads over a single simulated CPU, plus the
//! primitives built on the interrupt gate: semaphores, locks with priority
//! donation, Mesa condition variables, and the rendezvous channel.

pub mod channel;
pub mod condition;
pub mod lock;
pub mod scheduler;
pub mod semaphore;
pub mod thread;

pub use channel::Channel;
pub use condition::Condition;
pub use lock::Lock;
pub use scheduler::{Scheduler, DEFAULT_PRIORITY, NUM_PRIORITIES};
pub use semaphore::Semaphore;
pub use thread::{Thread, ThreadId, ThreadState};
