//! Kernel threads and the simulated CPU.
//!
//! Every kernel thread is backed by a host thread, but the CPU baton keeps
//! exactly one of them running: a context switch publishes the next thread
//! id and parks the switcher until it is scheduled again.  This preserves
//! the cooperative single-CPU model: switches happen only at `yield_now`,
//! `sleep_current`, `finish` and inside blocking primitives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};

use crate::fs::open_file::OpenFile;
use crate::fs::path::Path;
use crate::kernel::Kernel;
use crate::machine::interrupt::IntLevel;
use crate::machine::NUM_TOTAL_REGS;
use crate::threads::channel::Channel;
use crate::threads::lock::Lock;
use crate::threads::scheduler::{DEFAULT_PRIORITY, NUM_PRIORITIES};

/// Thread identifier; doubles as the space id of the process it runs.
pub type ThreadId = usize;

/// Per-thread open files, beyond the two console descriptors.
const MAX_OPEN_FILES: usize = 16;
/// First descriptor handed to user files (0 and 1 are the console).
const FIRST_FILE_DESCRIPTOR: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Zombie,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    joinable: bool,
    priority: AtomicUsize,
    state: spin::Mutex<ThreadState>,
    forked: AtomicBool,
    finished: AtomicBool,
    /// One-shot rendezvous carrying the exit status to a joiner.
    exit_channel: Option<Channel>,
    user_registers: spin::Mutex<[i32; NUM_TOTAL_REGS]>,
    space: spin::Mutex<Option<Arc<crate::vm::address_space::AddressSpace>>>,
    open_files: spin::Mutex<Vec<Option<Arc<OpenFile>>>>,
    cwd: spin::Mutex<Path>,
    cwd_lock: spin::Mutex<Option<Arc<Lock>>>,
}

impl Thread {
    /// Create a thread and enter it in the kernel registry.  The new
    /// thread inherits the creator's working directory and does not run
    /// until forked.
    pub fn new(k: &Kernel, name: &str, joinable: bool) -> Arc<Self> {
        let cwd = match k.try_current_thread() {
            Some(current) => current.path(),
            None => Path::root(),
        };
        let thread = Arc::new(Self {
            id: k.alloc_id(),
            name: name.to_owned(),
            joinable,
            priority: AtomicUsize::new(DEFAULT_PRIORITY),
            state: spin::Mutex::new(ThreadState::Blocked),
            forked: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            exit_channel: joinable.then(|| Channel::new("exit status")),
            user_registers: spin::Mutex::new([0; NUM_TOTAL_REGS]),
            space: spin::Mutex::new(None),
            open_files: spin::Mutex::new(vec![None; MAX_OPEN_FILES]),
            cwd: spin::Mutex::new(cwd),
            cwd_lock: spin::Mutex::new(None),
        });
        k.register_thread(Arc::clone(&thread));
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_joinable(&self) -> bool {
        self.joinable
    }

    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: usize) {
        assert!(priority < NUM_PRIORITIES);
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub fn space(&self) -> Option<Arc<crate::vm::address_space::AddressSpace>> {
        self.space.lock().clone()
    }

    pub fn set_space(&self, space: Arc<crate::vm::address_space::AddressSpace>) {
        *self.space.lock() = Some(space);
    }

    pub(crate) fn take_space(&self) -> Option<Arc<crate::vm::address_space::AddressSpace>> {
        self.space.lock().take()
    }

    pub(crate) fn user_registers(&self) -> [i32; NUM_TOTAL_REGS] {
        *self.user_registers.lock()
    }

    pub(crate) fn save_user_registers(&self, registers: [i32; NUM_TOTAL_REGS]) {
        *self.user_registers.lock() = registers;
    }

    /// Start the thread: its backing host thread parks until scheduled,
    /// then runs `entry` and finishes with status 0 if `entry` did not
    /// finish explicitly.  Forking twice is a fatal programming error.
    pub fn fork(
        self: &Arc<Self>,
        k: &Arc<Kernel>,
        entry: Box<dyn FnOnce(&Arc<Kernel>) + Send>,
    ) {
        assert!(
            !self.forked.swap(true, Ordering::SeqCst),
            "thread \"{}\" forked twice",
            self.name
        );
        debug!(target: "threads", "forking thread \"{}\"", self.name);
        // Pin the inherited working directory: the thread counts as an
        // opener of it from its first instant to its finish.
        k.file_system().bind_cwd(k, self);

        let thread = Arc::clone(self);
        let kernel = Arc::clone(k);
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                kernel.cpu().wait_until_scheduled(thread.id);
                trace!(target: "threads", "thread \"{}\" starting", thread.name);
                entry(&kernel);
                if !thread.finished.load(Ordering::SeqCst) {
                    thread.finish(&kernel, 0);
                }
            })
            .expect("failed to spawn host thread");

        let old_level = k.interrupt.set_level(IntLevel::Off);
        k.scheduler.ready_to_run(Arc::clone(self));
        k.interrupt.set_level(old_level);
    }

    /// Wait for this thread to exit and collect its status.  Only joinable
    /// threads may be joined, and never by themselves.
    pub fn join(&self, k: &Kernel) -> i32 {
        assert!(
            self.joinable,
            "thread \"{}\" is not joinable",
            self.name
        );
        assert_ne!(self.id, k.current_thread().id(), "a thread cannot join itself");
        let channel = self.exit_channel.as_ref().unwrap();
        channel.receive(k)
    }

    /// Terminate the calling thread.  A joinable thread lingers as a
    /// zombie inside the rendezvous until its status is collected; then
    /// (or immediately, if not joinable) its resources are torn down and
    /// the CPU moves on without re-queueing it.
    pub fn finish(self: &Arc<Self>, k: &Kernel, status: i32) {
        assert_eq!(self.id, k.current_thread().id(), "finish on a non-running thread");
        self.finished.store(true, Ordering::SeqCst);
        debug!(target: "threads", "finishing thread \"{}\" with status {}", self.name, status);

        if let Some(channel) = &self.exit_channel {
            self.set_state(ThreadState::Zombie);
            channel.send(k, status);
        }

        if let Some(space) = self.take_space() {
            space.destroy(k);
        }
        let open: Vec<Arc<OpenFile>> = {
            let mut slots = self.open_files.lock();
            slots.iter_mut().filter_map(|s| s.take()).collect()
        };
        for file in open {
            file.close(k);
        }
        if self.cwd_lock.lock().take().is_some() {
            let sector = k.file_system().resolve_directory_sector(k, &self.path());
            if let Some(sector) = sector {
                k.file_system().dir_table.close_directory(k, sector);
            }
        }

        k.interrupt.set_level(IntLevel::Off);
        self.set_state(ThreadState::Zombie);
        let next = k
            .scheduler
            .find_next_to_run()
            .expect("last runnable thread finished while others are blocked");
        switch_to(k, next, true);
        k.unregister_thread(self.id);
        // The host thread unwinds off-CPU from here.
    }

    // Per-thread descriptor table.  0/1 are the console and never stored.

    pub fn file_open(&self, file: Arc<OpenFile>) -> Option<i32> {
        let mut slots = self.open_files.lock();
        let free = slots.iter().position(|s| s.is_none())?;
        slots[free] = Some(file);
        Some(free as i32 + FIRST_FILE_DESCRIPTOR)
    }

    pub fn file_get(&self, fd: i32) -> Option<Arc<OpenFile>> {
        let index = usize::try_from(fd - FIRST_FILE_DESCRIPTOR).ok()?;
        self.open_files.lock().get(index)?.clone()
    }

    pub fn file_close(&self, fd: i32) -> Option<Arc<OpenFile>> {
        let index = usize::try_from(fd - FIRST_FILE_DESCRIPTOR).ok()?;
        self.open_files.lock().get_mut(index)?.take()
    }

    // Working directory.

    pub fn path(&self) -> Path {
        self.cwd.lock().clone()
    }

    pub fn set_path(&self, path: Path) {
        *self.cwd.lock() = path;
    }

    pub fn cwd_lock(&self) -> Option<Arc<Lock>> {
        self.cwd_lock.lock().clone()
    }

    pub(crate) fn set_cwd_lock(&self, lock: Arc<Lock>) -> Option<Arc<Lock>> {
        self.cwd_lock.lock().replace(lock)
    }
}

/// Give up the CPU to the strongest ready thread, if there is one.
pub fn yield_now(k: &Kernel) {
    let old_level = k.interrupt.set_level(IntLevel::Off);
    let current = k.current_thread();
    trace!(target: "threads", "yielding thread \"{}\"", current.name());
    if let Some(next) = k.scheduler.find_next_to_run() {
        k.scheduler.ready_to_run(Arc::clone(&current));
        switch_to(k, next, false);
    }
    k.interrupt.set_level(old_level);
}

/// Block the calling thread.  The caller has already queued it on whatever
/// it waits for; a thread nobody will wake never runs again.
pub(crate) fn sleep_current(k: &Kernel) {
    let current = k.current_thread();
    assert_eq!(current.state(), ThreadState::Blocked);
    trace!(target: "threads", "sleeping thread \"{}\"", current.name());
    let next = k
        .scheduler
        .find_next_to_run()
        .expect("deadlock: all threads are blocked");
    switch_to(k, next, false);
}

/// Switch the CPU to `next`.  With `dying` the switcher does not wait to
/// be rescheduled; its host thread unwinds off-CPU.
pub(crate) fn switch_to(k: &Kernel, next: Arc<Thread>, dying: bool) {
    let old = k.current_thread();
    if Arc::ptr_eq(&old, &next) {
        old.set_state(ThreadState::Running);
        return;
    }
    trace!(target: "threads",
        "context switch \"{}\" -> \"{}\"", old.name(), next.name());

    if !dying {
        if let Some(space) = old.space() {
            old.save_user_registers(k.machine.save_user_state());
            space.save_state(k);
        }
    }
    next.set_state(ThreadState::Running);
    if let Some(space) = next.space() {
        k.machine.restore_user_state(&next.user_registers());
        space.restore_state(k);
    }

    k.cpu().hand_off(next.id(), (!dying).then(|| old.id()));
}

/// The CPU baton: names the one thread allowed to run.  Parked host
/// threads wait here until the baton carries their id.
pub(crate) struct Cpu {
    current: Mutex<ThreadId>,
    scheduled: Condvar,
}

impl Cpu {
    pub(crate) fn new(initial: ThreadId) -> Self {
        Self {
            current: Mutex::new(initial),
            scheduled: Condvar::new(),
        }
    }

    pub(crate) fn current(&self) -> ThreadId {
        *self.current.lock().unwrap()
    }

    pub(crate) fn wait_until_scheduled(&self, me: ThreadId) {
        let mut current = self.current.lock().unwrap();
        while *current != me {
            current = self.scheduled.wait(current).unwrap();
        }
    }

    /// Publish `next` as the running thread; when `wait_as` is given, park
    /// until the baton comes back.
    pub(crate) fn hand_off(&self, next: ThreadId, wait_as: Option<ThreadId>) {
        let mut current = self.current.lock().unwrap();
        *current = next;
        self.scheduled.notify_all();
        if let Some(me) = wait_as {
            while *current != me {
                current = self.scheduled.wait(current).unwrap();
            }
        }
    }
}
