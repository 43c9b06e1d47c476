//! The kernel bundle.
//!
//! All formerly-global state lives in one `Kernel` value: the interrupt
//! gate, the machine, the scheduler and CPU baton, the registries mapping
//! thread and space ids to their owners, and the device and filesystem
//! stacks.  Every operation that needs kernel context takes `&Kernel`;
//! there are no process-wide singletons.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::config::KernelConfig;
use crate::fs::synch_disk::SynchDisk;
use crate::fs::FileSystem;
use crate::machine::console::Console;
use crate::machine::disk::Disk;
use crate::machine::interrupt::Interrupt;
use crate::machine::mmu::MachineException;
use crate::machine::Machine;
use crate::threads::scheduler::Scheduler;
use crate::threads::thread::{Cpu, Thread, ThreadId, ThreadState};
use crate::userprog::synch_console::SynchConsole;
use crate::vm::address_space::AddressSpace;
use crate::vm::coremap::Coremap;

pub struct Kernel {
    pub config: KernelConfig,
    pub interrupt: Interrupt,
    pub machine: Machine,
    pub scheduler: Scheduler,
    pub core_map: Coremap,
    pub synch_disk: SynchDisk,
    pub synch_console: SynchConsole,
    file_system: OnceCell<FileSystem>,
    threads: spin::Mutex<HashMap<ThreadId, Arc<Thread>>>,
    spaces: spin::Mutex<HashMap<usize, Arc<AddressSpace>>>,
    cpu: Cpu,
    next_id: AtomicUsize,
}

impl Kernel {
    /// Boot with the console on the host's stdin/stdout.
    pub fn boot(config: KernelConfig) -> Arc<Self> {
        Self::boot_with_io(
            config,
            Box::new(std::io::stdin()),
            Box::new(std::io::stdout()),
        )
    }

    /// Boot the kernel, adopting the calling host thread as the simulated
    /// `main` thread.  Mounts (optionally formatting) the filesystem and
    /// binds `main`'s working directory to the root.
    pub fn boot_with_io(
        config: KernelConfig,
        console_input: Box<dyn Read + Send>,
        console_output: Box<dyn Write + Send>,
    ) -> Arc<Self> {
        config.validate();
        let disk = Disk::open(&config.disk_path, config.format_disk)
            .expect("cannot open the disk image");
        let kernel = Arc::new(Self {
            interrupt: Interrupt::new(config.time_slice),
            machine: Machine::new(config.num_phys_pages, config.use_tlb),
            scheduler: Scheduler::new(),
            core_map: Coremap::new(config.num_phys_pages, config.use_lru),
            synch_disk: SynchDisk::new(disk),
            synch_console: SynchConsole::new(Console::new(console_input, console_output)),
            file_system: OnceCell::new(),
            threads: spin::Mutex::new(HashMap::new()),
            spaces: spin::Mutex::new(HashMap::new()),
            cpu: Cpu::new(0),
            next_id: AtomicUsize::new(0),
            config,
        });

        let main = Thread::new(&kernel, "main", false);
        assert_eq!(main.id(), 0);
        main.set_state(ThreadState::Running);

        let format = kernel.config.format_disk;
        let fs = FileSystem::new(&kernel, format);
        assert!(
            kernel.file_system.set(fs).is_ok(),
            "file system mounted twice"
        );
        kernel.file_system().first_thread_start(&kernel);
        debug!(target: "kernel", "boot complete ({:?})", kernel.config);
        kernel
    }

    pub fn file_system(&self) -> &FileSystem {
        self.file_system.get().expect("file system not mounted")
    }

    pub(crate) fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// The one running thread.
    pub fn current_thread(&self) -> Arc<Thread> {
        self.try_current_thread().expect("no running thread")
    }

    pub(crate) fn try_current_thread(&self) -> Option<Arc<Thread>> {
        let id = self.cpu.current();
        self.threads.lock().get(&id).cloned()
    }

    /// Look up a live thread by its space id (`Exec`/`Join`).
    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock().get(&id).cloned()
    }

    pub(crate) fn register_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().insert(thread.id(), thread);
    }

    pub(crate) fn unregister_thread(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    pub(crate) fn alloc_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_space(&self, space: Arc<AddressSpace>) {
        self.spaces.lock().insert(space.space_id(), space);
    }

    pub(crate) fn unregister_space(&self, id: usize) {
        self.spaces.lock().remove(&id);
    }

    pub(crate) fn space(&self, id: usize) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned()
    }

    /// Entry point for exceptions the MMU raises on a user access.  TLB
    /// misses are serviced by the paging core; everything else is a
    /// kernel invariant violation.
    pub fn handle_machine_exception(&self, exception: MachineException, virt_addr: u32) {
        match exception {
            MachineException::PageFault if self.config.use_tlb => {
                debug!(target: "vm", "page fault at {virt_addr:#x}");
                let space = self
                    .current_thread()
                    .space()
                    .expect("page fault without an address space");
                space.service_page_fault(self, virt_addr);
            }
            other => panic!("unhandled user exception {other:?} at {virt_addr:#x}"),
        }
    }

    /// The `Halt` syscall: stop the machine and report the clock.
    pub fn halt(&self) {
        info!(target: "kernel",
            "machine halting after {} ticks", self.interrupt.ticks());
        self.machine.halt();
    }
}
