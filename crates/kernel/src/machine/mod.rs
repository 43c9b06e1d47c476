//! The simulated MIPS-like machine, as seen by the kernel.
//!
//! Only the narrow surface the kernel consumes lives here: the register
//! file, main memory behind the MMU, the interrupt gate, and the raw
//! console/disk devices.  Instruction decoding belongs to the external
//! simulator, which reaches the kernel through the run hook and the
//! exception entry points.

pub mod console;
pub mod disk;
pub mod interrupt;
pub mod mmu;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::kernel::Kernel;
use mmu::Mmu;

pub const NUM_GP_REGS: usize = 32;
pub const STACK_REG: usize = 29;
pub const RET_ADDR_REG: usize = 31;
pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
pub const PC_REG: usize = 34;
pub const NEXT_PC_REG: usize = 35;
pub const PREV_PC_REG: usize = 36;
pub const LOAD_REG: usize = 37;
pub const LOAD_VALUE_REG: usize = 38;
pub const BAD_VADDR_REG: usize = 39;
pub const NUM_TOTAL_REGS: usize = 40;

/// Retries for one user-memory access before the kernel gives up.
pub const MEM_TRY_LIMIT: usize = 5;

/// Stand-in for the external instruction simulator: runs the current
/// thread's user program against this machine until it exits.
pub type RunHook = Arc<dyn Fn(&Arc<Kernel>) + Send + Sync>;

pub struct Machine {
    registers: spin::Mutex<[i32; NUM_TOTAL_REGS]>,
    pub mmu: Mmu,
    halted: AtomicBool,
    run_hook: spin::Mutex<Option<RunHook>>,
}

impl Machine {
    pub fn new(num_phys_pages: usize, use_tlb: bool) -> Self {
        Self {
            registers: spin::Mutex::new([0; NUM_TOTAL_REGS]),
            mmu: Mmu::new(num_phys_pages, use_tlb),
            halted: AtomicBool::new(false),
            run_hook: spin::Mutex::new(None),
        }
    }

    pub fn read_register(&self, which: usize) -> i32 {
        assert!(which < NUM_TOTAL_REGS);
        self.registers.lock()[which]
    }

    pub fn write_register(&self, which: usize, value: i32) {
        assert!(which < NUM_TOTAL_REGS);
        self.registers.lock()[which] = value;
    }

    /// Snapshot the user register file (context switch out).
    pub fn save_user_state(&self) -> [i32; NUM_TOTAL_REGS] {
        *self.registers.lock()
    }

    /// Reinstall a user register file (context switch in).
    pub fn restore_user_state(&self, registers: &[i32; NUM_TOTAL_REGS]) {
        *self.registers.lock() = *registers;
    }

    /// Read `size` bytes (1, 2 or 4) at a user virtual address.  A failed
    /// translation raises the corresponding exception and yields `None`;
    /// the caller retries once the fault has been serviced.
    pub fn read_mem(&self, k: &Kernel, addr: u32, size: usize) -> Option<u32> {
        assert!(matches!(size, 1 | 2 | 4));
        assert_eq!(addr as usize % size, 0, "unaligned user read");
        let phys = match self.mmu.translate(addr, false) {
            Ok(phys) => phys as usize,
            Err(e) => {
                k.handle_machine_exception(e, addr);
                return None;
            }
        };
        let mut buf = [0u8; 4];
        self.mmu.read_phys(phys, &mut buf[..size]);
        Some(u32::from_le_bytes(buf))
    }

    /// Write `size` bytes (1, 2 or 4) at a user virtual address; `false`
    /// means the access faulted and should be retried.
    pub fn write_mem(&self, k: &Kernel, addr: u32, size: usize, value: u32) -> bool {
        assert!(matches!(size, 1 | 2 | 4));
        assert_eq!(addr as usize % size, 0, "unaligned user write");
        let phys = match self.mmu.translate(addr, true) {
            Ok(phys) => phys as usize,
            Err(e) => {
                k.handle_machine_exception(e, addr);
                return false;
            }
        };
        self.mmu.write_phys(phys, &value.to_le_bytes()[..size]);
        true
    }

    /// Hand the CPU to user mode: defer to the installed simulator hook.
    pub fn run(&self, k: &Arc<Kernel>) {
        let hook = self.run_hook.lock().clone();
        match hook {
            Some(hook) if !self.is_halted() => hook(k),
            _ => debug!(target: "machine", "no user simulator attached, returning to kernel"),
        }
    }

    pub fn set_run_hook(&self, hook: RunHook) {
        *self.run_hook.lock() = Some(hook);
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}
