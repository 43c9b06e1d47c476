//! Per-process address spaces.
//!
//! A space owns its page table and a handle on the executable it was
//! loaded from.  Eager loading copies the code and initialized-data
//! segments in at construction; demand loading starts with every entry
//! invalid and fills frames on first touch, optionally spilling to a
//! per-process swap file when physical memory runs out.

use std::sync::Arc;

use log::debug;

use crate::error::KernelError;
use crate::fs::open_file::OpenFile;
use crate::kernel::Kernel;
use crate::machine::mmu::{
    PageTable, PteFlags, TranslationEntry, INVALID_FRAME, PAGE_SIZE, TLB_SIZE,
};
use crate::machine::{NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::util::div_round_up;
use crate::vm::executable::{Executable, Segment};

/// Room reserved above the image for the user stack.
pub const USER_STACK_SIZE: u32 = 1024;
/// Gap left below the top of the stack so the first frame reference stays
/// inside the space.
const STACK_GUARD: u32 = 16;

pub struct AddressSpace {
    space_id: usize,
    num_pages: u32,
    page_table: PageTable,
    executable: Arc<OpenFile>,
    code: Segment,
    init_data: Segment,
    swap_file: Option<Arc<OpenFile>>,
    swap_path: Option<String>,
}

impl AddressSpace {
    /// Build the space for `executable`, registering it with the kernel.
    /// Fails on a bad magic word, or, without swap, when the image plus
    /// stack cannot fit in free physical memory.
    pub fn new(
        k: &Kernel,
        executable: Arc<OpenFile>,
        space_id: usize,
    ) -> Result<Arc<Self>, KernelError> {
        let exe = Executable::new(k, &executable);
        if !exe.check_magic() {
            return Err(KernelError::BadExecutable);
        }
        let size = exe.size() + USER_STACK_SIZE;
        let code = exe.code();
        let init_data = exe.init_data();
        let num_pages = div_round_up(size, PAGE_SIZE as u32);
        let size = num_pages * PAGE_SIZE as u32;
        debug!(target: "vm",
            "initializing address space {space_id}: {num_pages} pages, {size} bytes");

        if !k.config.swap && num_pages as usize > k.core_map.count_clear() {
            return Err(KernelError::OutOfFrames);
        }

        let mut table = Vec::with_capacity(num_pages as usize);
        for vpn in 0..num_pages {
            if k.config.demand_loading {
                table.push(TranslationEntry::invalid(vpn));
            } else {
                let frame = k
                    .core_map
                    .find_frame(space_id)
                    .ok_or(KernelError::OutOfFrames)?;
                table.push(TranslationEntry {
                    virtual_page: vpn,
                    physical_page: frame,
                    flags: PteFlags::VALID,
                });
            }
        }

        let (swap_file, swap_path) = if k.config.swap {
            let name = format!("SWAP.{space_id}");
            let mut path = k.current_thread().path();
            path.merge(&name);
            let path = path.to_string();
            let _ = k.file_system().remove(k, &path);
            k.file_system().create(k, &path, size, false)?;
            debug!(target: "vm", "created swap file {path}");
            (Some(k.file_system().open(k, &path)?), Some(path))
        } else {
            (None, None)
        };

        let space = Arc::new(Self {
            space_id,
            num_pages,
            page_table: Arc::new(spin::Mutex::new(table)),
            executable,
            code,
            init_data,
            swap_file,
            swap_path,
        });
        k.register_space(Arc::clone(&space));

        if !k.config.demand_loading {
            space.load_all(k);
        }
        Ok(space)
    }

    pub fn space_id(&self) -> usize {
        self.space_id
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// In-kernel translation of a user virtual address.
    pub fn translate(&self, virt_addr: u32) -> u32 {
        let page = virt_addr / PAGE_SIZE as u32;
        let offset = virt_addr % PAGE_SIZE as u32;
        let physical_page = self.page_table.lock()[page as usize].physical_page;
        physical_page * PAGE_SIZE as u32 + offset
    }

    /// Zero the frames and copy the code and initialized-data segments in
    /// (eager loading).
    fn load_all(&self, k: &Kernel) {
        for vpn in 0..self.num_pages {
            let frame = self.page_table.lock()[vpn as usize].physical_page;
            k.machine.mmu.zero_frame(frame);
        }
        let exe = Executable::new(k, &self.executable);
        self.copy_segment(k, self.code, |buf, offset| {
            exe.read_code_block(k, buf, offset);
        });
        self.copy_segment(k, self.init_data, |buf, offset| {
            exe.read_data_block(k, buf, offset);
        });
    }

    fn copy_segment(&self, k: &Kernel, seg: Segment, read: impl Fn(&mut [u8], u32)) {
        if seg.size == 0 {
            return;
        }
        debug!(target: "vm",
            "loading segment at {:#x}, size {}", seg.addr, seg.size);
        let mut copied = 0;
        let mut buf = [0u8; PAGE_SIZE];
        while copied < seg.size {
            let virt_addr = seg.addr + copied;
            let page_offset = virt_addr % PAGE_SIZE as u32;
            let chunk = (PAGE_SIZE as u32 - page_offset).min(seg.size - copied) as usize;
            read(&mut buf[..chunk], copied);
            k.machine
                .mmu
                .write_phys(self.translate(virt_addr) as usize, &buf[..chunk]);
            copied += chunk as u32;
        }
    }

    /// Set up the register file to start execution at the image entry:
    /// PC 0, the branch-delay slot after it, and the stack pointer at the
    /// top of the space minus a small guard.
    pub fn init_registers(&self, k: &Kernel) {
        for reg in 0..NUM_TOTAL_REGS {
            k.machine.write_register(reg, 0);
        }
        k.machine.write_register(PC_REG, 0);
        k.machine.write_register(NEXT_PC_REG, 4);
        let stack = self.num_pages * PAGE_SIZE as u32 - STACK_GUARD;
        k.machine.write_register(STACK_REG, stack as i32);
        debug!(target: "vm", "stack register initialized to {stack}");
    }

    /// Context-switch out: with swapping on, fold the TLB's use/dirty bits
    /// back into the page table so eviction decisions see them.
    pub fn save_state(&self, k: &Kernel) {
        if k.config.swap {
            for slot in 0..TLB_SIZE {
                self.sync_tlb_entry(k, slot);
            }
        }
    }

    /// Context-switch in: flush the TLB, or bind the page table directly
    /// when translation does not go through one.
    pub fn restore_state(&self, k: &Kernel) {
        if k.config.use_tlb {
            for slot in 0..TLB_SIZE {
                k.machine.mmu.invalidate_tlb_entry(slot);
            }
        } else {
            k.machine.mmu.bind_page_table(Arc::clone(&self.page_table));
        }
    }

    /// Copy a TLB slot's use/dirty bits into the page table and invalidate
    /// the slot.
    fn sync_tlb_entry(&self, k: &Kernel, slot: usize) {
        let entry = k.machine.mmu.tlb_entry(slot);
        if entry.is_valid() {
            let mut table = self.page_table.lock();
            let pte = &mut table[entry.virtual_page as usize];
            pte.flags.set(PteFlags::USE, entry.flags.contains(PteFlags::USE));
            pte.flags.set(PteFlags::DIRTY, entry.flags.contains(PteFlags::DIRTY));
        }
        k.machine.mmu.invalidate_tlb_entry(slot);
    }

    /// Service a fault on `virt_addr`: obtain a frame, fill it from swap
    /// or from the executable, and install the mapping in the TLB.  A
    /// fault on a page that is already resident just refills the TLB.
    pub fn service_page_fault(&self, k: &Kernel, virt_addr: u32) {
        let vpn = virt_addr / PAGE_SIZE as u32;
        assert!(vpn < self.num_pages, "page fault outside the address space");

        let resident = self.page_table.lock()[vpn as usize];
        if resident.is_valid() {
            if k.config.use_lru {
                k.core_map.update_timers(resident.physical_page);
            }
            self.install_tlb_entry(k, resident);
            return;
        }

        let frame = if k.config.swap {
            k.core_map.replace_page(k, self.space_id)
        } else {
            k.core_map
                .find_frame(self.space_id)
                .expect("out of physical frames with swapping disabled")
        };

        let in_swap = self.page_table.lock()[vpn as usize]
            .flags
            .contains(PteFlags::IN_SWAP);
        let entry = if in_swap {
            self.load_from_swap(k, vpn, frame)
        } else {
            self.load_page(k, vpn, frame)
        };
        if k.config.use_lru {
            k.core_map.update_timers(frame);
        }
        self.install_tlb_entry(k, entry);
    }

    /// Put `entry` in the TLB, folding the displaced slot's use/dirty bits
    /// back into the page table.
    fn install_tlb_entry(&self, k: &Kernel, entry: TranslationEntry) {
        if let Some(evicted) = k.machine.mmu.insert_tlb(entry) {
            let mut table = self.page_table.lock();
            let pte = &mut table[evicted.virtual_page as usize];
            pte.flags.set(PteFlags::USE, evicted.flags.contains(PteFlags::USE));
            pte.flags.set(PteFlags::DIRTY, evicted.flags.contains(PteFlags::DIRTY));
        }
    }

    /// First touch of `vpn`: read the overlapping code and initialized-data
    /// bytes from the executable and zero-fill the rest (BSS and stack).
    fn load_page(&self, k: &Kernel, vpn: u32, frame: u32) -> TranslationEntry {
        debug!(target: "vm", "loading page {vpn} of space {} into frame {frame}", self.space_id);
        let base = vpn * PAGE_SIZE as u32;
        k.machine.mmu.zero_frame(frame);

        let exe = Executable::new(k, &self.executable);
        let mut buf = [0u8; PAGE_SIZE];
        let mut pull = |seg: Segment, read: &dyn Fn(&mut [u8], u32) -> usize| {
            let start = base.max(seg.addr);
            let end = (base + PAGE_SIZE as u32).min(seg.addr + seg.size);
            if start < end {
                let count = (end - start) as usize;
                read(&mut buf[..count], start - seg.addr);
                let phys = frame as usize * PAGE_SIZE + (start - base) as usize;
                k.machine.mmu.write_phys(phys, &buf[..count]);
            }
        };
        pull(self.code, &|buf, offset| exe.read_code_block(k, buf, offset));
        pull(self.init_data, &|buf, offset| exe.read_data_block(k, buf, offset));

        let mut table = self.page_table.lock();
        table[vpn as usize] = TranslationEntry {
            virtual_page: vpn,
            physical_page: frame,
            flags: PteFlags::VALID,
        };
        table[vpn as usize]
    }

    /// Bring `vpn` back from the swap file.  The swap copy stays current
    /// until the page is dirtied again, so `IN_SWAP` survives the reload
    /// and a clean re-eviction skips the write-back.
    fn load_from_swap(&self, k: &Kernel, vpn: u32, frame: u32) -> TranslationEntry {
        debug!(target: "vm", "loading page {vpn} of space {} from swap", self.space_id);
        let swap = self.swap_file.as_ref().expect("swap disabled");
        let mut buf = [0u8; PAGE_SIZE];
        let read = swap.read_at(k, &mut buf, vpn * PAGE_SIZE as u32);
        assert_eq!(read, PAGE_SIZE, "short swap read");
        k.machine
            .mmu
            .write_phys(frame as usize * PAGE_SIZE, &buf);

        let mut table = self.page_table.lock();
        table[vpn as usize] = TranslationEntry {
            virtual_page: vpn,
            physical_page: frame,
            flags: PteFlags::VALID | PteFlags::IN_SWAP,
        };
        table[vpn as usize]
    }

    /// Evict `vpn`: invalidate the mapping, release the frame, and write
    /// the page to the swap file if it is dirty.  TLB entries covering the
    /// frame are folded back first when this space is the one running.
    pub fn swap_page(&self, k: &Kernel, vpn: u32) {
        let frame = {
            let mut table = self.page_table.lock();
            table[vpn as usize].flags.remove(PteFlags::VALID);
            table[vpn as usize].physical_page
        };
        k.core_map.clear_frame(frame);

        let running_here = k
            .try_current_thread()
            .and_then(|t| t.space())
            .is_some_and(|s| s.space_id == self.space_id);
        if running_here {
            for slot in 0..TLB_SIZE {
                let entry = k.machine.mmu.tlb_entry(slot);
                if entry.is_valid() && entry.physical_page == frame {
                    self.sync_tlb_entry(k, slot);
                }
            }
        }

        let dirty = self.page_table.lock()[vpn as usize]
            .flags
            .contains(PteFlags::DIRTY);
        if dirty {
            let swap = self.swap_file.as_ref().expect("swap disabled");
            let mut buf = [0u8; PAGE_SIZE];
            k.machine
                .mmu
                .read_phys(frame as usize * PAGE_SIZE, &mut buf);
            let written = swap.write_at(k, &buf, vpn * PAGE_SIZE as u32);
            assert_eq!(written, PAGE_SIZE, "short swap write");
            debug!(target: "vm", "page {vpn} of space {} saved to swap", self.space_id);
            self.page_table.lock()[vpn as usize].flags |= PteFlags::IN_SWAP;
        }
        self.page_table.lock()[vpn as usize].physical_page = INVALID_FRAME;
    }

    /// Which virtual page of this space sits in `frame`.
    pub fn vpn_of_frame(&self, frame: u32) -> u32 {
        let table = self.page_table.lock();
        table
            .iter()
            .position(|e| e.is_valid() && e.physical_page == frame)
            .expect("frame not mapped by this space") as u32
    }

    pub fn page_table_entry(&self, vpn: u32) -> TranslationEntry {
        self.page_table.lock()[vpn as usize]
    }

    /// Tear the space down: give back every frame, drop the executable,
    /// and delete the swap file.
    pub fn destroy(&self, k: &Kernel) {
        debug!(target: "vm", "destroying address space {}", self.space_id);
        if k.config.swap {
            k.core_map.clear_space(self.space_id);
        } else {
            let table = self.page_table.lock().clone();
            for entry in table.iter().filter(|e| e.is_valid()) {
                k.core_map.clear_frame(entry.physical_page);
            }
        }
        self.executable.close(k);
        if let Some(swap) = &self.swap_file {
            swap.close(k);
            let path = self.swap_path.as_ref().unwrap();
            let _ = k.file_system().remove(k, path);
        }
        k.unregister_space(self.space_id);
    }
}
