//! Memory management unit.
//!
//! Translates user virtual addresses into offsets of the simulated main
//! memory, either through a bound page table or through the small software
//! TLB.  The MMU reads the access flags and maintains `USE`/`DIRTY`; the
//! paging core owns `IN_SWAP`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::disk::SECTOR_SIZE;

/// Pages and sectors share one size so a page is one disk transfer.
pub const PAGE_SIZE: usize = SECTOR_SIZE;
/// Software TLB entries.
pub const TLB_SIZE: usize = 4;
/// Sentinel for "no frame assigned".
pub const INVALID_FRAME: u32 = u32::MAX;

bitflags! {
    /// Access bits of one page-table or TLB entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PteFlags: u8 {
        const VALID     = 1 << 0;
        const READ_ONLY = 1 << 1;
        const USE       = 1 << 2;
        const DIRTY     = 1 << 3;
        const IN_SWAP   = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub virtual_page: u32,
    pub physical_page: u32,
    pub flags: PteFlags,
}

impl TranslationEntry {
    pub fn invalid(virtual_page: u32) -> Self {
        Self {
            virtual_page,
            physical_page: INVALID_FRAME,
            flags: PteFlags::empty(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(PteFlags::VALID)
    }
}

/// Shared, mutable page table handle: owned by an address space, borrowed
/// by the MMU while that space runs.
pub type PageTable = Arc<spin::Mutex<Vec<TranslationEntry>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineException {
    PageFault,
    ReadOnly,
    BusError,
    AddressError,
}

pub struct Mmu {
    memory: spin::Mutex<Vec<u8>>,
    num_phys_pages: usize,
    tlb: Option<spin::Mutex<[TranslationEntry; TLB_SIZE]>>,
    tlb_cursor: AtomicUsize,
    page_table: spin::Mutex<Option<PageTable>>,
}

impl Mmu {
    pub fn new(num_phys_pages: usize, use_tlb: bool) -> Self {
        Self {
            memory: spin::Mutex::new(vec![0; num_phys_pages * PAGE_SIZE]),
            num_phys_pages,
            tlb: use_tlb.then(|| spin::Mutex::new([TranslationEntry::invalid(0); TLB_SIZE])),
            tlb_cursor: AtomicUsize::new(0),
            page_table: spin::Mutex::new(None),
        }
    }

    pub fn num_phys_pages(&self) -> usize {
        self.num_phys_pages
    }

    pub fn uses_tlb(&self) -> bool {
        self.tlb.is_some()
    }

    /// Attach a space's page table for direct (non-TLB) translation.
    pub fn bind_page_table(&self, table: PageTable) {
        *self.page_table.lock() = Some(table);
    }

    pub fn translate(&self, virt_addr: u32, writing: bool) -> Result<u32, MachineException> {
        let vpn = virt_addr as usize / PAGE_SIZE;
        let offset = virt_addr as usize % PAGE_SIZE;

        let entry = if let Some(tlb) = &self.tlb {
            let mut tlb = tlb.lock();
            let slot = tlb
                .iter()
                .position(|e| e.is_valid() && e.virtual_page as usize == vpn)
                .ok_or(MachineException::PageFault)?;
            if writing && tlb[slot].flags.contains(PteFlags::READ_ONLY) {
                return Err(MachineException::ReadOnly);
            }
            tlb[slot].flags |= PteFlags::USE;
            if writing {
                tlb[slot].flags |= PteFlags::DIRTY;
            }
            tlb[slot]
        } else {
            let table = self.page_table.lock().clone();
            let table = table.ok_or(MachineException::AddressError)?;
            let mut table = table.lock();
            if vpn >= table.len() {
                return Err(MachineException::AddressError);
            }
            if !table[vpn].is_valid() {
                return Err(MachineException::PageFault);
            }
            if writing && table[vpn].flags.contains(PteFlags::READ_ONLY) {
                return Err(MachineException::ReadOnly);
            }
            table[vpn].flags |= PteFlags::USE;
            if writing {
                table[vpn].flags |= PteFlags::DIRTY;
            }
            table[vpn]
        };

        let phys = entry.physical_page as usize * PAGE_SIZE + offset;
        if entry.physical_page as usize >= self.num_phys_pages {
            return Err(MachineException::BusError);
        }
        Ok(phys as u32)
    }

    /// Install `entry` in the next TLB slot (round robin), returning the
    /// valid entry it displaced so its use/dirty bits can be written back.
    pub fn insert_tlb(&self, entry: TranslationEntry) -> Option<TranslationEntry> {
        let tlb = self.tlb.as_ref().expect("TLB not configured");
        let mut tlb = tlb.lock();
        let slot = self.tlb_cursor.fetch_add(1, Ordering::SeqCst) % TLB_SIZE;
        let evicted = tlb[slot];
        tlb[slot] = entry;
        evicted.is_valid().then_some(evicted)
    }

    pub fn tlb_entry(&self, slot: usize) -> TranslationEntry {
        self.tlb.as_ref().expect("TLB not configured").lock()[slot]
    }

    pub fn invalidate_tlb_entry(&self, slot: usize) {
        self.tlb.as_ref().expect("TLB not configured").lock()[slot]
            .flags
            .remove(PteFlags::VALID);
    }

    pub fn read_phys(&self, phys_addr: usize, buf: &mut [u8]) {
        let memory = self.memory.lock();
        buf.copy_from_slice(&memory[phys_addr..phys_addr + buf.len()]);
    }

    pub fn write_phys(&self, phys_addr: usize, buf: &[u8]) {
        let mut memory = self.memory.lock();
        memory[phys_addr..phys_addr + buf.len()].copy_from_slice(buf);
    }

    pub fn zero_frame(&self, frame: u32) {
        let mut memory = self.memory.lock();
        let base = frame as usize * PAGE_SIZE;
        memory[base..base + PAGE_SIZE].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vpn: u32, frame: u32, flags: PteFlags) -> TranslationEntry {
        TranslationEntry {
            virtual_page: vpn,
            physical_page: frame,
            flags: flags | PteFlags::VALID,
        }
    }

    #[test]
    fn direct_translation_sets_use_and_dirty() {
        let mmu = Mmu::new(4, false);
        let table: PageTable = Arc::new(spin::Mutex::new(vec![
            entry(0, 2, PteFlags::empty()),
            TranslationEntry::invalid(1),
        ]));
        mmu.bind_page_table(table.clone());

        let phys = mmu.translate(5, true).unwrap();
        assert_eq!(phys as usize, 2 * PAGE_SIZE + 5);
        let flags = table.lock()[0].flags;
        assert!(flags.contains(PteFlags::USE | PteFlags::DIRTY));

        assert_eq!(
            mmu.translate(PAGE_SIZE as u32, false),
            Err(MachineException::PageFault)
        );
        assert_eq!(
            mmu.translate((2 * PAGE_SIZE) as u32, false),
            Err(MachineException::AddressError)
        );
    }

    #[test]
    fn tlb_misses_then_hits() {
        let mmu = Mmu::new(4, true);
        assert_eq!(mmu.translate(0, false), Err(MachineException::PageFault));
        assert!(mmu.insert_tlb(entry(0, 1, PteFlags::empty())).is_none());
        assert_eq!(mmu.translate(3, false).unwrap() as usize, PAGE_SIZE + 3);
    }

    #[test]
    fn tlb_insert_rotates_and_reports_evictions() {
        let mmu = Mmu::new(8, true);
        for vpn in 0..TLB_SIZE as u32 {
            assert!(mmu.insert_tlb(entry(vpn, vpn, PteFlags::empty())).is_none());
        }
        let evicted = mmu.insert_tlb(entry(9, 5, PteFlags::empty())).unwrap();
        assert_eq!(evicted.virtual_page, 0);
    }
}
