//! On-disk file headers (inodes).
//!
//! A header occupies exactly one sector: byte/sector counts, the direct
//! block table, and the sector numbers of the optional first- and
//! second-indirection blocks (-1 when absent).  An indirection sector is a
//! flat table of `NUM_DIRECT2` sector numbers; the second level points at
//! further tables of data sectors.
//!
//! After any successful operation the in-memory header and the free map
//! describe exactly the same sector set; `deallocate` asserts that.

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::machine::disk::SECTOR_SIZE;
use crate::util::{div_round_up, Bitmap};

/// Data sectors addressed directly from the header.
pub const NUM_DIRECT: usize = 26;
/// Sector numbers per indirection block.
pub const NUM_DIRECT2: usize = SECTOR_SIZE / 4;
/// Largest file the three-level map can address.
pub const MAX_FILE_SIZE: u32 =
    ((NUM_DIRECT + NUM_DIRECT2 + NUM_DIRECT2 * NUM_DIRECT2) * SECTOR_SIZE) as u32;

const NO_INDIRECTION: i32 = -1;

#[derive(Debug, Clone)]
pub struct RawFileHeader {
    pub num_bytes: u32,
    pub num_sectors: u32,
    /// Valid entries in the first-indirection block.
    pub fi_quantity: u32,
    /// Data sectors addressed through the second-indirection tree.
    pub si_quantity: u32,
    pub first_indirection: i32,
    pub second_indirection: i32,
    pub data_sectors: [u32; NUM_DIRECT],
}

impl Default for RawFileHeader {
    fn default() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            fi_quantity: 0,
            si_quantity: 0,
            first_indirection: NO_INDIRECTION,
            second_indirection: NO_INDIRECTION,
            data_sectors: [0; NUM_DIRECT],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawIndirection {
    pub data_sectors: [u32; NUM_DIRECT2],
}

impl Default for RawIndirection {
    fn default() -> Self {
        Self {
            data_sectors: [0; NUM_DIRECT2],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    raw: RawFileHeader,
    first_ind: RawIndirection,
    second_ind: RawIndirection,
    second_tables: Vec<RawIndirection>,
}

impl FileHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> &RawFileHeader {
        &self.raw
    }

    pub fn file_length(&self) -> u32 {
        self.raw.num_bytes
    }

    /// Reserve every data and indirection sector a `size`-byte file needs.
    /// On failure nothing has been taken from `free_map`.
    pub fn allocate(&mut self, free_map: &mut Bitmap, size: u32) -> Result<(), KernelError> {
        if size > MAX_FILE_SIZE {
            return Err(KernelError::FileTooLarge);
        }
        let target = div_round_up(size, SECTOR_SIZE as u32) as usize;
        if free_map.count_clear() < target + Self::overhead_between(0, target, &self.raw) {
            return Err(KernelError::NoSpace);
        }
        for index in 0..target {
            self.append_sector(free_map, index);
        }
        self.raw.num_bytes = size;
        self.raw.num_sectors = target as u32;
        Ok(())
    }

    /// Grow the file by `extend_size` bytes.  Growth inside the slack of
    /// the last allocated sector just bumps the byte count; otherwise new
    /// data sectors (and indirection blocks, as the layout upgrades) are
    /// reserved.  On failure the header and free map are untouched.
    pub fn extend(&mut self, free_map: &mut Bitmap, extend_size: u32) -> Result<(), KernelError> {
        let new_bytes = self.raw.num_bytes + extend_size;
        if new_bytes > MAX_FILE_SIZE {
            return Err(KernelError::FileTooLarge);
        }
        let slack = self.raw.num_sectors * SECTOR_SIZE as u32 - self.raw.num_bytes;
        if extend_size <= slack {
            self.raw.num_bytes = new_bytes;
            return Ok(());
        }
        let current = self.raw.num_sectors as usize;
        let target = div_round_up(new_bytes, SECTOR_SIZE as u32) as usize;
        let needed = (target - current) + Self::overhead_between(current, target, &self.raw);
        if free_map.count_clear() < needed {
            return Err(KernelError::NoSpace);
        }
        for index in current..target {
            self.append_sector(free_map, index);
        }
        self.raw.num_bytes = new_bytes;
        self.raw.num_sectors = target as u32;
        Ok(())
    }

    /// Return every sector of this file to `free_map`.  Each one ought to
    /// be marked; anything else is a bitmap inconsistency and aborts.
    pub fn deallocate(&self, free_map: &mut Bitmap) {
        for index in 0..self.raw.num_sectors as usize {
            let sector = self.get_sector(index) as usize;
            assert!(free_map.test(sector), "data sector {sector} not marked");
            free_map.clear(sector);
        }
        for sector in self.indirection_sectors() {
            let sector = sector as usize;
            assert!(free_map.test(sector), "indirection sector {sector} not marked");
            free_map.clear(sector);
        }
    }

    /// The indirection blocks themselves (first level, second level, and
    /// the second-level tables), in no particular order.
    pub fn indirection_sectors(&self) -> Vec<u32> {
        let mut sectors = Vec::new();
        if self.raw.first_indirection != NO_INDIRECTION {
            sectors.push(self.raw.first_indirection as u32);
        }
        if self.raw.second_indirection != NO_INDIRECTION {
            sectors.push(self.raw.second_indirection as u32);
            for table in 0..self.second_table_count() {
                sectors.push(self.second_ind.data_sectors[table]);
            }
        }
        sectors
    }

    /// Sector holding the file byte at `offset`.
    pub fn byte_to_sector(&self, offset: u32) -> u32 {
        self.get_sector((offset as usize) / SECTOR_SIZE)
    }

    pub fn get_sector(&self, index: usize) -> u32 {
        assert!(index < self.raw.num_sectors as usize);
        if index < NUM_DIRECT {
            return self.raw.data_sectors[index];
        }
        let index = index - NUM_DIRECT;
        if index < NUM_DIRECT2 {
            return self.first_ind.data_sectors[index];
        }
        let index = index - NUM_DIRECT2;
        self.second_tables[index / NUM_DIRECT2].data_sectors[index % NUM_DIRECT2]
    }

    fn second_table_count(&self) -> usize {
        div_round_up(self.raw.si_quantity, NUM_DIRECT2 as u32) as usize
    }

    /// Indirection sectors that must come from the free map to move from
    /// `current` to `target` data sectors.
    fn overhead_between(current: usize, target: usize, raw: &RawFileHeader) -> usize {
        let mut overhead = 0;
        if target > NUM_DIRECT && raw.first_indirection == NO_INDIRECTION {
            overhead += 1;
        }
        if target > NUM_DIRECT + NUM_DIRECT2 {
            if raw.second_indirection == NO_INDIRECTION {
                overhead += 1;
            }
            let target_tables =
                div_round_up((target - NUM_DIRECT - NUM_DIRECT2) as u32, NUM_DIRECT2 as u32);
            let current_tables = if current > NUM_DIRECT + NUM_DIRECT2 {
                div_round_up(
                    (current - NUM_DIRECT - NUM_DIRECT2) as u32,
                    NUM_DIRECT2 as u32,
                )
            } else {
                0
            };
            overhead += (target_tables - current_tables) as usize;
        }
        overhead
    }

    /// Reserve the data sector for slot `index`, materializing indirection
    /// blocks on the way.  The caller has verified the free map has room.
    fn append_sector(&mut self, free_map: &mut Bitmap, index: usize) {
        let mut grab = || free_map.find().expect("free map exhausted mid-allocation") as u32;
        if index < NUM_DIRECT {
            self.raw.data_sectors[index] = grab();
            return;
        }
        let index = index - NUM_DIRECT;
        if index < NUM_DIRECT2 {
            if self.raw.first_indirection == NO_INDIRECTION {
                self.raw.first_indirection = grab() as i32;
            }
            self.first_ind.data_sectors[index] = grab();
            self.raw.fi_quantity += 1;
            return;
        }
        let index = index - NUM_DIRECT2;
        if self.raw.second_indirection == NO_INDIRECTION {
            self.raw.second_indirection = grab() as i32;
        }
        let table = index / NUM_DIRECT2;
        if table == self.second_tables.len() {
            self.second_ind.data_sectors[table] = grab();
            self.second_tables.push(RawIndirection::default());
        }
        self.second_tables[table].data_sectors[index % NUM_DIRECT2] = grab();
        self.raw.si_quantity += 1;
    }

    /// Read the header (and any populated indirection blocks) from disk.
    pub fn fetch_from(&mut self, k: &Kernel, sector: u32) {
        let mut buf = [0u8; SECTOR_SIZE];
        k.synch_disk.read_sector(k, sector as usize, &mut buf);
        self.raw = decode_header(&buf);
        self.second_tables.clear();
        if self.raw.first_indirection != NO_INDIRECTION {
            k.synch_disk
                .read_sector(k, self.raw.first_indirection as usize, &mut buf);
            self.first_ind = decode_indirection(&buf);
            if self.raw.second_indirection != NO_INDIRECTION {
                k.synch_disk
                    .read_sector(k, self.raw.second_indirection as usize, &mut buf);
                self.second_ind = decode_indirection(&buf);
                for table in 0..self.second_table_count() {
                    k.synch_disk.read_sector(
                        k,
                        self.second_ind.data_sectors[table] as usize,
                        &mut buf,
                    );
                    self.second_tables.push(decode_indirection(&buf));
                }
            }
        }
    }

    /// Write the header (and any populated indirection blocks) to disk.
    pub fn write_back(&self, k: &Kernel, sector: u32) {
        k.synch_disk
            .write_sector(k, sector as usize, &encode_header(&self.raw));
        if self.raw.first_indirection != NO_INDIRECTION {
            k.synch_disk.write_sector(
                k,
                self.raw.first_indirection as usize,
                &encode_indirection(&self.first_ind),
            );
            if self.raw.second_indirection != NO_INDIRECTION {
                k.synch_disk.write_sector(
                    k,
                    self.raw.second_indirection as usize,
                    &encode_indirection(&self.second_ind),
                );
                for (table, entries) in self.second_tables.iter().enumerate() {
                    k.synch_disk.write_sector(
                        k,
                        self.second_ind.data_sectors[table] as usize,
                        &encode_indirection(entries),
                    );
                }
            }
        }
    }
}

fn encode_header(raw: &RawFileHeader) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    buf[0..4].copy_from_slice(&raw.num_bytes.to_le_bytes());
    buf[4..8].copy_from_slice(&raw.num_sectors.to_le_bytes());
    buf[8..12].copy_from_slice(&raw.fi_quantity.to_le_bytes());
    buf[12..16].copy_from_slice(&raw.si_quantity.to_le_bytes());
    buf[16..20].copy_from_slice(&raw.first_indirection.to_le_bytes());
    buf[20..24].copy_from_slice(&raw.second_indirection.to_le_bytes());
    for (i, sector) in raw.data_sectors.iter().enumerate() {
        let at = 24 + i * 4;
        buf[at..at + 4].copy_from_slice(&sector.to_le_bytes());
    }
    buf
}

fn decode_header(buf: &[u8; SECTOR_SIZE]) -> RawFileHeader {
    let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
    let mut raw = RawFileHeader {
        num_bytes: word(0),
        num_sectors: word(4),
        fi_quantity: word(8),
        si_quantity: word(12),
        first_indirection: word(16) as i32,
        second_indirection: word(20) as i32,
        data_sectors: [0; NUM_DIRECT],
    };
    for i in 0..NUM_DIRECT {
        raw.data_sectors[i] = word(24 + i * 4);
    }
    raw
}

fn encode_indirection(ind: &RawIndirection) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, sector) in ind.data_sectors.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&sector.to_le_bytes());
    }
    buf
}

fn decode_indirection(buf: &[u8; SECTOR_SIZE]) -> RawIndirection {
    let mut ind = RawIndirection::default();
    for i in 0..NUM_DIRECT2 {
        ind.data_sectors[i] = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
    ind
}
