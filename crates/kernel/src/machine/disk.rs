//! Raw sector device.
//!
//! The simulated disk is a flat host file of `NUM_SECTORS` sectors.  A real
//! device would raise a completion interrupt; this model performs the I/O
//! synchronously and fires the completion callback before returning, which
//! is all the synchronous disk layer above needs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

/// Disk I/O unit, in bytes.
pub const SECTOR_SIZE: usize = 128;
/// Total sectors on the simulated disk.
pub const NUM_SECTORS: usize = 1024;

pub struct Disk {
    file: spin::Mutex<File>,
}

impl Disk {
    /// Open (or create) the backing file.  A formatted boot starts from an
    /// all-zero disk image.
    pub fn open(path: &Path, format: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if format {
            file.set_len(0)?;
        }
        file.set_len((NUM_SECTORS * SECTOR_SIZE) as u64)?;
        debug!(target: "machine", "disk image at {} ({} sectors)", path.display(), NUM_SECTORS);
        Ok(Self {
            file: spin::Mutex::new(file),
        })
    }

    pub fn read_sector(&self, sector: usize, data: &mut [u8], done: impl FnOnce()) {
        assert!(sector < NUM_SECTORS);
        assert_eq!(data.len(), SECTOR_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("disk seek failed");
        file.read_exact(data).expect("disk read failed");
        drop(file);
        done();
    }

    pub fn write_sector(&self, sector: usize, data: &[u8], done: impl FnOnce()) {
        assert!(sector < NUM_SECTORS);
        assert_eq!(data.len(), SECTOR_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("disk seek failed");
        file.write_all(data).expect("disk write failed");
        drop(file);
        done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(&dir.path().join("DISK"), true).unwrap();
        let mut fired = false;
        let payload = [0xabu8; SECTOR_SIZE];
        disk.write_sector(7, &payload, || fired = true);
        assert!(fired);
        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(7, &mut back, || {});
        assert_eq!(back, payload);
    }
}
