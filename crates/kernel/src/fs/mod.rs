//! Multi-user-safe filesystem.
//!
//! On-disk: sector 0 holds the header of the free-sector bitmap file,
//! sector 1 the header of the root directory; everything else is file
//! headers, indirection blocks, directory tables and data.  In memory: the
//! file and directory open tables arbitrate concurrent opens, reader/
//! writer access and deletion-while-open, and `freemap_lock` serializes
//! every touch of the free-sector bitmap.
//!
//! Mutating operations write the affected header, directory and bitmap
//! back before returning; on failure the in-memory copies are simply
//! discarded, so no partial state reaches the disk.

pub mod directory;
pub mod directory_table;
pub mod file_header;
pub mod file_lock;
pub mod file_table;
pub mod open_file;
pub mod path;
pub mod synch_disk;

use std::sync::Arc;

use log::debug;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::machine::disk::NUM_SECTORS;
use crate::threads::lock::Lock;
use crate::threads::thread::Thread;
use crate::util::{div_round_up, Bitmap};
use directory::{Directory, DIRECTORY_ENTRY_SIZE, DIRECTORY_FILE_SIZE, FILE_NAME_MAX_LEN, NUM_DIR_ENTRIES};
use directory_table::DirectoryTable;
use file_header::FileHeader;
use file_table::FileTable;
use open_file::OpenFile;
use path::Path;

/// Well-known sector of the free-map file header.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Well-known sector of the root directory file header.
pub const DIRECTORY_SECTOR: u32 = 1;
/// Byte size of the free-map file: one bit per disk sector.
pub const FREE_MAP_FILE_SIZE: u32 = (NUM_SECTORS / 8) as u32;

/// Resolution of one path: where the object lives and what it is.
#[derive(Debug, Clone, Copy)]
struct PathEntry {
    sector: u32,
    is_dir: bool,
}

pub struct FileSystem {
    free_map_file: OpenFile,
    directory_file: OpenFile,
    pub file_table: FileTable,
    pub dir_table: DirectoryTable,
    freemap_lock: Lock,
}

impl FileSystem {
    /// Mount the filesystem, formatting first when asked: sectors 0 and 1
    /// get the free-map and root-directory headers, and both files are
    /// written out in their initial state.
    pub fn new(k: &Kernel, format: bool) -> Self {
        if format {
            debug!(target: "fs", "formatting the file system");
            let mut free_map = Bitmap::new(NUM_SECTORS);
            free_map.mark(FREE_MAP_SECTOR as usize);
            free_map.mark(DIRECTORY_SECTOR as usize);

            let mut map_hdr = FileHeader::new();
            let mut dir_hdr = FileHeader::new();
            map_hdr
                .allocate(&mut free_map, FREE_MAP_FILE_SIZE)
                .expect("no room for the free map file");
            dir_hdr
                .allocate(&mut free_map, DIRECTORY_FILE_SIZE)
                .expect("no room for the root directory file");
            map_hdr.write_back(k, FREE_MAP_SECTOR);
            dir_hdr.write_back(k, DIRECTORY_SECTOR);

            let free_map_file = OpenFile::new_raw(k, FREE_MAP_SECTOR);
            let directory_file = OpenFile::new_raw(k, DIRECTORY_SECTOR);
            let mut root = Directory::new();
            root.set_initial_value(NUM_DIR_ENTRIES);
            free_map.write_back(k, &free_map_file);
            root.write_back(k, &directory_file);

            return Self {
                free_map_file,
                directory_file,
                file_table: FileTable::new(),
                dir_table: DirectoryTable::new(),
                freemap_lock: Lock::new("free map"),
            };
        }

        Self {
            free_map_file: OpenFile::new_raw(k, FREE_MAP_SECTOR),
            directory_file: OpenFile::new_raw(k, DIRECTORY_SECTOR),
            file_table: FileTable::new(),
            dir_table: DirectoryTable::new(),
            freemap_lock: Lock::new("free map"),
        }
    }

    /// Bind the boot thread's working directory to the root, exactly as a
    /// later `chdir` would.
    pub fn first_thread_start(&self, k: &Kernel) {
        let current = k.current_thread();
        self.bind_cwd(k, &current);
    }

    /// Pin `thread`'s working directory in the directory table so it is
    /// counted as an opener and cannot be removed while the thread runs
    /// inside it.  Every thread gets pinned this way when it is forked;
    /// `chdir` moves the pin and `finish` drops it.
    pub(crate) fn bind_cwd(&self, k: &Kernel, thread: &Thread) {
        let sector = self
            .resolve_directory_sector(k, &thread.path())
            .expect("working directory resolved");
        let lock = self.dir_table.open_directory(k, sector);
        thread.set_cwd_lock(lock);
    }

    /// Create a file (or directory) of `initial_size` bytes.
    ///
    /// The parent is resolved from the caller's working directory; its
    /// directory lock blocks concurrent structural changes, and the free
    /// map is touched only under `freemap_lock`.  A full parent directory
    /// is extended by one entry on the fly.
    pub fn create(
        &self,
        k: &Kernel,
        name: &str,
        initial_size: u32,
        is_directory: bool,
    ) -> Result<(), KernelError> {
        let mut path = k.current_thread().path();
        path.merge(name);
        let mut parent_path = path.clone();
        let file_name = parent_path.split().ok_or(KernelError::AlreadyExists)?;
        debug!(target: "fs",
            "creating {} {path} ({initial_size} bytes)",
            if is_directory { "directory" } else { "file" });

        let parent = match self.find_path(k, &parent_path) {
            Some(entry) if entry.is_dir => entry,
            Some(_) => return Err(KernelError::NotADirectory),
            None => return Err(KernelError::NotFound),
        };
        let dir_lock = self.dir_table.open_directory(k, parent.sector);
        dir_lock.acquire(k);

        let dir_file = OpenFile::new_raw(k, parent.sector);
        let mut dir = Directory::new();
        dir.fetch_from(k, &dir_file);

        let mut result = Ok(());
        if file_name.len() > FILE_NAME_MAX_LEN {
            result = Err(KernelError::NameTooLong);
        } else if dir.find(&file_name).is_some() {
            result = Err(KernelError::AlreadyExists);
        } else {
            self.freemap_lock.acquire(k);
            let mut free_map = Bitmap::new(NUM_SECTORS);
            free_map.fetch_from(k, &self.free_map_file);
            match free_map.find() {
                None => result = Err(KernelError::NoSpace),
                Some(header_sector) => {
                    let header_sector = header_sector as u32;
                    let needs_extend = dir
                        .add(&file_name, header_sector, is_directory)
                        .expect("directory insert after the existence check");
                    if needs_extend {
                        result = dir_file.with_header_mut(|hdr| {
                            hdr.extend(&mut free_map, DIRECTORY_ENTRY_SIZE as u32)
                        });
                    }
                    if result.is_ok() {
                        let mut hdr = FileHeader::new();
                        result = hdr.allocate(&mut free_map, initial_size);
                        if result.is_ok() {
                            dir_file.write_header_back(k);
                            hdr.write_back(k, header_sector);
                            dir.write_back(k, &dir_file);
                            free_map.write_back(k, &self.free_map_file);
                            if is_directory {
                                let mut child = Directory::new();
                                child.set_initial_value(
                                    initial_size as usize / DIRECTORY_ENTRY_SIZE,
                                );
                                let child_file = OpenFile::new_raw(k, header_sector);
                                child.write_back(k, &child_file);
                            }
                        }
                    }
                }
            }
            self.freemap_lock.release(k);
        }

        dir_lock.release(k);
        self.dir_table.close_directory(k, parent.sector);
        result
    }

    /// Open a file for reading and writing.  Directories cannot be opened,
    /// and a file with a pending removal takes no new opens.
    pub fn open(&self, k: &Kernel, name: &str) -> Result<Arc<OpenFile>, KernelError> {
        let mut path = k.current_thread().path();
        path.merge(name);
        debug!(target: "fs", "opening {path}");

        let entry = match self.find_path(k, &path) {
            Some(entry) if entry.is_dir => return Err(KernelError::IsADirectory),
            Some(entry) => entry,
            None => return Err(KernelError::NotFound),
        };
        let parent = self
            .find_path(k, &path.parent())
            .expect("parent of a resolved path");
        let dir_lock = self.dir_table.open_directory(k, parent.sector);
        dir_lock.acquire(k);

        let file_lock = self.file_table.open_file(k, entry.sector);
        let result = match file_lock {
            Some(file_lock) => Ok(Arc::new(OpenFile::new_registered(
                k,
                entry.sector,
                file_lock,
                path,
            ))),
            None => Err(KernelError::RemovePending),
        };

        dir_lock.release(k);
        self.dir_table.close_directory(k, parent.sector);
        result
    }

    /// Remove a file or an empty, otherwise-unopened directory.
    ///
    /// A file that is still open is only marked: the last close unlinks
    /// it, and until then existing handles keep working.  For directories
    /// the child's lock and table entry stay held across the emptiness
    /// check *and* the disk delete, so no concurrent create can slip into
    /// a dying directory.
    pub fn remove(&self, k: &Kernel, name: &str) -> Result<(), KernelError> {
        let mut path = k.current_thread().path();
        path.merge(name);
        debug!(target: "fs", "removing {path}");

        let entry = match self.find_path(k, &path) {
            Some(entry) => entry,
            None => return Err(KernelError::NotFound),
        };
        let parent = self
            .find_path(k, &path.parent())
            .expect("parent of a resolved path");
        let parent_lock = self.dir_table.open_directory(k, parent.sector);
        parent_lock.acquire(k);

        let result = if entry.is_dir {
            self.remove_directory(k, &path, entry.sector)
        } else {
            // The held parent lock keeps new opens of this file out until
            // the unlink is done.
            if self.file_table.set_remove(k, entry.sector) {
                self.disk_delete(k, &path);
            }
            Ok(())
        };

        parent_lock.release(k);
        self.dir_table.close_directory(k, parent.sector);
        result
    }

    fn remove_directory(&self, k: &Kernel, path: &Path, sector: u32) -> Result<(), KernelError> {
        let child_lock = self.dir_table.open_directory(k, sector);
        child_lock.acquire(k);

        let child_file = OpenFile::new_raw(k, sector);
        let mut child = Directory::new();
        child.fetch_from(k, &child_file);

        let result = if !child.is_empty() {
            Err(KernelError::DirectoryNotEmpty)
        } else if !self.dir_table.sole_opener(k, sector) {
            Err(KernelError::DirectoryInUse)
        } else {
            self.disk_delete(k, path);
            Ok(())
        };
        child_lock.release(k);
        self.dir_table.close_directory(k, sector);
        result
    }

    /// Unlink `path` on disk: drop its directory entry, free its header,
    /// indirection and data sectors.  All bitmap edits happen under
    /// `freemap_lock`.
    fn disk_delete(&self, k: &Kernel, path: &Path) {
        let mut parent_path = path.clone();
        let file_name = parent_path.split().expect("cannot unlink the root");
        let parent = self
            .find_path(k, &parent_path)
            .expect("parent of an unlinked path");

        self.freemap_lock.acquire(k);
        let dir_file = OpenFile::new_raw(k, parent.sector);
        let mut dir = Directory::new();
        dir.fetch_from(k, &dir_file);
        let sector = dir.find(&file_name).expect("unlink of a missing entry");
        dir.remove(&file_name);
        dir.write_back(k, &dir_file);

        let mut hdr = FileHeader::new();
        hdr.fetch_from(k, sector);
        let mut free_map = Bitmap::new(NUM_SECTORS);
        free_map.fetch_from(k, &self.free_map_file);
        hdr.deallocate(&mut free_map);
        free_map.clear(sector as usize);
        free_map.write_back(k, &self.free_map_file);
        self.freemap_lock.release(k);
        debug!(target: "fs", "unlinked {path} (header sector {sector})");
    }

    /// Close protocol for handles opened through `open`: drop the table
    /// entry and, when a pending removal just lost its last holder, unlink
    /// the file under the parent's directory lock.
    pub(crate) fn close_open_file(&self, k: &Kernel, file: &OpenFile) {
        let path = file.path().expect("close of an unregistered file").clone();
        let parent_path = path.parent();

        let parent = self
            .find_path(k, &parent_path)
            .expect("parent of an open file");
        let dir_lock = self.dir_table.open_directory(k, parent.sector);
        dir_lock.acquire(k);

        let unlink = self.file_table.close_file(k, file.sector());
        if unlink {
            self.disk_delete(k, &path);
        }

        dir_lock.release(k);
        self.dir_table.close_directory(k, parent.sector);
    }

    /// Grow an open file by `extend_size` bytes, writing the header and
    /// bitmap back on success.
    pub(crate) fn extend_open_file(
        &self,
        k: &Kernel,
        file: &OpenFile,
        extend_size: u32,
    ) -> Result<(), KernelError> {
        self.freemap_lock.acquire(k);
        let mut free_map = Bitmap::new(NUM_SECTORS);
        free_map.fetch_from(k, &self.free_map_file);
        let result = file.with_header_mut(|hdr| hdr.extend(&mut free_map, extend_size));
        if result.is_ok() {
            file.write_header_back(k);
            free_map.write_back(k, &self.free_map_file);
        }
        self.freemap_lock.release(k);
        result
    }

    /// Create a directory (fixed initial table, growable later).
    pub fn mkdir(&self, k: &Kernel, name: &str) -> Result<(), KernelError> {
        self.create(k, name, DIRECTORY_FILE_SIZE, true)
    }

    /// Change the calling thread's working directory, moving its open on
    /// the directory table from the old directory to the new one.
    pub fn chdir(&self, k: &Kernel, name: &str) -> Result<(), KernelError> {
        let current = k.current_thread();
        let mut path = current.path();
        path.merge(name);

        let entry = match self.find_path(k, &path) {
            Some(entry) if entry.is_dir => entry,
            Some(_) => return Err(KernelError::NotADirectory),
            None => return Err(KernelError::NotFound),
        };
        let old = self.find_path(k, &current.path());
        let new_lock = self.dir_table.open_directory(k, entry.sector);
        if current.set_cwd_lock(new_lock).is_some() {
            let old = old.expect("working directory resolved");
            self.dir_table.close_directory(k, old.sector);
        }
        current.set_path(path);
        Ok(())
    }

    /// Entries of the calling thread's working directory.
    pub fn list(&self, k: &Kernel) -> Vec<(String, bool)> {
        let path = k.current_thread().path();
        let entry = self
            .find_path(k, &path)
            .expect("working directory resolved");
        let dir_lock = self.dir_table.open_directory(k, entry.sector);

        dir_lock.acquire(k);
        let dir_file = OpenFile::new_raw(k, entry.sector);
        let mut dir = Directory::new();
        dir.fetch_from(k, &dir_file);
        let listing = dir.list();
        dir_lock.release(k);

        self.dir_table.close_directory(k, entry.sector);
        listing
    }

    pub(crate) fn resolve_directory_sector(&self, k: &Kernel, path: &Path) -> Option<u32> {
        self.find_path(k, path)
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.sector)
    }

    /// Walk `path` from the root directory.
    fn find_path(&self, k: &Kernel, path: &Path) -> Option<PathEntry> {
        let mut entry = PathEntry {
            sector: DIRECTORY_SECTOR,
            is_dir: true,
        };
        for part in path.components() {
            if !entry.is_dir {
                return None;
            }
            let dir_file = OpenFile::new_raw(k, entry.sector);
            let mut dir = Directory::new();
            dir.fetch_from(k, &dir_file);
            let index = dir.find_index(part)?;
            let found = &dir.table()[index];
            entry = PathEntry {
                sector: found.sector,
                is_dir: found.is_dir,
            };
        }
        Some(entry)
    }

    /// Consistency check: rebuild a shadow bitmap by walking every header
    /// (direct, first- and second-indirection blocks) of every file,
    /// recursing through subdirectories, and compare it with the on-disk
    /// free map.  Returns true when the filesystem is consistent.
    pub fn check(&self, k: &Kernel) -> bool {
        debug!(target: "fs", "performing filesystem check");
        let mut shadow = Bitmap::new(NUM_SECTORS);
        shadow.mark(FREE_MAP_SECTOR as usize);
        shadow.mark(DIRECTORY_SECTOR as usize);
        let mut error = false;

        let mut map_hdr = FileHeader::new();
        map_hdr.fetch_from(k, FREE_MAP_SECTOR);
        if map_hdr.file_length() != FREE_MAP_FILE_SIZE {
            debug!(target: "fs", "bad free map header: wrong file size");
            error = true;
        }
        error |= check_file_header(&map_hdr, &mut shadow);

        let mut dir_hdr = FileHeader::new();
        dir_hdr.fetch_from(k, DIRECTORY_SECTOR);
        error |= check_file_header(&dir_hdr, &mut shadow);
        error |= self.check_directory(k, DIRECTORY_SECTOR, &mut shadow);

        let mut free_map = Bitmap::new(NUM_SECTORS);
        free_map.fetch_from(k, &self.free_map_file);
        for sector in 0..NUM_SECTORS {
            if free_map.test(sector) != shadow.test(sector) {
                debug!(target: "fs", "inconsistent bitmap at sector {sector}");
                error = true;
            }
        }
        debug!(target: "fs",
            "filesystem check {}", if error { "failed" } else { "succeeded" });
        !error
    }

    fn check_directory(&self, k: &Kernel, sector: u32, shadow: &mut Bitmap) -> bool {
        let dir_file = OpenFile::new_raw(k, sector);
        let mut dir = Directory::new();
        dir.fetch_from(k, &dir_file);
        let mut error = false;
        let mut seen: Vec<&str> = Vec::new();

        for entry in dir.table().iter().filter(|e| e.in_use) {
            if entry.name.len() > FILE_NAME_MAX_LEN {
                debug!(target: "fs", "file name too long: {}", entry.name);
                error = true;
            }
            if seen.contains(&entry.name.as_str()) {
                debug!(target: "fs", "repeated file name: {}", entry.name);
                error = true;
            } else {
                seen.push(&entry.name);
            }
            error |= check_sector(entry.sector, shadow);
            let mut hdr = FileHeader::new();
            hdr.fetch_from(k, entry.sector);
            error |= check_file_header(&hdr, shadow);
            if entry.is_dir {
                error |= self.check_directory(k, entry.sector, shadow);
            }
        }
        error
    }
}

fn check_sector(sector: u32, shadow: &mut Bitmap) -> bool {
    if sector as usize >= NUM_SECTORS {
        debug!(target: "fs", "sector number {sector} too big");
        return true;
    }
    if shadow.test(sector as usize) {
        debug!(target: "fs", "sector {sector} already in use");
        return true;
    }
    shadow.mark(sector as usize);
    false
}

fn check_file_header(hdr: &FileHeader, shadow: &mut Bitmap) -> bool {
    let raw = hdr.raw();
    let mut error = false;
    if raw.num_sectors
        < div_round_up(raw.num_bytes, crate::machine::disk::SECTOR_SIZE as u32)
    {
        debug!(target: "fs", "sector count not compatible with file size");
        error = true;
    }
    for index in 0..raw.num_sectors as usize {
        error |= check_sector(hdr.get_sector(index), shadow);
    }
    for sector in hdr.indirection_sectors() {
        error |= check_sector(sector, shadow);
    }
    error
}
