//! User executable images.
//!
//! Layout: a 28-byte header (magic word, then `{addr, size}` for the
//! code, initialized-data and uninitialized-data segments) followed by
//! the code and initialized-data bytes, in that order.

use crate::fs::open_file::OpenFile;
use crate::kernel::Kernel;

pub const EXECUTABLE_MAGIC: u32 = 0x4e6f4646;
pub const HEADER_SIZE: u32 = 28;

#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub addr: u32,
    pub size: u32,
}

pub struct Executable<'a> {
    file: &'a OpenFile,
    magic: u32,
    code: Segment,
    init_data: Segment,
    uninit_data: Segment,
}

impl<'a> Executable<'a> {
    pub fn new(k: &Kernel, file: &'a OpenFile) -> Self {
        let mut header = [0u8; HEADER_SIZE as usize];
        let read = file.read_at(k, &mut header, 0);
        let word = |at: usize| {
            u32::from_le_bytes(header[at..at + 4].try_into().unwrap())
        };
        let mut exe = Self {
            file,
            magic: 0,
            code: Segment::default(),
            init_data: Segment::default(),
            uninit_data: Segment::default(),
        };
        if read == header.len() {
            exe.magic = word(0);
            exe.code = Segment { addr: word(4), size: word(8) };
            exe.init_data = Segment { addr: word(12), size: word(16) };
            exe.uninit_data = Segment { addr: word(20), size: word(24) };
        }
        exe
    }

    pub fn check_magic(&self) -> bool {
        self.magic == EXECUTABLE_MAGIC
    }

    /// Total address-space bytes the image claims, stack excluded.
    pub fn size(&self) -> u32 {
        self.code.size + self.init_data.size + self.uninit_data.size
    }

    pub fn code(&self) -> Segment {
        self.code
    }

    pub fn init_data(&self) -> Segment {
        self.init_data
    }

    /// Read code bytes starting `offset` into the segment.
    pub fn read_code_block(&self, k: &Kernel, dst: &mut [u8], offset: u32) -> usize {
        self.file.read_at(k, dst, HEADER_SIZE + offset)
    }

    /// Read initialized-data bytes starting `offset` into the segment.
    pub fn read_data_block(&self, k: &Kernel, dst: &mut [u8], offset: u32) -> usize {
        self.file.read_at(k, dst, HEADER_SIZE + self.code.size + offset)
    }
}

/// Build an image in the on-disk layout; the seam test programs use to
/// fabricate executables.
pub fn build_image(code: &[u8], init_data: &[u8], uninit_data_size: u32) -> Vec<u8> {
    let mut image = Vec::with_capacity(HEADER_SIZE as usize + code.len() + init_data.len());
    image.extend_from_slice(&EXECUTABLE_MAGIC.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&(code.len() as u32).to_le_bytes());
    image.extend_from_slice(&(code.len() as u32).to_le_bytes());
    image.extend_from_slice(&(init_data.len() as u32).to_le_bytes());
    image.extend_from_slice(&((code.len() + init_data.len()) as u32).to_le_bytes());
    image.extend_from_slice(&uninit_data_size.to_le_bytes());
    image.extend_from_slice(code);
    image.extend_from_slice(init_data);
    image
}
