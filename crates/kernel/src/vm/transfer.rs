//! Byte transfer across the user/kernel boundary.
//!
//! Every access goes through the machine's fallible translation: a miss
//! raises a page fault, the fault is serviced, and the access is retried
//! up to `MEM_TRY_LIMIT` times.  An access that keeps failing after the
//! fault path ran is a kernel invariant violation and aborts.

use crate::kernel::Kernel;
use crate::machine::MEM_TRY_LIMIT;

fn read_user_byte(k: &Kernel, addr: u32) -> u8 {
    for _ in 0..MEM_TRY_LIMIT {
        if let Some(value) = k.machine.read_mem(k, addr, 1) {
            return value as u8;
        }
    }
    panic!("user memory read at {addr:#x} failed after {MEM_TRY_LIMIT} tries");
}

fn write_user_byte(k: &Kernel, addr: u32, value: u8) {
    for _ in 0..MEM_TRY_LIMIT {
        if k.machine.write_mem(k, addr, 1, value as u32) {
            return;
        }
    }
    panic!("user memory write at {addr:#x} failed after {MEM_TRY_LIMIT} tries");
}

/// Read one aligned word of user memory.
pub fn read_user_word(k: &Kernel, addr: u32) -> u32 {
    for _ in 0..MEM_TRY_LIMIT {
        if let Some(value) = k.machine.read_mem(k, addr, 4) {
            return value;
        }
    }
    panic!("user memory read at {addr:#x} failed after {MEM_TRY_LIMIT} tries");
}

/// Write one aligned word of user memory.
pub fn write_user_word(k: &Kernel, addr: u32, value: u32) {
    for _ in 0..MEM_TRY_LIMIT {
        if k.machine.write_mem(k, addr, 4, value) {
            return;
        }
    }
    panic!("user memory write at {addr:#x} failed after {MEM_TRY_LIMIT} tries");
}

/// Copy `count` bytes out of user space.
pub fn read_buffer_from_user(k: &Kernel, user_addr: u32, count: usize) -> Vec<u8> {
    assert!(user_addr != 0);
    (0..count)
        .map(|i| read_user_byte(k, user_addr + i as u32))
        .collect()
}

/// Copy a NUL-terminated string out of user space; `None` if no NUL shows
/// up within `max_count` bytes.
pub fn read_string_from_user(k: &Kernel, user_addr: u32, max_count: usize) -> Option<String> {
    assert!(user_addr != 0);
    let mut bytes = Vec::new();
    for i in 0..max_count {
        let byte = read_user_byte(k, user_addr + i as u32);
        if byte == 0 {
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(byte);
    }
    None
}

/// Copy `buf` into user space.
pub fn write_buffer_to_user(k: &Kernel, buf: &[u8], user_addr: u32) {
    assert!(user_addr != 0);
    for (i, &byte) in buf.iter().enumerate() {
        write_user_byte(k, user_addr + i as u32, byte);
    }
}

/// Copy `string` and its NUL terminator into user space.
pub fn write_string_to_user(k: &Kernel, string: &str, user_addr: u32) {
    assert!(user_addr != 0);
    write_buffer_to_user(k, string.as_bytes(), user_addr);
    write_user_byte(k, user_addr + string.len() as u32, 0);
}
