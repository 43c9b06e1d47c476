//! Syscall dispatch.
//!
//! Calling convention: syscall id in r2, arguments in r4-r7, result back
//! in r2 (negative on error).  The program counter advances past the
//! syscall instruction before returning to user mode, and an expired time
//! slice is honored on the way out.

use std::sync::Arc;

use log::debug;

use crate::kernel::Kernel;
use crate::machine::{NEXT_PC_REG, PC_REG, PREV_PC_REG, STACK_REG};
use crate::threads::thread::{self, Thread};
use crate::vm::address_space::AddressSpace;
use crate::vm::transfer;

pub const SC_HALT: i32 = 0;
pub const SC_EXIT: i32 = 1;
pub const SC_EXEC: i32 = 2;
pub const SC_JOIN: i32 = 3;
pub const SC_CREATE: i32 = 4;
pub const SC_REMOVE: i32 = 5;
pub const SC_OPEN: i32 = 6;
pub const SC_READ: i32 = 7;
pub const SC_WRITE: i32 = 8;
pub const SC_CLOSE: i32 = 9;
pub const SC_PS: i32 = 10;

/// Reserved console descriptors.
pub const CONSOLE_INPUT: i32 = 0;
pub const CONSOLE_OUTPUT: i32 = 1;

/// Longest path accepted from user space, NUL included.
const MAX_PATH_LEN: usize = 128;
/// Longest single `Exec` argument string.
const MAX_ARG_LEN: usize = 128;
/// Most `Exec` arguments marshalled onto the child stack.
const MAX_ARG_COUNT: usize = 32;

/// Service the syscall exception the running user program just raised.
pub fn handle_syscall(k: &Arc<Kernel>) {
    let scid = k.machine.read_register(2);
    match scid {
        SC_HALT => {
            debug!(target: "syscall", "shutdown initiated by user program");
            k.halt();
        }
        SC_EXIT => {
            let status = k.machine.read_register(4);
            let current = k.current_thread();
            debug!(target: "syscall",
                "thread \"{}\" exited with status {status}", current.name());
            current.finish(k, status);
            // Unreachable for the simulated thread; the dying host thread
            // unwinds without touching the machine again.
            return;
        }
        SC_EXEC => handle_exec(k),
        SC_JOIN => {
            let id = k.machine.read_register(4);
            let status = match usize::try_from(id).ok().and_then(|id| k.thread(id)) {
                Some(target) if target.is_joinable() => target.join(k),
                _ => {
                    debug!(target: "syscall", "join of unknown or unjoinable space {id}");
                    -1
                }
            };
            k.machine.write_register(2, status);
        }
        SC_CREATE => {
            let result = match read_user_path(k, 4) {
                Some(name) => match k.file_system().create(k, &name, 0, false) {
                    Ok(()) => 0,
                    Err(e) => {
                        debug!(target: "syscall", "create of `{name}` failed: {e}");
                        -1
                    }
                },
                None => -1,
            };
            k.machine.write_register(2, result);
        }
        SC_REMOVE => {
            let result = match read_user_path(k, 4) {
                Some(name) => match k.file_system().remove(k, &name) {
                    Ok(()) => 0,
                    Err(e) => {
                        debug!(target: "syscall", "remove of `{name}` failed: {e}");
                        -1
                    }
                },
                None => -1,
            };
            k.machine.write_register(2, result);
        }
        SC_OPEN => {
            let result = match read_user_path(k, 4) {
                Some(name) => match k.file_system().open(k, &name) {
                    Ok(file) => match k.current_thread().file_open(file.clone()) {
                        Some(fd) => fd,
                        None => {
                            file.close(k);
                            -1
                        }
                    },
                    Err(e) => {
                        debug!(target: "syscall", "open of `{name}` failed: {e}");
                        -1
                    }
                },
                None => -1,
            };
            k.machine.write_register(2, result);
        }
        SC_CLOSE => {
            let fd = k.machine.read_register(4);
            let result = match k.current_thread().file_close(fd) {
                Some(file) => {
                    file.close(k);
                    0
                }
                None => -1,
            };
            k.machine.write_register(2, result);
        }
        SC_READ => handle_read(k),
        SC_WRITE => handle_write(k),
        SC_PS => {
            k.scheduler.print(&k.current_thread());
            k.machine.write_register(2, 0);
        }
        _ => panic!("unexpected system call id {scid}"),
    }

    increment_pc(k);
    if k.interrupt.take_yield_request() {
        thread::yield_now(k);
    }
}

fn handle_exec(k: &Arc<Kernel>) {
    let name = match read_user_path(k, 4) {
        Some(name) => name,
        None => {
            k.machine.write_register(2, -1);
            return;
        }
    };
    let argv_addr = k.machine.read_register(5) as u32;
    let joinable = k.machine.read_register(6) != 0;

    let executable = match k.file_system().open(k, &name) {
        Ok(file) => file,
        Err(e) => {
            debug!(target: "syscall", "exec cannot open `{name}`: {e}");
            k.machine.write_register(2, -1);
            return;
        }
    };
    let thread = Thread::new(k, &name, joinable);
    let space = match AddressSpace::new(k, Arc::clone(&executable), thread.id()) {
        Ok(space) => space,
        Err(e) => {
            debug!(target: "syscall", "exec cannot build a space for `{name}`: {e}");
            executable.close(k);
            k.unregister_thread(thread.id());
            k.machine.write_register(2, -1);
            return;
        }
    };
    thread.set_space(space);

    let args = (argv_addr != 0).then(|| save_args(k, argv_addr));
    debug!(target: "syscall",
        "exec of `{name}` as space {} (joinable: {joinable})", thread.id());
    thread.fork(k, Box::new(move |k| start_process(k, args)));
    k.machine.write_register(2, thread.id() as i32);
}

fn handle_read(k: &Arc<Kernel>) {
    let user_buffer = k.machine.read_register(4) as u32;
    let size = k.machine.read_register(5);
    let id = k.machine.read_register(6);
    if size <= 0 {
        k.machine.write_register(2, 0);
        return;
    }
    let size = size as usize;

    let result = match id {
        CONSOLE_INPUT => {
            let mut buf = vec![0u8; size];
            k.synch_console.read(k, &mut buf);
            transfer::write_buffer_to_user(k, &buf, user_buffer);
            size as i32
        }
        CONSOLE_OUTPUT => {
            debug!(target: "syscall", "cannot read from console output");
            0
        }
        fd => match k.current_thread().file_get(fd) {
            Some(file) => {
                let mut buf = vec![0u8; size];
                let read = file.read(k, &mut buf);
                if read > 0 {
                    transfer::write_buffer_to_user(k, &buf[..read], user_buffer);
                }
                read as i32
            }
            None => {
                debug!(target: "syscall", "read from bad descriptor {fd}");
                -1
            }
        },
    };
    k.machine.write_register(2, result);
}

fn handle_write(k: &Arc<Kernel>) {
    let user_buffer = k.machine.read_register(4) as u32;
    let size = k.machine.read_register(5);
    let id = k.machine.read_register(6);
    if size <= 0 {
        k.machine.write_register(2, 0);
        return;
    }

    let buf = transfer::read_buffer_from_user(k, user_buffer, size as usize);
    let result = match id {
        CONSOLE_INPUT => {
            debug!(target: "syscall", "cannot write to console input");
            0
        }
        CONSOLE_OUTPUT => {
            k.synch_console.write(k, &buf);
            size
        }
        fd => match k.current_thread().file_get(fd) {
            Some(file) => file.write(k, &buf) as i32,
            None => {
                debug!(target: "syscall", "write to bad descriptor {fd}");
                -1
            }
        },
    };
    k.machine.write_register(2, result);
}

/// Entry of every `Exec`'d thread: set up the registers and address space,
/// marshal the arguments, and drop into user mode.
pub fn start_process(k: &Arc<Kernel>, args: Option<Vec<String>>) {
    let current = k.current_thread();
    let space = current.space().expect("user thread without an address space");
    space.init_registers(k);
    space.restore_state(k);

    if let Some(args) = args {
        let (argc, argv) = write_args(k, &args);
        k.machine.write_register(4, argc);
        k.machine.write_register(5, argv as i32);
        k.machine
            .write_register(STACK_REG, argv as i32 - 24);
    }
    k.machine.run(k);
}

/// Advance PC past the syscall instruction, keeping the branch-delay pair
/// consistent.
fn increment_pc(k: &Kernel) {
    let pc = k.machine.read_register(PC_REG);
    k.machine.write_register(PREV_PC_REG, pc);
    let pc = k.machine.read_register(NEXT_PC_REG);
    k.machine.write_register(PC_REG, pc);
    k.machine.write_register(NEXT_PC_REG, pc + 4);
}

fn read_user_path(k: &Kernel, reg: usize) -> Option<String> {
    let addr = k.machine.read_register(reg) as u32;
    if addr == 0 {
        debug!(target: "syscall", "null path argument");
        return None;
    }
    let path = transfer::read_string_from_user(k, addr, MAX_PATH_LEN);
    if path.is_none() {
        debug!(target: "syscall", "path argument longer than {MAX_PATH_LEN} bytes");
    }
    path
}

/// Collect the NUL-terminated array of argument strings an `Exec` caller
/// passed.
fn save_args(k: &Kernel, argv_addr: u32) -> Vec<String> {
    let mut args = Vec::new();
    for i in 0..MAX_ARG_COUNT as u32 {
        let ptr = transfer::read_user_word(k, argv_addr + 4 * i);
        if ptr == 0 {
            break;
        }
        match transfer::read_string_from_user(k, ptr, MAX_ARG_LEN) {
            Some(arg) => args.push(arg),
            None => break,
        }
    }
    args
}

/// Push the argument strings and the argv vector onto the child's stack;
/// returns (argc, argv address).
fn write_args(k: &Kernel, args: &[String]) -> (i32, u32) {
    let mut sp = k.machine.read_register(STACK_REG) as u32;
    let mut addresses = Vec::with_capacity(args.len());
    for arg in args {
        sp -= arg.len() as u32 + 1;
        transfer::write_string_to_user(k, arg, sp);
        addresses.push(sp);
    }
    sp &= !3;
    sp -= 4 * (args.len() as u32 + 1);
    for (i, addr) in addresses.iter().enumerate() {
        transfer::write_user_word(k, sp + 4 * i as u32, *addr);
    }
    transfer::write_user_word(k, sp + 4 * args.len() as u32, 0);
    k.machine.write_register(STACK_REG, sp as i32);
    (args.len() as i32, sp)
}
