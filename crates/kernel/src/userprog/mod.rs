//! The user-program side of the kernel: the blocking console and the
//! syscall dispatcher.

pub mod exception;
pub mod synch_console;

pub use synch_console::SynchConsole;
