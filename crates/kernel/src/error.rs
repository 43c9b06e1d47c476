//! Kernel error kinds.
//!
//! Recoverable conditions surface as `KernelError` and travel up to the
//! syscall boundary, where they become a -1 result for user code.  Kernel
//! invariant violations (releasing a lock that is not held, a bitmap
//! mismatch on deallocation, exhausted user-memory retries) are programming
//! errors and abort via `panic!` instead of taking this path.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("no space left on disk")]
    NoSpace,
    #[error("file would exceed the maximum file size")]
    FileTooLarge,
    #[error("file name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("directory is open elsewhere")]
    DirectoryInUse,
    #[error("file has a pending removal")]
    RemovePending,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad user-space address")]
    BadAddress,
    #[error("not a valid executable")]
    BadExecutable,
    #[error("no such process")]
    NoSuchProcess,
    #[error("out of physical memory")]
    OutOfFrames,
}

pub type Result<T> = core::result::Result<T, KernelError>;
