//! User-process memory: address spaces, demand paging, the physical frame
//! registry, and safe byte transfer across the user/kernel boundary.

pub mod address_space;
pub mod coremap;
pub mod executable;
pub mod transfer;

pub use address_space::{AddressSpace, USER_STACK_SIZE};
pub use coremap::Coremap;
pub use executable::Executable;
