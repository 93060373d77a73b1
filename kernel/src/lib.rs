//! ObsidianOS kernel library
//!
//! Core of a small preemptive multitasking kernel for x86_64 PCs: physical
//! and virtual memory management, per-core bring-up, trap dispatch with
//! syscall windows, processes and the round-robin-arbitrated scheduler,
//! the VFS, MAC borders and the I/O-tap namespace. The library form
//! exists so the logic-heavy parts build and test on the host target.

#![no_std]

extern crate alloc;

// On bare metal the kernel heap pool backs the global allocator; host
// builds (unit tests, coverage) delegate to the system allocator so test
// code using Vec/String runs normally.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootvars;
pub mod console;
pub mod dms;
pub mod elf;
pub mod error;
pub mod fs;
pub mod iotap;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod ns;
pub mod process;
pub mod ptrbox;
pub mod sched;
pub mod security;
pub mod serial;
pub mod signal;
pub mod syscall;
pub mod time;

pub use error::{Errno, KernelError, KernelResult};
