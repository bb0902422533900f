//! Ferrite kernel library.
//!
//! A small preemptive kernel core for 64-bit ARM virtual platforms: bitmap
//! physical memory manager, 4-level page tables with an RB-tree VMA index,
//! a guarded `vmalloc` heap, a weight-fair (EEVDF-style) scheduler, timer-
//! driven preemption and a ring-buffered log.
//!
//! The crate is `no_std`; on non-bare-metal targets the standard library is
//! linked so the portable core (allocators, trees, scheduler accounting,
//! parsers) runs under the ordinary `#[test]` harness.

#![no_std]

// Host target (unit tests, tooling): use the system allocator so test code
// can use Vec/String normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod dtb;
pub mod error;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod panic;
pub mod rbtree;
pub mod sched;
pub mod sync;
pub mod syscall;

// Re-exports for the binary and for tests.
pub use error::{KernelError, KernelResult};
pub use mm::{MemoryRegion, PhysAddr, VirtAddr, PAGE_SIZE};
pub use sched::{TaskArgs, TaskId};

#[cfg(all(test, not(target_os = "none")))]
mod integration_tests;
