//! Kernel-wide error types.
//!
//! Errors in the kernel are categorical rather than deeply typed: an
//! allocator that is out of frames, a misaligned address, an overlapping
//! mapping and a duplicate IRQ registration all surface through a single
//! [`KernelError`] enum. Inconsistencies (a corrupted bitmap, a scheduler
//! state/queue mismatch) are not errors -- they panic.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An allocator (frame allocator, heap window, node pool) is exhausted.
    OutOfMemory {
        resource: &'static str,
    },
    /// An address or size did not satisfy an alignment requirement.
    Misaligned {
        addr: u64,
    },
    /// A generic invalid argument (zero size, null pointer, bad fd, ...).
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// A value was outside its permitted range (IRQ number, PID, ...).
    OutOfRange {
        name: &'static str,
        value: u64,
    },
    /// A requested mapping overlaps an existing one.
    Overlap {
        va: u64,
        size: u64,
    },
    /// A slot or resource is already occupied (IRQ handler, ...).
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    /// A lookup by exact key failed (VMA, task, handler, ...).
    NotFound {
        resource: &'static str,
        id: u64,
    },
    /// A subsystem was used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
    /// Input data (device tree blob) failed structural validation.
    Malformed {
        what: &'static str,
    },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { resource } => write!(f, "out of memory: {}", resource),
            Self::Misaligned { addr } => write!(f, "misaligned address 0x{:x}", addr),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OutOfRange { name, value } => {
                write!(f, "{} out of range: {}", name, value)
            }
            Self::Overlap { va, size } => {
                write!(f, "mapping overlap at 0x{:x} (+0x{:x})", va, size)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::Malformed { what } => write!(f, "malformed {}", what),
        }
    }
}
