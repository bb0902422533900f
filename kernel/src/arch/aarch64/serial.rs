//! PL011 UART console output.
//!
//! The kernel only needs byte output on the firmware-initialized UART. The
//! base address defaults to the QEMU virt PL011 and is replaced with the
//! DTB-discovered address during boot. The TX-full poll is bounded so a
//! wedged UART degrades to dropped characters instead of a hung kernel.

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Data register.
const UARTDR: u64 = 0x000;
/// Flag register.
const UARTFR: u64 = 0x018;
/// Flag register: transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;

/// Bound on the TX-full busy wait.
const TX_SPIN_LIMIT: u32 = 100_000;

static UART_BASE: AtomicU64 = AtomicU64::new(crate::dtb::FALLBACK_UART_BASE);

/// Point the console at a different PL011 instance (from the DTB).
pub fn set_base(base: u64) {
    UART_BASE.store(base, Ordering::Release);
}

/// The active UART MMIO base.
pub fn base() -> u64 {
    UART_BASE.load(Ordering::Acquire)
}

/// Write one byte, waiting (bounded) for FIFO space.
pub fn putc(byte: u8) {
    let base = base();
    let mut spins = 0u32;
    // SAFETY: PL011 MMIO registers at the configured base; volatile reads
    // of the flag register and a volatile byte write to the data register.
    unsafe {
        while core::ptr::read_volatile((base + UARTFR) as *const u32) & FR_TXFF != 0 {
            spins += 1;
            if spins >= TX_SPIN_LIMIT {
                return; // drop rather than hang
            }
        }
        core::ptr::write_volatile((base + UARTDR) as *mut u8, byte);
    }
}

/// `fmt::Write` adapter for the console macros.
pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            putc(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = Console.write_fmt(args);
}
