//! Generic architected timer (CNTP, EL1 physical).
//!
//! The periodic preemption tick programs `CNTP_TVAL_EL0` with one period
//! and re-arms it from the interrupt handler. Time is read from the free-
//! running `CNTPCT_EL0` counter and converted to nanoseconds with a split
//! divide so the multiply cannot overflow.

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_a::registers::{CNTFRQ_EL0, CNTPCT_EL0, CNTP_CTL_EL0, CNTP_TVAL_EL0};
use tock_registers::interfaces::{Readable, Writeable};

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Tick rate the timer was armed with; cached for cheap re-arming.
static TICK_HZ: AtomicU32 = AtomicU32::new(0);

/// Counter frequency reported by firmware.
pub fn frequency() -> u64 {
    CNTFRQ_EL0.get()
}

/// Arm the periodic timer at `hz` and enable it. The matching interrupt
/// (PPI 30) still has to be enabled at the GIC.
pub fn init(hz: u32) {
    TICK_HZ.store(hz, Ordering::Release);
    let freq = frequency();
    log::info!("timer: counter {} Hz, tick {} Hz", freq, hz);

    CNTP_CTL_EL0.set(0);
    CNTP_TVAL_EL0.set(freq / u64::from(hz));
    CNTP_CTL_EL0.set(1);
}

/// Reprogram the compare register for the next period. Called from the
/// timer interrupt handler.
pub fn rearm() {
    let hz = TICK_HZ.load(Ordering::Acquire);
    if hz != 0 {
        CNTP_TVAL_EL0.set(frequency() / u64::from(hz));
    }
}

/// Monotonic nanoseconds since counter start.
pub fn now_ns() -> u64 {
    let cnt = CNTPCT_EL0.get();
    let freq = frequency().max(1);
    (cnt / freq) * NSEC_PER_SEC + (cnt % freq) * NSEC_PER_SEC / freq
}

/// Busy-wait for `us` microseconds against the hardware counter.
pub fn udelay(us: u32) {
    let freq = frequency();
    let start = CNTPCT_EL0.get();
    let delta = u64::from(us) * freq / 1_000_000;
    while CNTPCT_EL0.get().wrapping_sub(start) < delta {
        core::hint::spin_loop();
    }
}
