//! Exception handlers.
//!
//! The vector stub (boot assembly) saves the register file into a trap
//! frame and calls into these handlers. Synchronous exceptions decode the
//! exception class: SVC is the syscall gate; data and instruction aborts
//! are fatal and logged with their syndrome, fault address and return
//! address before panicking.

use cortex_a::registers::{ELR_EL1, ESR_EL1, FAR_EL1};
use tock_registers::interfaces::Readable;

use crate::sched::task::TrapFrame;

const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3F;

/// SVC from AArch64 state.
const EC_SVC64: u64 = 0x15;
const EC_INSTR_ABORT_SAME: u64 = 0x21;
const EC_DATA_ABORT_SAME: u64 = 0x25;

/// Synchronous exception entry.
#[no_mangle]
pub extern "C" fn handle_sync_exception(frame: &mut TrapFrame) {
    let esr = ESR_EL1.get();
    let ec = (esr >> ESR_EC_SHIFT) & ESR_EC_MASK;

    match ec {
        EC_SVC64 => crate::syscall::handle(frame),
        EC_DATA_ABORT_SAME => fatal("data abort", ec, esr),
        EC_INSTR_ABORT_SAME => fatal("instruction abort", ec, esr),
        _ => fatal("unhandled sync exception", ec, esr),
    }
}

fn fatal(kind: &str, ec: u64, esr: u64) -> ! {
    let far = FAR_EL1.get();
    let elr = ELR_EL1.get();
    log::error!(
        "{}: EC={:#x} ESR={:#x} FAR={:#x} ELR={:#x}",
        kind,
        ec,
        esr,
        far,
        elr
    );
    panic!("{}", kind);
}

/// IRQ exception entry.
#[no_mangle]
pub extern "C" fn handle_irq_exception(frame: &mut TrapFrame) {
    crate::irq::handle_irq(frame);
}

/// FIQ entry: nothing routes FIQs, so just note it.
#[no_mangle]
pub extern "C" fn handle_fiq_exception() {
    log::warn!("unexpected FIQ");
}

/// SError entry: an asynchronous external abort is unrecoverable.
#[no_mangle]
pub extern "C" fn handle_serror_exception() {
    log::error!("SError received");
    panic!("SError");
}
