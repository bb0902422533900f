//! IRQ dispatch.
//!
//! A fixed table maps IRQ numbers to `(handler, cookie)` pairs. The
//! architecture's interrupt entry calls [`handle_irq`], which acknowledges
//! the interrupt at the GIC, dispatches to the registered handler (unknown
//! IRQs are silently dropped), and signals end-of-interrupt with the same
//! ID it acknowledged -- EOI always matches ack, even for IRQs nobody
//! registered.
//!
//! The periodic timer lives here too: its handler bumps the tick counter,
//! reprograms the compare register for the next period, and hands the trap
//! frame to the scheduler when the running task's slice is spent.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sched::task::TrapFrame,
};

/// Number of dispatch slots (covers SGIs, PPIs and SPIs).
pub const MAX_IRQS: usize = 1024;

/// Physical timer PPI on the QEMU virt machine.
pub const TIMER_IRQ: u32 = 30;

/// Timer tick rate.
pub const HZ: u32 = 100;

/// Handler signature: IRQ number, trap frame, registration cookie.
pub type IrqHandler = fn(irq: u32, frame: &mut TrapFrame, cookie: usize);

#[derive(Clone, Copy)]
struct IrqEntry {
    handler: IrqHandler,
    cookie: usize,
}

/// The dispatch table.
pub struct IrqTable {
    entries: [Option<IrqEntry>; MAX_IRQS],
}

impl IrqTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_IRQS],
        }
    }

    /// Register a handler. Rejects out-of-range slots and duplicates.
    pub fn install(&mut self, irq: u32, handler: IrqHandler, cookie: usize) -> KernelResult<()> {
        let slot = irq as usize;
        if slot >= MAX_IRQS {
            return Err(KernelError::OutOfRange {
                name: "irq",
                value: u64::from(irq),
            });
        }
        if self.entries[slot].is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "IRQ handler",
                id: u64::from(irq),
            });
        }
        self.entries[slot] = Some(IrqEntry { handler, cookie });
        Ok(())
    }

    /// Drop the registration for `irq`, if any.
    pub fn uninstall(&mut self, irq: u32) {
        if let Some(slot) = self.entries.get_mut(irq as usize) {
            *slot = None;
        }
    }

    fn lookup(&self, irq: u32) -> Option<IrqEntry> {
        self.entries.get(irq as usize).copied().flatten()
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

static IRQ_TABLE: Mutex<IrqTable> = Mutex::new(IrqTable::new());

/// Reset the dispatch table.
pub fn init() {
    *IRQ_TABLE.lock() = IrqTable::new();
}

/// Register a handler for `irq`.
pub fn install(irq: u32, handler: IrqHandler, cookie: usize) -> KernelResult<()> {
    IRQ_TABLE.lock().install(irq, handler, cookie)
}

/// Remove the handler for `irq`.
pub fn uninstall(irq: u32) {
    IRQ_TABLE.lock().uninstall(irq)
}

/// Invoke the handler registered for `irq`, if any.
///
/// The entry is copied out before the call so handlers are free to use the
/// IRQ API themselves.
pub fn dispatch(frame: &mut TrapFrame, irq: u32) {
    let entry = IRQ_TABLE.lock().lookup(irq);
    if let Some(e) = entry {
        (e.handler)(irq, frame, e.cookie);
    }
}

/// Unmask `irq` at the interrupt controller.
pub fn enable(irq: u32) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::gic::enable_irq(irq);
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = irq;
}

/// Mask `irq` at the interrupt controller.
pub fn disable(irq: u32) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::gic::disable_irq(irq);
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = irq;
}

/// Top-level interrupt entry: GIC ack, dispatch, EOI.
///
/// EOI is issued for exactly the acknowledged ID even when no handler is
/// registered; a spurious ack (1023) produces neither dispatch nor EOI.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn handle_irq(frame: &mut TrapFrame) {
    use crate::arch::aarch64::gic;

    let Some(irq) = gic::ack() else {
        return; // spurious
    };
    if irq < 1020 {
        dispatch(frame, irq);
    }
    gic::eoi(irq);
}

// ---------------------------------------------------------------------------
// Timer tick
// ---------------------------------------------------------------------------

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since the timer was armed (HZ per second).
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Timer interrupt handler: count the tick, rearm the compare register,
/// and preempt the current task if its slice is spent.
///
/// The scheduler lock is taken with `try_lock`: if the interrupted code
/// held it, preemption simply waits for the next tick.
fn timer_handler(_irq: u32, frame: &mut TrapFrame, _cookie: usize) {
    TICKS.fetch_add(1, Ordering::SeqCst);
    crate::arch::timer_rearm();

    let now = crate::arch::now_ns();
    if let Some(mut sched) = crate::sched::SCHEDULER.try_lock() {
        sched.tick_preempt(frame, now);
    }
}

/// Register and start the periodic preemption timer.
pub fn init_timer() -> KernelResult<()> {
    install(TIMER_IRQ, timer_handler, 0)?;
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::timer::init(HZ);
    enable(TIMER_IRQ);
    Ok(())
}
