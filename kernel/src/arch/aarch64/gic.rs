//! Generic Interrupt Controller, v2 and v3.
//!
//! The kernel consumes the GIC through a deliberately small surface:
//! acknowledge, end-of-interrupt, enable and disable by IRQ number, plus
//! one-time bring-up. GICv2 does everything through the distributor
//! (GICD) and CPU-interface (GICC) MMIO blocks; GICv3 keeps the
//! distributor MMIO for enable/disable but moves the CPU interface to the
//! `ICC_*` system registers. The generation is chosen at init from the
//! device tree's `arm,gic-v3` compatible.
//!
//! ## Interrupt ID ranges
//!
//! - SGIs 0-15, PPIs 16-31 (banked per CPU; PPI 30 is the physical timer)
//! - SPIs 32-1019; 1023 is the spurious ID

use core::ptr;

use spin::Mutex;

use crate::{
    dtb::GicVersion,
    error::{KernelError, KernelResult},
    sync::GlobalState,
};

/// GIC distributor base on the QEMU virt machine (fallback).
pub const GICD_BASE: u64 = 0x0800_0000;
/// GICv2 CPU interface base on the QEMU virt machine (fallback).
pub const GICC_BASE: u64 = 0x0801_0000;

// Distributor registers.
const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_IGROUPR: u64 = 0x080;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR: u64 = 0xC00;

// CPU interface registers (GICv2).
const GICC_CTLR: u64 = 0x000;
const GICC_PMR: u64 = 0x004;
const GICC_BPR: u64 = 0x008;
const GICC_IAR: u64 = 0x00C;
const GICC_EOIR: u64 = 0x010;

/// Spurious interrupt ID.
const SPURIOUS: u32 = 1023;

/// Default SPI priority (lower value = higher priority).
const DEFAULT_SPI_PRIORITY: u8 = 0xA0;

const MAX_GIC_IRQS: u32 = 1020;

struct Gic {
    version: GicVersion,
    gicd_base: u64,
    gicc_base: u64,
    num_irqs: u32,
}

impl Gic {
    fn gicd_read(&self, offset: u64) -> u32 {
        // SAFETY: volatile MMIO read within the distributor register block.
        unsafe { ptr::read_volatile((self.gicd_base + offset) as *const u32) }
    }

    fn gicd_write(&self, offset: u64, value: u32) {
        // SAFETY: volatile MMIO write within the distributor register block.
        unsafe { ptr::write_volatile((self.gicd_base + offset) as *mut u32, value) }
    }

    fn gicc_read(&self, offset: u64) -> u32 {
        // SAFETY: volatile MMIO read within the CPU-interface block (v2).
        unsafe { ptr::read_volatile((self.gicc_base + offset) as *const u32) }
    }

    fn gicc_write(&self, offset: u64, value: u32) {
        // SAFETY: volatile MMIO write within the CPU-interface block (v2).
        unsafe { ptr::write_volatile((self.gicc_base + offset) as *mut u32, value) }
    }

    fn barrier() {
        crate::arch::barriers::data_sync_inst_sync();
    }

    /// Distributor bring-up, common to both generations: everything to
    /// group 0, disabled, default priority, CPU 0, level-triggered.
    fn init_distributor(&mut self) {
        self.gicd_write(GICD_CTLR, 0);
        Self::barrier();

        let typer = self.gicd_read(GICD_TYPER);
        self.num_irqs = (((typer & 0x1F) + 1) * 32).min(MAX_GIC_IRQS);
        let num_regs = (self.num_irqs / 32) as u64;

        // Register 0 covers the banked SGIs/PPIs; leave it to reset state.
        for i in 1..num_regs {
            self.gicd_write(GICD_IGROUPR + i * 4, 0);
            self.gicd_write(GICD_ICENABLER + i * 4, 0xFFFF_FFFF);
        }

        let prio = u32::from_be_bytes([DEFAULT_SPI_PRIORITY; 4]);
        for i in 8..u64::from(self.num_irqs / 4) {
            self.gicd_write(GICD_IPRIORITYR + i * 4, prio);
        }
        for i in 8..u64::from(self.num_irqs / 4) {
            self.gicd_write(GICD_ITARGETSR + i * 4, 0x0101_0101);
        }
        for i in 2..u64::from(self.num_irqs / 16) {
            self.gicd_write(GICD_ICFGR + i * 4, 0);
        }
        Self::barrier();

        self.gicd_write(GICD_CTLR, 1);
        Self::barrier();
    }

    fn init_cpu_interface(&self) {
        match self.version {
            GicVersion::V2 => {
                self.gicc_write(GICC_PMR, 0xFF);
                self.gicc_write(GICC_BPR, 0);
                self.gicc_write(GICC_CTLR, 1);
            }
            GicVersion::V3 => {
                // SAFETY: ICC_* system registers exist whenever the DTB
                // advertises a GICv3; plain priority-mask and group-enable
                // writes plus the mandatory sysreg-enable.
                unsafe {
                    core::arch::asm!(
                        "msr icc_sre_el1, {sre}",
                        "isb",
                        "msr icc_pmr_el1, {pmr}",
                        "msr icc_igrpen1_el1, {grp}",
                        "isb",
                        sre = in(reg) 1u64,
                        pmr = in(reg) 0xFFu64,
                        grp = in(reg) 1u64,
                        options(nostack, preserves_flags)
                    );
                }
            }
        }
        Self::barrier();
    }

    fn enable_irq(&self, irq: u32) {
        if irq >= self.num_irqs {
            return;
        }
        let reg = u64::from(irq / 32) * 4;
        self.gicd_write(GICD_ISENABLER + reg, 1 << (irq % 32));
        Self::barrier();
    }

    fn disable_irq(&self, irq: u32) {
        if irq >= self.num_irqs {
            return;
        }
        let reg = u64::from(irq / 32) * 4;
        self.gicd_write(GICD_ICENABLER + reg, 1 << (irq % 32));
        Self::barrier();
    }

    fn ack(&self) -> Option<u32> {
        let iar = match self.version {
            GicVersion::V2 => self.gicc_read(GICC_IAR),
            GicVersion::V3 => {
                let v: u64;
                // SAFETY: read of the interrupt-acknowledge sysreg.
                unsafe {
                    core::arch::asm!("mrs {v}, icc_iar1_el1", v = out(reg) v,
                        options(nostack, preserves_flags));
                }
                v as u32
            }
        };
        let irq = iar & 0x3FF;
        if irq == SPURIOUS {
            None
        } else {
            Some(irq)
        }
    }

    fn eoi(&self, irq: u32) {
        match self.version {
            GicVersion::V2 => self.gicc_write(GICC_EOIR, irq),
            GicVersion::V3 => {
                // SAFETY: write of the end-of-interrupt sysreg.
                unsafe {
                    core::arch::asm!("msr icc_eoir1_el1, {v}", v = in(reg) u64::from(irq),
                        options(nostack, preserves_flags));
                }
            }
        }
    }
}

static GIC: GlobalState<Mutex<Gic>> = GlobalState::new();

/// Bring up the interrupt controller.
///
/// `version` comes from the DTB (default v2); the base addresses fall back
/// to the QEMU virt layout when discovery found nothing better.
pub fn init(version: GicVersion, gicd_base: u64, gicc_base: u64) -> KernelResult<()> {
    let mut gic = Gic {
        version,
        gicd_base,
        gicc_base,
        num_irqs: 0,
    };
    gic.init_distributor();
    gic.init_cpu_interface();
    log::info!(
        "gic: {:?} initialized, {} interrupt lines",
        version,
        gic.num_irqs
    );

    GIC.init(Mutex::new(gic))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "GIC",
            id: 0,
        })
}

/// Unmask an interrupt line at the distributor.
pub fn enable_irq(irq: u32) {
    GIC.with(|m| m.lock().enable_irq(irq));
}

/// Mask an interrupt line at the distributor.
pub fn disable_irq(irq: u32) {
    GIC.with(|m| m.lock().disable_irq(irq));
}

/// Acknowledge the highest-priority pending interrupt. `None` when the
/// read was spurious. The caller must [`eoi`] the returned ID.
pub fn ack() -> Option<u32> {
    GIC.with(|m| m.lock().ack()).flatten()
}

/// Signal end-of-interrupt for an ID previously returned by [`ack`].
pub fn eoi(irq: u32) {
    GIC.with(|m| m.lock().eoi(irq));
}
