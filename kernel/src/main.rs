//! Bare-metal kernel binary.
//!
//! The boot stub (assembly, external to this crate) sets up a stack,
//! parks secondary CPUs, and calls `kernel_main` with the firmware DTB
//! pointer still in hand. Everything else lives in the library crate.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use ferrite_kernel::{bootstrap, klog};

    /// C-ABI kernel entry, called by the boot stub.
    #[no_mangle]
    pub extern "C" fn kernel_main(dtb_ptr: u64) -> ! {
        bootstrap::run(dtb_ptr)
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        use core::fmt::Write;

        // Log through the ring (console mirror included), then force the
        // banner out even if logging is not up yet.
        struct PanicBuf {
            buf: [u8; 256],
            len: usize,
        }
        impl Write for PanicBuf {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let n = s.len().min(self.buf.len() - self.len);
                self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
                self.len += n;
                Ok(())
            }
        }

        let mut msg = PanicBuf {
            buf: [0; 256],
            len: 0,
        };
        let _ = write!(msg, "kernel panic - not syncing: {}\n", info);
        if let Ok(text) = core::str::from_utf8(&msg.buf[..msg.len]) {
            klog::write(klog::Level::Emerg, text);
        }

        ferrite_kernel::panic::shutdown()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel proper only runs on the bare-metal target; this stub
    // keeps host builds (and `cargo test`) linking.
}
