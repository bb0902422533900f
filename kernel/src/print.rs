// Console print macros. On the bare-metal target they write straight to
// the PL011; host builds type-check the format arguments and discard them.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::arch::aarch64::serial::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[macro_export]
macro_rules! kprintln {
    () => {};
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}
