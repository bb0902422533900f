//! Ring-buffered kernel log.
//!
//! Sits between the formatting layer and the console: every record is a
//! `(level, len, payload)` triple laid out contiguously in a fixed byte
//! ring, with header and payload free to wrap at the ring boundary. One
//! byte is always left unused so a full ring and an empty ring are
//! distinguishable. When space runs out, whole oldest records are dropped
//! -- records are never torn.
//!
//! Records at or below the console threshold are additionally mirrored to
//! the console sink immediately, prefixed with the syslog-style `<n>`
//! severity marker. The ring itself is guarded by an IRQ-masking lock
//! because IRQ handlers log too.
//!
//! The [`logger`] submodule adapts the `log` crate facade onto this ring so
//! `log::info!` and friends are the kernel-wide logging API.

use crate::sync::IrqSafeMutex;

/// Ring capacity in bytes (build-time constant).
pub const RING_SIZE: usize = 4096;

/// Record header: level byte plus 16-bit payload length.
const HDR_SIZE: usize = 3;

/// Longest storable payload; longer messages are truncated.
pub const MAX_PAYLOAD: usize = RING_SIZE - HDR_SIZE - 1;

/// Syslog-style severity. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Level {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Emerg,
            1 => Self::Alert,
            2 => Self::Crit,
            3 => Self::Err,
            4 => Self::Warning,
            5 => Self::Notice,
            6 => Self::Info,
            _ => Self::Debug,
        }
    }

    /// Console prefix, `<0>` through `<7>`.
    fn prefix(self) -> &'static [u8; 3] {
        match self {
            Self::Emerg => b"<0>",
            Self::Alert => b"<1>",
            Self::Crit => b"<2>",
            Self::Err => b"<3>",
            Self::Warning => b"<4>",
            Self::Notice => b"<5>",
            Self::Info => b"<6>",
            Self::Debug => b"<7>",
        }
    }
}

/// Byte sink for the console mirror.
pub type ConsoleSink = fn(u8);

/// Log state: the byte ring plus thresholds and the console sink.
pub struct Klog {
    buf: [u8; RING_SIZE],
    head: usize,
    tail: usize,
    stored_level: Level,
    console_level: Level,
    sink: Option<ConsoleSink>,
}

impl Klog {
    /// Empty log with default thresholds (Info) and no console sink.
    pub const fn new() -> Self {
        Self {
            buf: [0; RING_SIZE],
            head: 0,
            tail: 0,
            stored_level: Level::Info,
            console_level: Level::Info,
            sink: None,
        }
    }

    /// Reset positions and thresholds, and install the console sink.
    pub fn init(&mut self, sink: Option<ConsoleSink>) {
        self.head = 0;
        self.tail = 0;
        self.stored_level = Level::Info;
        self.console_level = Level::Info;
        self.sink = sink;
    }

    /// Threshold for storing records in the ring (inclusive).
    pub fn set_stored_level(&mut self, level: Level) {
        self.stored_level = level;
    }

    /// Threshold for mirroring records to the console (inclusive).
    pub fn set_console_level(&mut self, level: Level) {
        self.console_level = level;
    }

    /// Replace the console sink.
    pub fn set_console_sink(&mut self, sink: Option<ConsoleSink>) {
        self.sink = sink;
    }

    /// Write one record. Returns the number of payload bytes stored (which
    /// may be less than `msg.len()` after truncation, or zero when the
    /// record was console-only).
    pub fn write(&mut self, level: Level, msg: &str) -> usize {
        if let Some(sink) = self.sink {
            if level <= self.console_level {
                for &b in level.prefix() {
                    sink(b);
                }
                for &b in msg.as_bytes() {
                    sink(b);
                }
            }
        }

        if level > self.stored_level {
            return 0;
        }

        let payload = &msg.as_bytes()[..msg.len().min(MAX_PAYLOAD)];
        let need = HDR_SIZE + payload.len();
        while self.space() < need {
            self.drop_oldest();
        }

        let hdr = [
            level as u8,
            (payload.len() & 0xFF) as u8,
            (payload.len() >> 8) as u8,
        ];
        self.put(&hdr);
        self.put(payload);
        payload.len()
    }

    /// Pop the oldest record into `out`, truncating to `out.len() - 1` and
    /// NUL-terminating. Returns the copied length and the record level, or
    /// `None` when the ring is empty (or `out` cannot hold the terminator).
    pub fn read(&mut self, out: &mut [u8]) -> Option<(usize, Level)> {
        if out.is_empty() || self.head == self.tail {
            return None;
        }

        let mut hdr = [0u8; HDR_SIZE];
        self.take(&mut hdr);
        let level = Level::from_u8(hdr[0]);
        let len = usize::from(hdr[1]) | (usize::from(hdr[2]) << 8);

        let to_copy = len.min(out.len() - 1);
        let mut copied = 0;
        let mut pos = self.tail;
        while copied < to_copy {
            out[copied] = self.buf[pos];
            pos = (pos + 1) % RING_SIZE;
            copied += 1;
        }
        out[to_copy] = 0;
        // Consume the whole payload even when truncating the copy.
        self.tail = (self.tail + len) % RING_SIZE;
        Some((to_copy, level))
    }

    fn space(&self) -> usize {
        if self.head >= self.tail {
            RING_SIZE - (self.head - self.tail) - 1
        } else {
            self.tail - self.head - 1
        }
    }

    fn drop_oldest(&mut self) {
        let mut hdr = [0u8; HDR_SIZE];
        self.take(&mut hdr);
        let len = usize::from(hdr[1]) | (usize::from(hdr[2]) << 8);
        self.tail = (self.tail + len) % RING_SIZE;
    }

    fn put(&mut self, data: &[u8]) {
        for &b in data {
            self.buf[self.head] = b;
            self.head = (self.head + 1) % RING_SIZE;
        }
    }

    fn take(&mut self, out: &mut [u8]) {
        for slot in out.iter_mut() {
            *slot = self.buf[self.tail];
            self.tail = (self.tail + 1) % RING_SIZE;
        }
    }
}

impl Default for Klog {
    fn default() -> Self {
        Self::new()
    }
}

/// Global log. IRQ-masked: the timer path logs from interrupt context.
static KLOG: IrqSafeMutex<Klog> = IrqSafeMutex::new(Klog::new());

/// Reset the global log and point the console mirror at the platform UART.
pub fn init() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    let sink: Option<ConsoleSink> = Some(crate::arch::aarch64::serial::putc);
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let sink: Option<ConsoleSink> = None;

    KLOG.lock().init(sink);
}

/// Write one record to the global log.
pub fn write(level: Level, msg: &str) -> usize {
    KLOG.lock().write(level, msg)
}

/// Pop the oldest record from the global log.
pub fn read(out: &mut [u8]) -> Option<(usize, Level)> {
    KLOG.lock().read(out)
}

/// Set the global storing threshold.
pub fn set_stored_level(level: Level) {
    KLOG.lock().set_stored_level(level);
}

/// Set the global console threshold.
pub fn set_console_level(level: Level) {
    KLOG.lock().set_console_level(level);
}

/// Replace the global console sink.
pub fn set_console_sink(sink: Option<ConsoleSink>) {
    KLOG.lock().set_console_sink(sink);
}

/// Send raw bytes straight to the console (no severity prefix, nothing
/// stored). This is the `write` syscall's output path.
pub fn console_write(bytes: &[u8]) {
    let sink = KLOG.lock().sink;
    if let Some(sink) = sink {
        for &b in bytes {
            sink(b);
        }
    }
}

pub mod logger {
    //! `log` crate facade over the ring.

    use core::fmt::{self, Write};

    use super::Level;

    struct RingLogger;

    /// Fixed formatting buffer; output beyond the capacity is dropped.
    struct FmtBuf {
        buf: [u8; 256],
        len: usize,
    }

    impl FmtBuf {
        const fn new() -> Self {
            Self {
                buf: [0; 256],
                len: 0,
            }
        }

        fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<bad utf8>")
        }
    }

    impl Write for FmtBuf {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let n = s.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
            self.len += n;
            Ok(())
        }
    }

    impl log::Log for RingLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            let level = match record.level() {
                log::Level::Error => Level::Err,
                log::Level::Warn => Level::Warning,
                log::Level::Info => Level::Info,
                log::Level::Debug | log::Level::Trace => Level::Debug,
            };
            let mut buf = FmtBuf::new();
            let _ = write!(buf, "[{}] {}\n", record.target(), record.args());
            super::write(level, buf.as_str());
        }

        fn flush(&self) {}
    }

    static LOGGER: RingLogger = RingLogger;

    /// Route the `log` macros into the ring. Idempotent: a second call
    /// (possible in tests) is ignored.
    pub fn init() {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Debug);
        }
    }
}
