//! Flattened device tree (FDT) reader.
//!
//! Firmware hands the kernel a pointer to a device-tree blob describing the
//! machine. This module parses the v17 wire format -- big-endian header,
//! 4-byte-aligned structure tokens, separate strings block -- and answers
//! the four questions the rest of the kernel asks:
//!
//! * where is RAM ([`DeviceTree::memory_region`]),
//! * which parts of it are off limits ([`DeviceTree::reserved_regions`]),
//! * where is the console UART ([`DeviceTree::stdout_uart_base`]),
//! * which interrupt controller generation is present
//!   ([`DeviceTree::gic_version`]).
//!
//! Parsing is bounds-checked throughout: a malformed blob yields
//! `KernelError::Malformed`, never a wild read. A missing DTB downgrades to
//! hard-coded QEMU-virt fallbacks at the call sites.

use crate::{
    error::{KernelError, KernelResult},
    mm::MemoryRegion,
};

/// FDT header magic, big-endian on the wire.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Header size in bytes (v17 layout).
const FDT_HEADER_LEN: usize = 40;

/// Fallback UART base when no DTB (or no stdout-path) is available.
pub const FALLBACK_UART_BASE: u64 = 0x0900_0000;
/// Fallback RAM region when no DTB is available (QEMU virt: 1 GiB at 1 GiB).
pub const FALLBACK_MEMORY: MemoryRegion = MemoryRegion::new(0x4000_0000, 0x4000_0000);

/// Interrupt-controller generation, from `compatible` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

/// A parsed view over a device-tree blob.
pub struct DeviceTree<'a> {
    data: &'a [u8],
    off_struct: usize,
    off_strings: usize,
}

impl<'a> DeviceTree<'a> {
    /// Validate the header and construct a reader over `data`.
    pub fn parse(data: &'a [u8]) -> KernelResult<Self> {
        if data.len() < FDT_HEADER_LEN {
            return Err(KernelError::Malformed { what: "FDT header" });
        }
        if be32(data, 0)? != FDT_MAGIC {
            return Err(KernelError::Malformed { what: "FDT magic" });
        }
        let totalsize = be32(data, 4)? as usize;
        let off_struct = be32(data, 8)? as usize;
        let off_strings = be32(data, 12)? as usize;
        if totalsize > data.len() || off_struct >= totalsize || off_strings >= totalsize {
            return Err(KernelError::Malformed { what: "FDT offsets" });
        }
        Ok(Self {
            data: &data[..totalsize],
            off_struct,
            off_strings,
        })
    }

    /// Total size of the blob, from the header.
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Version field from the header.
    pub fn version(&self) -> u32 {
        be32(self.data, 20).unwrap_or(0)
    }

    /// Log a short header summary.
    pub fn dump_info(&self) {
        log::info!(
            "dtb: v{} totalsize={:#x} struct@{:#x} strings@{:#x}",
            self.version(),
            self.total_size(),
            self.off_struct,
            self.off_strings
        );
    }

    /// First `reg` tuple of the first memory node, interpreted with the
    /// root's `#address-cells` / `#size-cells`.
    pub fn memory_region(&self) -> KernelResult<MemoryRegion> {
        let mut cur = Cursor::new(self);
        let mut depth = 0usize;
        let mut addr_cells = 2u32;
        let mut size_cells = 2u32;
        let mut memory_depth: Option<usize> = None;
        let mut device_type_memory = false;

        loop {
            match cur.next()? {
                Token::BeginNode(name) => {
                    depth += 1;
                    if depth == 2 && (name == b"memory" || name.starts_with(b"memory@")) {
                        memory_depth = Some(depth);
                        device_type_memory = false;
                    }
                }
                Token::EndNode => {
                    if memory_depth == Some(depth) {
                        memory_depth = None;
                    }
                    depth = depth.saturating_sub(1);
                }
                Token::Prop { name, data } => {
                    if depth == 1 {
                        if name == b"#address-cells" {
                            addr_cells = be32(data, 0)?;
                        } else if name == b"#size-cells" {
                            size_cells = be32(data, 0)?;
                        }
                    }
                    if memory_depth == Some(depth) {
                        if name == b"device_type" && data.starts_with(b"memory") {
                            device_type_memory = true;
                        }
                        if name == b"reg" && (memory_depth.is_some() || device_type_memory) {
                            let mut off = 0;
                            let base = read_cells(data, &mut off, addr_cells)?;
                            let size = read_cells(data, &mut off, size_cells)?;
                            return Ok(MemoryRegion::new(base, size));
                        }
                    }
                }
                Token::Nop => {}
                Token::End => {
                    return Err(KernelError::NotFound {
                        resource: "memory node",
                        id: 0,
                    })
                }
            }
        }
    }

    /// Lazily iterate `(base, size)` pairs from every child of
    /// `/reserved-memory`. Malformed trailing content simply ends the
    /// iteration.
    pub fn reserved_regions(&self) -> ReservedRegions<'a, '_> {
        ReservedRegions {
            cur: Cursor::new(self),
            depth: 0,
            in_reserved: false,
            addr_cells: 2,
            size_cells: 2,
            reg: None,
        }
    }

    /// Resolve `/chosen/stdout-path` (or `stdout`) to the console UART MMIO
    /// base.
    ///
    /// The property value may carry `:options` or `,tag` suffixes (stripped)
    /// and may be an alias resolved through `/aliases`. The target node's
    /// first `reg` cell pair supplies the base address.
    pub fn stdout_uart_base(&self) -> KernelResult<u64> {
        // Pass 1: stdout token and alias table.
        let mut cur = Cursor::new(self);
        let mut depth = 0usize;
        let mut section = Section::None;
        let mut stdout: Option<&[u8]> = None;
        let mut aliases: [Option<(&[u8], &[u8])>; MAX_ALIASES] = [None; MAX_ALIASES];
        let mut alias_count = 0usize;

        loop {
            match cur.next()? {
                Token::BeginNode(name) => {
                    depth += 1;
                    if depth == 2 {
                        section = if name == b"chosen" {
                            Section::Chosen
                        } else if name == b"aliases" {
                            Section::Aliases
                        } else {
                            Section::None
                        };
                    }
                }
                Token::EndNode => {
                    if depth == 2 {
                        section = Section::None;
                    }
                    depth = depth.saturating_sub(1);
                }
                Token::Prop { name, data } => match section {
                    Section::Chosen if depth == 2 => {
                        if name == b"stdout-path" || name == b"stdout" {
                            stdout = Some(strip_path_token(data));
                        }
                    }
                    Section::Aliases if depth == 2 => {
                        if alias_count < MAX_ALIASES {
                            aliases[alias_count] = Some((name, strip_nul(data)));
                            alias_count += 1;
                        }
                    }
                    _ => {}
                },
                Token::Nop => {}
                Token::End => break,
            }
        }

        let token = stdout.ok_or(KernelError::NotFound {
            resource: "stdout-path",
            id: 0,
        })?;
        let target: &[u8] = if token.first() == Some(&b'/') {
            token
        } else {
            aliases
                .iter()
                .flatten()
                .find(|(name, _)| *name == token)
                .map(|(_, path)| *path)
                .ok_or(KernelError::NotFound {
                    resource: "stdout alias",
                    id: 0,
                })?
        };

        // Pass 2: walk to the node with that absolute path and read reg[0].
        self.find_node_reg_base(target)
    }

    fn find_node_reg_base(&self, target: &[u8]) -> KernelResult<u64> {
        let mut cur = Cursor::new(self);
        let mut path = PathBuf::new();
        let mut depth = 0usize;
        let mut at_target_depth: Option<usize> = None;

        loop {
            match cur.next()? {
                Token::BeginNode(name) => {
                    depth += 1;
                    if depth > 1 {
                        path.push(name);
                    }
                    if path.as_bytes() == target {
                        at_target_depth = Some(depth);
                    }
                }
                Token::EndNode => {
                    if at_target_depth == Some(depth) {
                        at_target_depth = None;
                    }
                    if depth > 1 {
                        path.pop();
                    }
                    depth = depth.saturating_sub(1);
                }
                Token::Prop { name, data } => {
                    if at_target_depth == Some(depth) && name == b"reg" {
                        // Addresses are one or two 32-bit cells; the UART
                        // fits the first tuple's address.
                        return if data.len() >= 8 {
                            Ok((u64::from(be32(data, 0)?) << 32) | u64::from(be32(data, 4)?))
                        } else if data.len() >= 4 {
                            Ok(u64::from(be32(data, 0)?))
                        } else {
                            Err(KernelError::Malformed { what: "reg property" })
                        };
                    }
                }
                Token::Nop => {}
                Token::End => {
                    return Err(KernelError::NotFound {
                        resource: "stdout node",
                        id: 0,
                    })
                }
            }
        }
    }

    /// GIC generation: v3 if any node's `compatible` list contains
    /// `arm,gic-v3`, else v2.
    pub fn gic_version(&self) -> GicVersion {
        let mut cur = Cursor::new(self);
        loop {
            match cur.next() {
                Ok(Token::Prop { name, data }) => {
                    if name == b"compatible" && contains(data, b"arm,gic-v3") {
                        return GicVersion::V3;
                    }
                }
                Ok(Token::End) | Err(_) => return GicVersion::V2,
                Ok(_) => {}
            }
        }
    }
}

const MAX_ALIASES: usize = 16;

#[derive(PartialEq, Eq, Clone, Copy)]
enum Section {
    None,
    Chosen,
    Aliases,
}

// ---------------------------------------------------------------------------
// Structure-block cursor
// ---------------------------------------------------------------------------

enum Token<'a> {
    BeginNode(&'a [u8]),
    EndNode,
    Prop { name: &'a [u8], data: &'a [u8] },
    Nop,
    End,
}

struct Cursor<'a, 'b> {
    dt: &'b DeviceTree<'a>,
    pos: usize,
}

impl<'a, 'b> Cursor<'a, 'b> {
    fn new(dt: &'b DeviceTree<'a>) -> Self {
        Self {
            dt,
            pos: dt.off_struct,
        }
    }

    fn next(&mut self) -> KernelResult<Token<'a>> {
        let token = be32(self.dt.data, self.pos)?;
        self.pos += 4;
        match token {
            FDT_BEGIN_NODE => {
                let name = cstr_at(self.dt.data, self.pos)?;
                self.pos += align4(name.len() + 1);
                Ok(Token::BeginNode(name))
            }
            FDT_END_NODE => Ok(Token::EndNode),
            FDT_PROP => {
                let len = be32(self.dt.data, self.pos)? as usize;
                let nameoff = be32(self.dt.data, self.pos + 4)? as usize;
                self.pos += 8;
                let data = self
                    .dt
                    .data
                    .get(self.pos..self.pos + len)
                    .ok_or(KernelError::Malformed { what: "FDT property" })?;
                self.pos += align4(len);
                let name = cstr_at(self.dt.data, self.dt.off_strings + nameoff)?;
                Ok(Token::Prop { name, data })
            }
            FDT_NOP => Ok(Token::Nop),
            FDT_END => Ok(Token::End),
            _ => Err(KernelError::Malformed { what: "FDT token" }),
        }
    }
}

/// Lazy iterator over `/reserved-memory` children, see
/// [`DeviceTree::reserved_regions`].
pub struct ReservedRegions<'a, 'b> {
    cur: Cursor<'a, 'b>,
    depth: usize,
    in_reserved: bool,
    addr_cells: u32,
    size_cells: u32,
    /// Current child `reg` property and the parse offset into it.
    reg: Option<(&'a [u8], usize)>,
}

impl Iterator for ReservedRegions<'_, '_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        loop {
            // Drain tuples from the current reg property first.
            if let Some((data, off)) = self.reg {
                let tuple = 4 * (self.addr_cells + self.size_cells) as usize;
                if tuple > 0 && off + tuple <= data.len() {
                    let mut o = off;
                    let base = read_cells(data, &mut o, self.addr_cells).ok()?;
                    let size = read_cells(data, &mut o, self.size_cells).ok()?;
                    self.reg = Some((data, o));
                    if size != 0 {
                        return Some(MemoryRegion::new(base, size));
                    }
                    continue;
                }
                self.reg = None;
            }

            match self.cur.next() {
                Ok(Token::BeginNode(name)) => {
                    self.depth += 1;
                    if self.depth == 2 && name.starts_with(b"reserved-memory") {
                        self.in_reserved = true;
                        self.addr_cells = 2;
                        self.size_cells = 2;
                    }
                }
                Ok(Token::EndNode) => {
                    if self.depth == 2 {
                        self.in_reserved = false;
                    }
                    self.depth = self.depth.saturating_sub(1);
                }
                Ok(Token::Prop { name, data }) => {
                    if self.in_reserved && self.depth == 2 {
                        if name == b"#address-cells" {
                            self.addr_cells = be32(data, 0).ok()?;
                        } else if name == b"#size-cells" {
                            self.size_cells = be32(data, 0).ok()?;
                        }
                    } else if self.in_reserved && self.depth == 3 && name == b"reg" {
                        self.reg = Some((data, 0));
                    }
                }
                Ok(Token::Nop) => {}
                Ok(Token::End) | Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Byte-level helpers
// ---------------------------------------------------------------------------

fn be32(data: &[u8], off: usize) -> KernelResult<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(KernelError::Malformed { what: "FDT data" })
}

/// Concatenate `cells` big-endian 32-bit cells MSB-first.
fn read_cells(data: &[u8], off: &mut usize, cells: u32) -> KernelResult<u64> {
    let mut value = 0u64;
    for _ in 0..cells {
        value = (value << 32) | u64::from(be32(data, *off)?);
        *off += 4;
    }
    Ok(value)
}

fn cstr_at(data: &[u8], off: usize) -> KernelResult<&[u8]> {
    let tail = data
        .get(off..)
        .ok_or(KernelError::Malformed { what: "FDT string" })?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(KernelError::Malformed { what: "FDT string" })?;
    Ok(&tail[..len])
}

const fn align4(x: usize) -> usize {
    (x + 3) & !3
}

/// Strip a stdout-path value down to the path-or-alias token: cut at the
/// first `:` (options) or `,` (tag) and at the terminating NUL.
fn strip_path_token(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .position(|&b| b == 0 || b == b':' || b == b',')
        .unwrap_or(data.len());
    &data[..end]
}

fn strip_nul(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..end]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w == needle)
}

/// Fixed absolute-path buffer for the second stdout pass.
struct PathBuf {
    buf: [u8; 256],
    len: usize,
}

impl PathBuf {
    fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    fn push(&mut self, component: &[u8]) {
        if self.len < self.buf.len() {
            self.buf[self.len] = b'/';
            self.len += 1;
        }
        let n = component.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&component[..n]);
        self.len += n;
    }

    fn pop(&mut self) {
        while self.len > 0 && self.buf[self.len - 1] != b'/' {
            self.len -= 1;
        }
        if self.len > 0 {
            self.len -= 1; // drop the slash
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

// ---------------------------------------------------------------------------
// Boot-time discovery (bare metal only)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod discovery {
    use super::*;
    use crate::sync::GlobalState;

    /// Where the blob ended up, recorded once at boot.
    #[derive(Clone, Copy)]
    pub struct DtbBlob {
        pub addr: u64,
        pub size: usize,
    }

    static DTB: GlobalState<DtbBlob> = GlobalState::new();

    /// Fixed probe slots tried when the boot register is null, before the
    /// aligned memory scan.
    const PROBE_SLOTS: [u64; 4] = [0x4800_0000, 0x7ff0_0000, 0x4400_0000, 0x5000_0000];

    extern "C" {
        static _kernel_end: u8;
    }

    fn magic_at(addr: u64) -> bool {
        // SAFETY: caller restricts probing to RAM addresses on this
        // platform; a 4-byte aligned read of the candidate magic word.
        let word = unsafe { core::ptr::read_volatile(addr as *const u32) };
        u32::from_be(word) == FDT_MAGIC
    }

    fn search() -> Option<u64> {
        for slot in PROBE_SLOTS {
            if magic_at(slot) {
                return Some(slot);
            }
        }
        // SAFETY: linker-provided symbol, address-of only.
        let kernel_end = unsafe { &_kernel_end as *const u8 as u64 };
        let start = (kernel_end + 0xFFFFF) & !0xFFFFF; // 1 MiB aligned
        let mut addr = start;
        while addr < 0x5000_0000 {
            if magic_at(addr) {
                return Some(addr);
            }
            addr += 0x1000;
        }
        None
    }

    /// Locate and record the DTB. `boot_arg` is the pointer firmware left
    /// in the boot argument register (may be zero).
    pub fn init(boot_arg: u64) -> KernelResult<()> {
        let addr = if boot_arg != 0 && magic_at(boot_arg) {
            boot_arg
        } else {
            search().ok_or(KernelError::NotFound {
                resource: "DTB",
                id: 0,
            })?
        };

        // SAFETY: addr holds a verified FDT magic; the header is 40 bytes
        // of RAM at minimum, and parse() re-validates totalsize.
        let header = unsafe { core::slice::from_raw_parts(addr as *const u8, FDT_HEADER_LEN) };
        let size = be32(header, 4)? as usize;
        DTB.init(DtbBlob { addr, size })
            .map_err(|_| KernelError::AlreadyExists {
                resource: "DTB",
                id: 0,
            })?;
        Ok(())
    }

    /// Run `f` against the parsed device tree, if one was found at boot.
    pub fn with_tree<R>(f: impl FnOnce(&DeviceTree) -> R) -> Option<R> {
        let blob = DTB.with(|b| *b)?;
        // SAFETY: init() verified this range holds the blob; it lives in
        // firmware-reserved RAM for the lifetime of the kernel.
        let data = unsafe { core::slice::from_raw_parts(blob.addr as *const u8, blob.size) };
        DeviceTree::parse(data).ok().map(|dt| f(&dt))
    }

    /// The recorded blob location, for the PMM's reserved ranges.
    pub fn blob_region() -> Option<MemoryRegion> {
        DTB.with(|b| MemoryRegion::new(b.addr, b.size as u64))
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use discovery::{blob_region, init, with_tree};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::{vec, vec::Vec};

    use super::*;

    /// Minimal FDT writer for synthesizing test blobs.
    struct FdtBuilder {
        structure: Vec<u8>,
        strings: Vec<u8>,
    }

    impl FdtBuilder {
        fn new() -> Self {
            Self {
                structure: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn begin(&mut self, name: &str) -> &mut Self {
            self.structure.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
            self.structure.extend_from_slice(name.as_bytes());
            self.structure.push(0);
            while self.structure.len() % 4 != 0 {
                self.structure.push(0);
            }
            self
        }

        fn end(&mut self) -> &mut Self {
            self.structure.extend_from_slice(&FDT_END_NODE.to_be_bytes());
            self
        }

        fn prop(&mut self, name: &str, data: &[u8]) -> &mut Self {
            let nameoff = self.strings.len() as u32;
            self.strings.extend_from_slice(name.as_bytes());
            self.strings.push(0);

            self.structure.extend_from_slice(&FDT_PROP.to_be_bytes());
            self.structure
                .extend_from_slice(&(data.len() as u32).to_be_bytes());
            self.structure.extend_from_slice(&nameoff.to_be_bytes());
            self.structure.extend_from_slice(data);
            while self.structure.len() % 4 != 0 {
                self.structure.push(0);
            }
            self
        }

        fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
            self.prop(name, &value.to_be_bytes())
        }

        fn prop_u64_pair(&mut self, name: &str, a: u64, b: u64) -> &mut Self {
            let mut data = Vec::new();
            data.extend_from_slice(&a.to_be_bytes());
            data.extend_from_slice(&b.to_be_bytes());
            self.prop(name, &data)
        }

        fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
            let mut data = Vec::from(value.as_bytes());
            data.push(0);
            self.prop(name, &data)
        }

        fn finish(&mut self) -> Vec<u8> {
            self.structure.extend_from_slice(&FDT_END.to_be_bytes());

            let off_struct = FDT_HEADER_LEN;
            let off_strings = off_struct + self.structure.len();
            let totalsize = off_strings + self.strings.len();

            let mut blob = Vec::with_capacity(totalsize);
            for field in [
                FDT_MAGIC,
                totalsize as u32,
                off_struct as u32,
                off_strings as u32,
                0,                         // off_mem_rsvmap
                17,                        // version
                16,                        // last_comp_version
                0,                         // boot_cpuid_phys
                self.strings.len() as u32, // size_dt_strings
                self.structure.len() as u32,
            ] {
                blob.extend_from_slice(&field.to_be_bytes());
            }
            blob.extend_from_slice(&self.structure);
            blob.extend_from_slice(&self.strings);
            blob
        }
    }

    /// A QEMU-virt-shaped tree: root cells, chosen/aliases, pl011, memory,
    /// reserved-memory with two children, GIC.
    fn sample_blob(gic_compatible: &str) -> Vec<u8> {
        let mut b = FdtBuilder::new();
        b.begin(""); // root
        b.prop_u32("#address-cells", 2);
        b.prop_u32("#size-cells", 2);

        b.begin("chosen");
        b.prop_str("stdout-path", "serial0:115200n8");
        b.end();

        b.begin("aliases");
        b.prop_str("serial0", "/pl011@9000000");
        b.end();

        b.begin("pl011@9000000");
        b.prop_str("compatible", "arm,pl011");
        b.prop_u64_pair("reg", 0x0900_0000, 0x1000);
        b.end();

        b.begin("memory@40000000");
        b.prop_str("device_type", "memory");
        b.prop_u64_pair("reg", 0x4000_0000, 0x4000_0000);
        b.end();

        b.begin("reserved-memory");
        b.prop_u32("#address-cells", 2);
        b.prop_u32("#size-cells", 2);
        b.begin("fw@48000000");
        b.prop_u64_pair("reg", 0x4800_0000, 0x10_0000);
        b.end();
        b.begin("tee@4c000000");
        b.prop_u64_pair("reg", 0x4C00_0000, 0x20_0000);
        b.end();
        b.end(); // reserved-memory

        b.begin("intc@8000000");
        b.prop_str("compatible", gic_compatible);
        b.end();

        b.end(); // root
        b.finish()
    }

    #[test]
    fn rejects_garbage() {
        assert!(DeviceTree::parse(&[0u8; 8]).is_err());
        let mut blob = sample_blob("arm,cortex-a15-gic");
        blob[0] = 0xAA; // break the magic
        assert!(DeviceTree::parse(&blob).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = sample_blob("arm,cortex-a15-gic");
        // totalsize claims more than the slice holds.
        assert!(DeviceTree::parse(&blob[..blob.len() - 8]).is_err());
    }

    #[test]
    fn finds_memory_region() {
        let blob = sample_blob("arm,cortex-a15-gic");
        let dt = DeviceTree::parse(&blob).unwrap();
        let mem = dt.memory_region().unwrap();
        assert_eq!(mem, MemoryRegion::new(0x4000_0000, 0x4000_0000));
    }

    #[test]
    fn memory_region_respects_cell_counts() {
        // 1-cell addresses and sizes.
        let mut b = FdtBuilder::new();
        b.begin("");
        b.prop_u32("#address-cells", 1);
        b.prop_u32("#size-cells", 1);
        b.begin("memory");
        let mut reg = Vec::new();
        reg.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        reg.extend_from_slice(&0x1000_0000u32.to_be_bytes());
        b.prop("reg", &reg);
        b.end();
        b.end();
        let blob = b.finish();

        let dt = DeviceTree::parse(&blob).unwrap();
        let mem = dt.memory_region().unwrap();
        assert_eq!(mem, MemoryRegion::new(0x8000_0000, 0x1000_0000));
    }

    #[test]
    fn reserved_regions_iterates_children() {
        let blob = sample_blob("arm,cortex-a15-gic");
        let dt = DeviceTree::parse(&blob).unwrap();
        let regions: Vec<MemoryRegion> = dt.reserved_regions().collect();
        assert_eq!(
            regions,
            vec![
                MemoryRegion::new(0x4800_0000, 0x10_0000),
                MemoryRegion::new(0x4C00_0000, 0x20_0000),
            ]
        );
    }

    #[test]
    fn no_reserved_memory_node_yields_nothing() {
        let mut b = FdtBuilder::new();
        b.begin("");
        b.begin("memory@40000000");
        b.prop_u64_pair("reg", 0x4000_0000, 0x1000_0000);
        b.end();
        b.end();
        let blob = b.finish();
        let dt = DeviceTree::parse(&blob).unwrap();
        assert_eq!(dt.reserved_regions().count(), 0);
    }

    #[test]
    fn stdout_resolves_through_alias_and_strips_options() {
        let blob = sample_blob("arm,cortex-a15-gic");
        let dt = DeviceTree::parse(&blob).unwrap();
        assert_eq!(dt.stdout_uart_base().unwrap(), 0x0900_0000);
    }

    #[test]
    fn stdout_accepts_absolute_path() {
        let mut b = FdtBuilder::new();
        b.begin("");
        b.begin("chosen");
        b.prop_str("stdout-path", "/soc/uart@10000000");
        b.end();
        b.begin("soc");
        b.begin("uart@10000000");
        b.prop_u64_pair("reg", 0x1000_0000, 0x100);
        b.end();
        b.end();
        b.end();
        let blob = b.finish();
        let dt = DeviceTree::parse(&blob).unwrap();
        assert_eq!(dt.stdout_uart_base().unwrap(), 0x1000_0000);
    }

    #[test]
    fn stdout_missing_is_not_found() {
        let mut b = FdtBuilder::new();
        b.begin("");
        b.begin("chosen");
        b.end();
        b.end();
        let blob = b.finish();
        let dt = DeviceTree::parse(&blob).unwrap();
        assert!(matches!(
            dt.stdout_uart_base(),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn gic_version_detection() {
        let dt2 = sample_blob("arm,cortex-a15-gic");
        let dt3 = sample_blob("arm,gic-v3");
        assert_eq!(
            DeviceTree::parse(&dt2).unwrap().gic_version(),
            GicVersion::V2
        );
        assert_eq!(
            DeviceTree::parse(&dt3).unwrap().gic_version(),
            GicVersion::V3
        );
    }

    #[test]
    fn header_summary_fields() {
        let blob = sample_blob("arm,gic-v3");
        let dt = DeviceTree::parse(&blob).unwrap();
        assert_eq!(dt.version(), 17);
        assert_eq!(dt.total_size(), blob.len());
    }
}
