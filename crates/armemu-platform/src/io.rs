//! Memory-mapped I/O dispatch for board peripherals.
//!
//! Guest physical accesses that land inside a peripheral window are routed to that peripheral,
//! with the offset rebased to the window start.

/// A peripheral exposing a memory-mapped register window.
///
/// `offset` is relative to the start of the window the device was registered at. `size` is the
/// access width in bytes; ARM guests issue 1, 2 and 4 byte accesses.
pub trait MmioDevice {
    fn mmio_read(&mut self, offset: u64, size: usize) -> u32;
    fn mmio_write(&mut self, offset: u64, size: usize, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

struct RangeDevice {
    base: u64,
    len: u64,
    dev: Box<dyn MmioDevice + Send>,
}

impl RangeDevice {
    fn end_exclusive(&self) -> u64 {
        self.base + self.len
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end_exclusive()
    }
}

/// Value returned for accesses that hit no device (the bus floats high).
fn open_bus(size: usize) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[derive(Default)]
pub struct MmioBus {
    ranges: Vec<RangeDevice>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `dev` over `[base, base + len)`.
    ///
    /// Ranges are kept sorted by base address; overlapping ranges are a wiring bug and panic.
    pub fn register_range(&mut self, base: u64, len: u64, dev: Box<dyn MmioDevice + Send>) {
        assert!(len != 0, "MMIO range length must be non-zero");
        let end_exclusive = base
            .checked_add(len)
            .unwrap_or_else(|| panic!("MMIO range wraps: base={base:#x} len={len:#x}"));

        let idx = self.ranges.partition_point(|r| r.base < base);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            assert!(
                base >= prev.end_exclusive(),
                "overlapping MMIO ranges: new=[{base:#x}..{end_exclusive:#x}) prev=[{:#x}..{:#x})",
                prev.base,
                prev.end_exclusive()
            );
        }
        if let Some(next) = self.ranges.get(idx) {
            assert!(
                end_exclusive <= next.base,
                "overlapping MMIO ranges: new=[{base:#x}..{end_exclusive:#x}) next=[{:#x}..{:#x})",
                next.base,
                next.end_exclusive()
            );
        }

        self.ranges.insert(idx, RangeDevice { base, len, dev });
    }

    /// Unmap a device previously registered via [`Self::register_range`].
    ///
    /// Returns the removed device if a range exactly matching `(base, len)` exists.
    pub fn unregister_range(&mut self, base: u64, len: u64) -> Option<Box<dyn MmioDevice + Send>> {
        let idx = self.ranges.partition_point(|r| r.base < base);
        let cand = self.ranges.get(idx)?;
        if cand.base != base || cand.len != len {
            return None;
        }
        Some(self.ranges.remove(idx).dev)
    }

    fn find_range_index(&self, addr: u64) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.base <= addr);
        let cand = idx.checked_sub(1)?;
        self.ranges[cand].contains(addr).then_some(cand)
    }

    pub fn read(&mut self, addr: u64, size: usize) -> u32 {
        if size == 0 {
            return 0;
        }
        if !matches!(size, 1 | 2 | 4) {
            return 0xFFFF_FFFF;
        }
        match self.find_range_index(addr) {
            Some(idx) => {
                let range = &mut self.ranges[idx];
                range.dev.mmio_read(addr - range.base, size)
            }
            None => {
                tracing::trace!(addr = format_args!("{addr:#x}"), size, "unmapped MMIO read");
                open_bus(size)
            }
        }
    }

    pub fn write(&mut self, addr: u64, size: usize, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        match self.find_range_index(addr) {
            Some(idx) => {
                let range = &mut self.ranges[idx];
                range.dev.mmio_write(addr - range.base, size, value);
            }
            None => {
                tracing::trace!(addr = format_args!("{addr:#x}"), size, "unmapped MMIO write");
            }
        }
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        self.read(addr, 4)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, 4, value);
    }

    pub fn reset(&mut self) {
        for range in self.ranges.iter_mut() {
            range.dev.reset();
        }
    }
}
