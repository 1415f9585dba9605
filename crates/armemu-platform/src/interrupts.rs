//! Interrupt delivery from peripherals to the board's interrupt controller.

use std::sync::atomic::{AtomicU64, Ordering};

/// Level-sensitive interrupt inputs.
///
/// Peripherals call these while holding their own device lock, so implementations must not call
/// back into the peripheral.
pub trait InterruptController: Send + Sync {
    fn raise(&self, line: u32);
    fn clear(&self, line: u32);
}

/// Number of interrupt inputs modelled by [`LevelInterrupts`].
pub const LEVEL_INTERRUPT_LINES: u32 = 64;

/// A flat bank of level-triggered interrupt inputs.
///
/// The CPU core polls [`LevelInterrupts::pending`]; tests inspect individual lines.
#[derive(Debug, Default)]
pub struct LevelInterrupts {
    asserted: AtomicU64,
    raises: AtomicU64,
}

impl LevelInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_asserted(&self, line: u32) -> bool {
        line < LEVEL_INTERRUPT_LINES && self.asserted.load(Ordering::Acquire) & (1 << line) != 0
    }

    /// Bitmap of all asserted lines.
    pub fn pending(&self) -> u64 {
        self.asserted.load(Ordering::Acquire)
    }

    /// Number of low-to-high transitions observed across all lines.
    pub fn raise_count(&self) -> u64 {
        self.raises.load(Ordering::Relaxed)
    }
}

impl InterruptController for LevelInterrupts {
    fn raise(&self, line: u32) {
        if line >= LEVEL_INTERRUPT_LINES {
            tracing::debug!(line, "raise on unmodelled interrupt line");
            return;
        }
        let prev = self.asserted.fetch_or(1 << line, Ordering::AcqRel);
        if prev & (1 << line) == 0 {
            self.raises.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn clear(&self, line: u32) {
        if line >= LEVEL_INTERRUPT_LINES {
            return;
        }
        self.asserted.fetch_and(!(1 << line), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_level_sensitive() {
        let irq = LevelInterrupts::new();
        irq.raise(5);
        irq.raise(5);
        assert!(irq.is_asserted(5));
        assert_eq!(irq.raise_count(), 1);
        assert_eq!(irq.pending(), 1 << 5);

        irq.clear(5);
        assert!(!irq.is_asserted(5));
        irq.raise(5);
        assert_eq!(irq.raise_count(), 2);
    }

    #[test]
    fn out_of_range_lines_are_ignored() {
        let irq = LevelInterrupts::new();
        irq.raise(LEVEL_INTERRUPT_LINES);
        assert_eq!(irq.pending(), 0);
        assert!(!irq.is_asserted(LEVEL_INTERRUPT_LINES));
    }
}
