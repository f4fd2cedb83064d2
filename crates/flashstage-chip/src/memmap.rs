//! Memory map for the QUADSPI block.
//!
//! ```text
//! Region              STM32L4/F7/H7     STM32MP1          Size
//! ─────────────────── ───────────────── ───────────────── ────────
//! Register block      0xA000_1000       0x5800_3000       1 KB
//! Mapped flash window 0x9000_0000       0x7000_0000       256 MB
//! ```
//!
//! In memory-mapped mode every load inside the window is turned into a
//! fast-read transaction by the controller; the window offset is the flash
//! address.

/// Register block base on STM32L4/F7/H7.
pub const MCU_REGS_BASE: u64 = 0xA000_1000;
/// Mapped window base on STM32L4/F7/H7.
pub const MCU_WINDOW_BASE: u64 = 0x9000_0000;

/// Register block base on STM32MP1 (Linux-hosted, reachable through `/dev/mem`).
pub const MP1_REGS_BASE: u64 = 0x5800_3000;
/// Mapped window base on STM32MP1.
pub const MP1_WINDOW_BASE: u64 = 0x7000_0000;

/// Size of the mapped window decode range.
pub const WINDOW_SIZE: u64 = 256 * 1024 * 1024;

/// Placement of the controller in a physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Physical base of the register block.
    pub regs_base: u64,
    /// Physical base of the mapped window.
    pub window_base: u64,
}

impl Placement {
    /// Placement on STM32L4/F7/H7 microcontrollers.
    pub const MCU: Self = Self {
        regs_base: MCU_REGS_BASE,
        window_base: MCU_WINDOW_BASE,
    };

    /// Placement on STM32MP1.
    pub const MP1: Self = Self {
        regs_base: MP1_REGS_BASE,
        window_base: MP1_WINDOW_BASE,
    };

    /// CPU address of a flash offset while in memory-mapped mode.
    ///
    /// Returns `None` when the offset falls outside the window.
    #[must_use]
    pub const fn window_address(&self, flash_offset: u32) -> Option<u64> {
        if (flash_offset as u64) < WINDOW_SIZE {
            Some(self.window_base + flash_offset as u64)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_address_offsets_from_base() {
        assert_eq!(Placement::MCU.window_address(0xF004), Some(0x9000_F004));
        assert_eq!(Placement::MP1.window_address(0), Some(0x7000_0000));
        assert_eq!(Placement::MCU.window_address(0x1000_0000), None);
    }
}
